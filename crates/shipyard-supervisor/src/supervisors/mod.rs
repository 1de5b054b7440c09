//! Per-resource supervisors.
//!
//! Every supervisor follows the same pass: list actionable records, and for
//! each one take its reconciliation lock, re-read it, drive at most one
//! transition, persist it with its event and release the lock. A failure on
//! one record is logged and does not stop the pass.

use std::sync::Arc;
use std::time::Duration;

use shipyard_core::{Context, ShipyardConfig};
use shipyard_state::{ClusterInstallation, ClusterInstallationState, Record, StateStore};

use crate::error::SupervisorResult;
use crate::lock::{LockGuard, lock_owner};
use crate::provisioner::Backends;
use crate::recorder::EventRecorder;
use crate::scheduler::Supervisor;

pub mod cluster;
pub mod cluster_installation;
pub mod db_migration;
pub mod deletion;
pub mod group;
pub mod installation;
pub mod operations;
pub mod webhook;

pub use cluster::ClusterSupervisor;
pub use cluster_installation::ClusterInstallationSupervisor;
pub use db_migration::{DbMigrationSupervisor, commit_db_migration, request_db_migration_rollback};
pub use deletion::DeletionSweep;
pub use group::GroupSupervisor;
pub use installation::InstallationSupervisor;
pub use operations::{BackupSupervisor, ImportSupervisor, OperationJob, OperationSupervisor, RestorationSupervisor};
pub use webhook::{HttpWebhookSender, WebhookSender, WebhookSupervisor};

/// What every supervisor works with.
#[derive(Clone, Debug)]
pub struct SupervisorDeps {
    pub store: StateStore,
    pub backends: Backends,
    pub recorder: EventRecorder,
}

impl SupervisorDeps {
    pub fn new(store: StateStore, backends: Backends, ctx: Context, stuck_after: Duration) -> Self {
        let recorder = EventRecorder::new(store.clone(), ctx, stuck_after);
        Self {
            store,
            backends,
            recorder,
        }
    }

    pub fn ctx(&self) -> &Context {
        self.recorder.ctx()
    }

    pub fn now(&self) -> u64 {
        self.ctx().now()
    }

    pub fn owner(&self, component: &str) -> String {
        lock_owner(self.ctx(), component)
    }

    pub(crate) fn lock<R: Record>(&self, id: &str, owner: &str) -> SupervisorResult<Option<LockGuard<R>>> {
        LockGuard::try_acquire(&self.store, id, owner, self.now())
    }

    /// Cluster installations of `installation_id` that are not deleted.
    pub fn live_cluster_installations(
        &self,
        installation_id: &str,
    ) -> SupervisorResult<Vec<ClusterInstallation>> {
        Ok(self.store.list_all::<ClusterInstallation>(|ci| {
            ci.installation_id == installation_id && ci.state != ClusterInstallationState::Deleted
        })?)
    }
}

/// The full supervisor set the daemon runs.
pub fn standard_supervisors(
    deps: &SupervisorDeps,
    config: &ShipyardConfig,
    webhooks: Arc<dyn WebhookSender>,
) -> Vec<Arc<dyn Supervisor>> {
    vec![
        Arc::new(ClusterSupervisor::new(deps.clone(), config.default_rotator())),
        Arc::new(InstallationSupervisor::new(deps.clone(), &config.placement())),
        Arc::new(ClusterInstallationSupervisor::new(deps.clone())),
        Arc::new(BackupSupervisor::new(deps.clone())),
        Arc::new(RestorationSupervisor::new(deps.clone())),
        Arc::new(ImportSupervisor::new(deps.clone())),
        Arc::new(DbMigrationSupervisor::new(deps.clone())),
        Arc::new(GroupSupervisor::new(deps.clone())),
        Arc::new(DeletionSweep::new(deps.clone(), config.deletion_max_updating())),
        Arc::new(WebhookSupervisor::new(
            deps.clone(),
            webhooks,
            config.webhook_failure_threshold(),
        )),
    ]
}
