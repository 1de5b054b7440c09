//! Cluster installation supervisor.

use shipyard_state::{
    Cluster, ClusterInstallation, ClusterInstallationState, Group, Installation, InstallationState,
    Record,
};
use tracing::{debug, warn};

use super::SupervisorDeps;
use crate::error::SupervisorResult;
use crate::scheduler::{Supervisor, WorkFuture};

type S = ClusterInstallationState;

pub struct ClusterInstallationSupervisor {
    deps: SupervisorDeps,
    owner: String,
}

impl ClusterInstallationSupervisor {
    pub fn new(deps: SupervisorDeps) -> Self {
        let owner = deps.owner("cluster_installation");
        Self { deps, owner }
    }

    pub async fn run_once(&self) -> SupervisorResult<()> {
        let cis = self
            .deps
            .store
            .list_all::<ClusterInstallation>(|ci| ci.state != S::Deleted && !ci.meta.api_locked)?;
        for ci in cis {
            if let Err(e) = self.supervise(&ci.id).await {
                warn!(cluster_installation = %ci.id, error = %e, "cluster installation supervision failed");
            }
        }
        Ok(())
    }

    pub async fn supervise(&self, ci_id: &str) -> SupervisorResult<()> {
        let Some(_guard) = self.deps.lock::<ClusterInstallation>(ci_id, &self.owner)? else {
            return Ok(());
        };
        let mut ci = self.deps.store.require::<ClusterInstallation>(ci_id)?;
        if ci.is_deleted() || ci.meta.api_locked || ci.state == S::Deleted {
            return Ok(());
        }
        let recorder = &self.deps.recorder;
        recorder.warn_if_stuck(&ci);

        match ci.state {
            S::CreationRequested | S::CreationFailed => {
                recorder.transition(&mut ci, S::CreationInProgress)?;
            }
            S::ReconcilingFailed => {
                recorder.transition(&mut ci, S::Reconciling)?;
            }
            S::DeletionRequested | S::DeletionFailed => {
                recorder.transition(&mut ci, S::DeletionInProgress)?;
            }
            S::CreationInProgress | S::Reconciling => {
                let failed = if ci.state == S::CreationInProgress {
                    S::CreationFailed
                } else {
                    S::ReconcilingFailed
                };
                self.provision(&mut ci, failed).await?;
            }
            S::Stable => self.check_drift(&mut ci)?,
            S::DeletionInProgress => {
                let installation = self.deps.store.require::<Installation>(&ci.installation_id)?;
                let cluster = self.deps.store.require::<Cluster>(&ci.cluster_id)?;
                match self
                    .deps
                    .backends
                    .installations
                    .delete_cluster_installation(&cluster, &installation, &ci)
                    .await
                {
                    Ok(()) => {
                        recorder.mark_deleted(&mut ci);
                        recorder.transition(&mut ci, S::Deleted)?;
                    }
                    Err(e) => {
                        recorder.fail(&mut ci, S::DeletionFailed, e)?;
                    }
                }
            }
            S::Deleted => {}
        }
        Ok(())
    }

    async fn provision(&self, ci: &mut ClusterInstallation, failed: S) -> SupervisorResult<()> {
        let installation = self.deps.store.require::<Installation>(&ci.installation_id)?;
        let cluster = self.deps.store.require::<Cluster>(&ci.cluster_id)?;
        let group = self.group_of(&installation)?;
        let config = installation.effective_config(group.as_ref());
        match self
            .deps
            .backends
            .installations
            .provision_cluster_installation(&cluster, &installation, ci, &config)
            .await
        {
            Ok(()) => {
                ci.applied_fingerprint = Some(config.fingerprint());
                self.deps.recorder.transition(ci, S::Stable)?;
            }
            Err(e) => {
                self.deps.recorder.fail(ci, failed, e)?;
            }
        }
        Ok(())
    }

    /// Move a stable cluster installation to `reconciling` when what is
    /// deployed no longer matches the installation's effective config.
    ///
    /// Skipped while the installation is busy or hibernating, and while a
    /// group rollout has not reached it yet so `max_rolling` holds.
    fn check_drift(&self, ci: &mut ClusterInstallation) -> SupervisorResult<()> {
        let installation = self.deps.store.require::<Installation>(&ci.installation_id)?;
        if installation.state != InstallationState::Stable {
            return Ok(());
        }
        let group = self.group_of(&installation)?;
        if let Some(group) = &group
            && installation.group_sequence != Some(group.sequence)
        {
            return Ok(());
        }
        let fingerprint = installation.effective_config(group.as_ref()).fingerprint();
        if ci.applied_fingerprint.as_deref() == Some(fingerprint.as_str()) {
            return Ok(());
        }
        debug!(cluster_installation = %ci.id, "effective config drifted");
        self.deps.recorder.transition(ci, S::Reconciling)?;
        Ok(())
    }

    fn group_of(&self, installation: &Installation) -> SupervisorResult<Option<Group>> {
        match &installation.group_id {
            Some(id) => Ok(self.deps.store.get::<Group>(id)?.filter(|g| !g.is_deleted())),
            None => Ok(None),
        }
    }
}

impl Supervisor for ClusterInstallationSupervisor {
    fn name(&self) -> &'static str {
        "cluster_installation"
    }

    fn do_work(&self) -> WorkFuture<'_> {
        Box::pin(self.run_once())
    }
}
