//! shipyard-api — REST API for the Shipyard control plane.
//!
//! Handlers only write desired state: they validate the request, enforce
//! API and deletion locks, persist the record (with its state change event)
//! and wake the scheduler. The supervisors do the actual work.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET/POST | `/api/v1/clusters` | List / create clusters |
//! | GET/PATCH/DELETE | `/api/v1/clusters/{id}` | Get / patch / delete a cluster |
//! | POST | `/api/v1/clusters/{id}/provision` | Re-run provisioning |
//! | POST | `/api/v1/clusters/{id}/upgrade` | Upgrade Kubernetes or the node image |
//! | POST | `/api/v1/clusters/{id}/resize` | Change the node group |
//! | GET/POST | `/api/v1/installations` | List / create installations |
//! | GET/PATCH/DELETE | `/api/v1/installations/{id}` | Get / patch / delete (deletion-pending) |
//! | POST | `/api/v1/installations/{id}/hibernate` | Hibernate |
//! | POST | `/api/v1/installations/{id}/wake` | Wake up |
//! | POST | `/api/v1/installations/{id}/deletion/cancel` | Cancel a pending deletion |
//! | POST/DELETE | `/api/v1/installations/{id}/deletion-lock` | Deletion lock |
//! | GET | `/api/v1/cluster-installations` | List cluster installations |
//! | GET/POST | `/api/v1/groups` | List / create groups |
//! | GET/PATCH | `/api/v1/groups/{id}` | Get / patch a group |
//! | PUT/DELETE | `/api/v1/groups/{id}/installations/{installation_id}` | Join / leave |
//! | GET/POST | `/api/v1/{backups,restorations,imports,db-migrations}` | Installation operations |
//! | POST | `/api/v1/db-migrations/{id}/{commit,rollback}` | Settle a migration |
//! | GET/POST | `/api/v1/databases` | Multitenant databases |
//! | POST | `/api/v1/migrations/{installations,dns,cleanup,roles}` | Migration workflow steps |
//! | GET | `/api/v1/events` | State change events |
//! | GET/POST/DELETE | `/api/v1/subscriptions[/{id}]` | Webhook subscriptions |
//!
//! Every resource also has `POST/DELETE /api/v1/<resource>/{id}/api-lock`.

pub mod clusters;
pub mod error;
pub mod events;
pub mod groups;
pub mod installations;
pub mod locks;
pub mod migration;
pub mod operations;
pub mod response;

use std::time::Duration;

use axum::Router;
use axum::routing::{get, post, put};
use shipyard_state::{
    Backup, Cluster, ClusterInstallation, DbMigration, Group, Import, Installation, Record, Restoration,
    StateStore,
};
use shipyard_supervisor::{LockGuard, MigrationWorkflow, Scheduler, SupervisorDeps};

pub use error::{ApiError, ApiResult};
pub use response::ApiResponse;

/// Shared state for API handlers.
#[derive(Clone, Debug)]
pub struct ApiState {
    pub deps: SupervisorDeps,
    pub scheduler: Scheduler,
    /// Grace window between a delete request and the actual deletion.
    pub deletion_pending_time: Duration,
    owner: String,
}

impl ApiState {
    pub fn new(deps: SupervisorDeps, scheduler: Scheduler, deletion_pending_time: Duration) -> Self {
        let owner = deps.owner("api");
        Self {
            deps,
            scheduler,
            deletion_pending_time,
            owner,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.deps.store
    }

    pub fn now(&self) -> u64 {
        self.deps.now()
    }

    pub(crate) fn migration(&self) -> MigrationWorkflow {
        MigrationWorkflow::new(self.deps.clone())
    }

    /// A live record, or 404.
    pub(crate) fn fetch<R: Record>(&self, id: &str) -> ApiResult<R> {
        self.store()
            .get::<R>(id)?
            .filter(|r| !r.is_deleted())
            .ok_or_else(|| ApiError::not_found(R::KIND.as_str(), id))
    }

    /// Take the reconciliation lock for the duration of one request and
    /// return the freshly read record. 409 while a supervisor holds it.
    pub(crate) fn lock<R: Record>(&self, id: &str) -> ApiResult<(LockGuard<R>, R)> {
        self.fetch::<R>(id)?;
        let guard = LockGuard::try_acquire(self.store(), id, &self.owner, self.now())?
            .ok_or_else(|| ApiError::Conflict(format!("{} {id} is being reconciled, retry later", R::KIND)))?;
        let record = self.fetch::<R>(id)?;
        Ok((guard, record))
    }

    /// Like [`lock`](Self::lock), and 403 when the record is API-locked.
    pub(crate) fn lock_mutable<R: Record>(&self, id: &str) -> ApiResult<(LockGuard<R>, R)> {
        let (guard, record) = self.lock::<R>(id)?;
        ensure_unlocked(&record)?;
        Ok((guard, record))
    }

    pub(crate) fn wake(&self) {
        self.scheduler.wake();
    }
}

pub(crate) fn ensure_unlocked<R: Record>(record: &R) -> ApiResult<()> {
    if record.meta().api_locked {
        return Err(ApiError::Forbidden(format!(
            "{} {} is API-locked",
            R::KIND,
            record.id()
        )));
    }
    Ok(())
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        // Clusters
        .route("/clusters", get(clusters::list_clusters).post(clusters::create_cluster))
        .route(
            "/clusters/{id}",
            get(clusters::get_cluster)
                .patch(clusters::patch_cluster)
                .delete(clusters::delete_cluster),
        )
        .route("/clusters/{id}/provision", post(clusters::provision_cluster))
        .route("/clusters/{id}/upgrade", post(clusters::upgrade_cluster))
        .route("/clusters/{id}/resize", post(clusters::resize_cluster))
        .route(
            "/clusters/{id}/api-lock",
            post(locks::lock_api::<Cluster>).delete(locks::unlock_api::<Cluster>),
        )
        // Installations
        .route(
            "/installations",
            get(installations::list_installations).post(installations::create_installation),
        )
        .route(
            "/installations/{id}",
            get(installations::get_installation)
                .patch(installations::patch_installation)
                .delete(installations::delete_installation),
        )
        .route("/installations/{id}/hibernate", post(installations::hibernate_installation))
        .route("/installations/{id}/wake", post(installations::wake_installation))
        .route("/installations/{id}/deletion/cancel", post(installations::cancel_deletion))
        .route(
            "/installations/{id}/api-lock",
            post(locks::lock_api::<Installation>).delete(locks::unlock_api::<Installation>),
        )
        .route(
            "/installations/{id}/deletion-lock",
            post(locks::lock_deletion).delete(locks::unlock_deletion),
        )
        // Cluster installations
        .route("/cluster-installations", get(installations::list_cluster_installations))
        .route("/cluster-installations/{id}", get(installations::get_cluster_installation))
        .route(
            "/cluster-installations/{id}/api-lock",
            post(locks::lock_api::<ClusterInstallation>).delete(locks::unlock_api::<ClusterInstallation>),
        )
        // Groups
        .route("/groups", get(groups::list_groups).post(groups::create_group))
        .route("/groups/{id}", get(groups::get_group).patch(groups::patch_group))
        .route(
            "/groups/{id}/installations/{installation_id}",
            put(groups::join_group).delete(groups::leave_group),
        )
        .route(
            "/groups/{id}/api-lock",
            post(locks::lock_api::<Group>).delete(locks::unlock_api::<Group>),
        )
        // Installation operations
        .route("/backups", get(operations::list_backups).post(operations::create_backup))
        .route("/backups/{id}", get(operations::get_backup))
        .route(
            "/backups/{id}/api-lock",
            post(locks::lock_api::<Backup>).delete(locks::unlock_api::<Backup>),
        )
        .route(
            "/restorations",
            get(operations::list_restorations).post(operations::create_restoration),
        )
        .route("/restorations/{id}", get(operations::get_restoration))
        .route(
            "/restorations/{id}/api-lock",
            post(locks::lock_api::<Restoration>).delete(locks::unlock_api::<Restoration>),
        )
        .route("/imports", get(operations::list_imports).post(operations::create_import))
        .route("/imports/{id}", get(operations::get_import))
        .route(
            "/imports/{id}/api-lock",
            post(locks::lock_api::<Import>).delete(locks::unlock_api::<Import>),
        )
        .route(
            "/db-migrations",
            get(operations::list_db_migrations).post(operations::create_db_migration),
        )
        .route("/db-migrations/{id}", get(operations::get_db_migration))
        .route("/db-migrations/{id}/commit", post(operations::commit_db_migration))
        .route("/db-migrations/{id}/rollback", post(operations::rollback_db_migration))
        .route(
            "/db-migrations/{id}/api-lock",
            post(locks::lock_api::<DbMigration>).delete(locks::unlock_api::<DbMigration>),
        )
        .route("/databases", get(operations::list_databases).post(operations::create_database))
        // Migration workflow
        .route("/migrations/installations", post(migration::migrate_installations))
        .route("/migrations/dns", post(migration::switch_dns))
        .route("/migrations/cleanup", post(migration::delete_inactive))
        .route("/migrations/roles", post(migration::switch_roles))
        // Events and webhooks
        .route("/events", get(events::list_events))
        .route(
            "/subscriptions",
            get(events::list_subscriptions).post(events::create_subscription),
        )
        .route(
            "/subscriptions/{id}",
            get(events::get_subscription).delete(events::delete_subscription),
        )
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
