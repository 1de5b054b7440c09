//! Contracts with the infrastructure backend.
//!
//! The supervisors never talk to a cloud API directly. Each concern is a
//! trait with boxed-future methods so backends can be held as trait
//! objects and swapped per deployment (or per test). Errors are opaque
//! backend messages; supervisors record them on the resource and retry.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use shipyard_placement::ClusterResources;
use shipyard_rotator::NodeDrainer;
use shipyard_state::{
    Backup, Cluster, ClusterInstallation, DbMigration, EffectiveConfig, Import, Installation,
    Restoration,
};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ProvisionerError(pub String);

impl From<String> for ProvisionerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for ProvisionerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

pub type ProvisionFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ProvisionerError>> + Send + 'a>>;

/// Progress of a long-running backend job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed(String),
}

pub trait ClusterProvisioner: Send + Sync {
    fn create_cluster<'a>(&'a self, cluster: &'a Cluster) -> ProvisionFuture<'a, ()>;

    /// Install or refresh the cluster's system components.
    fn provision_cluster<'a>(&'a self, cluster: &'a Cluster) -> ProvisionFuture<'a, ()>;

    /// Apply the pending change request's version or image.
    fn upgrade_cluster<'a>(&'a self, cluster: &'a Cluster) -> ProvisionFuture<'a, ()>;

    /// Apply the pending change request's node counts or instance type.
    fn resize_cluster<'a>(&'a self, cluster: &'a Cluster) -> ProvisionFuture<'a, ()>;

    fn delete_cluster<'a>(&'a self, cluster: &'a Cluster) -> ProvisionFuture<'a, ()>;

    /// Current allocatable capacity and requests.
    fn cluster_resources<'a>(&'a self, cluster: &'a Cluster) -> ProvisionFuture<'a, ClusterResources>;

    /// Ingress endpoint installation DNS records point at.
    fn cluster_endpoint<'a>(&'a self, cluster: &'a Cluster) -> ProvisionFuture<'a, String>;

    fn worker_nodes<'a>(&'a self, cluster: &'a Cluster) -> ProvisionFuture<'a, Vec<String>>;
}

pub trait InstallationProvisioner: Send + Sync {
    /// Create or update the installation's workload on a cluster.
    fn provision_cluster_installation<'a>(
        &'a self,
        cluster: &'a Cluster,
        installation: &'a Installation,
        cluster_installation: &'a ClusterInstallation,
        config: &'a EffectiveConfig,
    ) -> ProvisionFuture<'a, ()>;

    fn hibernate_cluster_installation<'a>(
        &'a self,
        cluster: &'a Cluster,
        installation: &'a Installation,
        cluster_installation: &'a ClusterInstallation,
    ) -> ProvisionFuture<'a, ()>;

    fn delete_cluster_installation<'a>(
        &'a self,
        cluster: &'a Cluster,
        installation: &'a Installation,
        cluster_installation: &'a ClusterInstallation,
    ) -> ProvisionFuture<'a, ()>;
}

pub trait OperationProvisioner: Send + Sync {
    /// Start a backup job. Returns the backup's storage location.
    fn trigger_backup<'a>(
        &'a self,
        backup: &'a Backup,
        installation: &'a Installation,
    ) -> ProvisionFuture<'a, String>;

    fn backup_status<'a>(&'a self, backup: &'a Backup) -> ProvisionFuture<'a, JobStatus>;

    fn trigger_restoration<'a>(
        &'a self,
        restoration: &'a Restoration,
        installation: &'a Installation,
        backup: &'a Backup,
    ) -> ProvisionFuture<'a, ()>;

    fn restoration_status<'a>(&'a self, restoration: &'a Restoration) -> ProvisionFuture<'a, JobStatus>;

    fn start_import<'a>(
        &'a self,
        import: &'a Import,
        installation: &'a Installation,
    ) -> ProvisionFuture<'a, ()>;

    fn import_status<'a>(&'a self, import: &'a Import) -> ProvisionFuture<'a, JobStatus>;

    fn start_db_migration<'a>(
        &'a self,
        migration: &'a DbMigration,
        installation: &'a Installation,
    ) -> ProvisionFuture<'a, ()>;

    fn db_migration_status<'a>(&'a self, migration: &'a DbMigration) -> ProvisionFuture<'a, JobStatus>;

    /// Point the installation back at its source database.
    fn rollback_db_migration<'a>(
        &'a self,
        migration: &'a DbMigration,
        installation: &'a Installation,
    ) -> ProvisionFuture<'a, ()>;
}

pub trait DnsProvider: Send + Sync {
    /// Create or repoint records so every domain resolves to `target`.
    fn upsert_records<'a>(&'a self, domains: &'a [String], target: &'a str) -> ProvisionFuture<'a, ()>;

    fn delete_records<'a>(&'a self, domains: &'a [String]) -> ProvisionFuture<'a, ()>;
}

/// Every backend the supervisors use.
#[derive(Clone)]
pub struct Backends {
    pub clusters: Arc<dyn ClusterProvisioner>,
    pub installations: Arc<dyn InstallationProvisioner>,
    pub operations: Arc<dyn OperationProvisioner>,
    pub dns: Arc<dyn DnsProvider>,
    pub nodes: Arc<dyn NodeDrainer>,
}

impl Backends {
    /// All five concerns served by one backend value.
    pub fn from_single<B>(backend: Arc<B>) -> Self
    where
        B: ClusterProvisioner
            + InstallationProvisioner
            + OperationProvisioner
            + DnsProvider
            + NodeDrainer
            + 'static,
    {
        Self {
            clusters: backend.clone(),
            installations: backend.clone(),
            operations: backend.clone(),
            dns: backend.clone(),
            nodes: backend,
        }
    }
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}
