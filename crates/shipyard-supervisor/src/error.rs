//! Supervisor error types.

use thiserror::Error;

use crate::provisioner::ProvisionerError;

/// Errors that abort one supervision pass over a resource.
///
/// None of these are fatal to the scheduler: the pass is logged and the
/// resource is picked up again on the next tick.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("state store error: {0}")]
    State(#[from] shipyard_state::StateError),

    #[error("provisioner error: {0}")]
    Provisioner(#[from] ProvisionerError),

    #[error("node rotation failed: {0}")]
    Rotation(#[from] shipyard_rotator::RotationError),

    #[error("placement error: {0}")]
    Placement(#[from] shipyard_placement::SizeError),

    #[error("webhook delivery failed: {0}")]
    Webhook(String),

    /// The resource is not in a state that allows the step yet.
    #[error("precondition not met: {0}")]
    Precondition(String),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Precondition failures of the migration workflow steps.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("cluster {0} does not accept installations")]
    TargetClosed(String),

    #[error("source and target cluster are the same: {0}")]
    SameCluster(String),

    #[error("installation {installation} has no stable cluster installation on {cluster}")]
    TargetNotReady { installation: String, cluster: String },

    #[error("installation {installation} is not on cluster {cluster}")]
    NotOnSource { installation: String, cluster: String },

    #[error("cluster installation not found: {0}")]
    ClusterInstallationNotFound(String),

    #[error("cluster installation {0} is still active")]
    StillActive(String),

    #[error("{0} is locked by another owner")]
    Locked(String),

    #[error("installation not found: {0}")]
    InstallationNotFound(String),

    #[error("state store error: {0}")]
    State(#[from] shipyard_state::StateError),

    #[error("provisioner error: {0}")]
    Provisioner(#[from] ProvisionerError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

pub type MigrationResult<T> = Result<T, MigrationError>;
