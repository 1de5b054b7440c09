//! shipyard-supervisor — the reconciliation engine.
//!
//! Per-resource supervisors advance cluster, installation and operation
//! records one state-machine step at a time against the provisioner
//! backends. The [`Scheduler`] runs them on independent polling loops; the
//! [`MigrationWorkflow`] moves installations between clusters.
//!
//! # Architecture
//!
//! ```text
//! Scheduler
//!   └── Supervisor (one task each)
//!       ├── StateStore (list, lock, re-read, transition + event)
//!       ├── Backends (cluster, installation, operation, DNS, node drain)
//!       └── Placement engine / node rotator
//! ```

pub mod dry_run;
pub mod error;
pub mod lock;
pub mod migration;
pub mod provisioner;
pub mod recorder;
pub mod scheduler;
pub mod supervisors;

pub use dry_run::DryRunBackend;
pub use error::{MigrationError, MigrationResult, SupervisorError, SupervisorResult};
pub use lock::{LockGuard, lock_owner};
pub use migration::{CleanupScope, MigrationSummary, MigrationWorkflow};
pub use provisioner::{
    Backends, ClusterProvisioner, DnsProvider, InstallationProvisioner, JobStatus,
    OperationProvisioner, ProvisionFuture, ProvisionerError,
};
pub use recorder::EventRecorder;
pub use scheduler::{Cadence, Scheduler, SchedulerTiming, Supervisor, WorkFuture};
pub use supervisors::{SupervisorDeps, standard_supervisors};
