//! Shipyard node rotation — paced worker node replacement.
//!
//! Cluster upgrades and resizes replace worker nodes in batches of at most
//! `max_scaling`, draining pods off each node before it is replaced so
//! tenant workloads keep running.
//!
//! # Components
//!
//! - **`strategy`**: Batch planning
//! - **`controller`**: Cordon, drain, replace and readiness loop
//! - **`drainer`**: Node operations supplied by the cluster backend

pub mod controller;
pub mod drainer;
pub mod error;
pub mod strategy;

pub use controller::{NodeRotator, RotationReport};
pub use drainer::{DrainFuture, NodeDrainer};
pub use error::{RotationError, RotationResult};
pub use strategy::{RotationPlan, batch_count};
