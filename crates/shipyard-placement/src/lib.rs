//! Shipyard placement engine — cluster selection for installations.
//!
//! This crate decides which cluster an installation is scheduled onto. It
//! does not touch the store or take locks (that's `shipyard-supervisor`);
//! it filters and orders candidate clusters from utilization snapshots.
//!
//! # Components
//!
//! - **`scorer`**: Utilization math and per-dimension thresholds
//! - **`placer`**: Candidate filtering, ranking and scale-up decisions
//! - **`convert`**: Type conversions from state store types

pub mod convert;
pub mod placer;
pub mod scorer;

pub use convert::{SizeError, cluster_to_candidate, installation_request, is_isolated, size_to_request};
pub use placer::{Candidate, Placement, PlacementPolicy, rank_candidates};
pub use scorer::{ClusterResources, ResourceRequest, Utilization, UtilizationThresholds};
