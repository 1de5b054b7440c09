//! Domain records persisted by the state store.

pub mod cluster;
pub mod cluster_installation;
pub mod database;
pub mod group;
pub mod installation;
pub mod operations;

pub use cluster::*;
pub use cluster_installation::*;
pub use database::*;
pub use group::*;
pub use installation::*;
pub use operations::*;
