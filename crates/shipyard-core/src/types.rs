//! Shared types used across Shipyard crates.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Node rotation policy attached to a cluster upgrade or resize.
///
/// Kept on the cluster's pending change request until the operation it
/// governs completes, then discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotatorConfig {
    /// Rotate nodes at all. When false the upgrade relies on the backend alone.
    pub use_rotator: bool,
    /// Maximum number of nodes taken out of service at once.
    pub max_scaling: u32,
    /// Drain retries per node after the first failed attempt.
    pub max_drain_retries: u32,
    /// Grace period handed to every pod eviction.
    pub evict_grace_period_secs: u64,
    pub wait_between_rotations_secs: u64,
    pub wait_between_drains_secs: u64,
    pub wait_between_pod_evictions_secs: u64,
}

impl Default for RotatorConfig {
    fn default() -> Self {
        Self {
            use_rotator: true,
            max_scaling: 5,
            max_drain_retries: 10,
            evict_grace_period_secs: 600,
            wait_between_rotations_secs: 60,
            wait_between_drains_secs: 60,
            wait_between_pod_evictions_secs: 5,
        }
    }
}

impl RotatorConfig {
    /// A policy that leaves nodes alone.
    pub fn disabled() -> Self {
        Self {
            use_rotator: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.use_rotator && self.max_scaling == 0 {
            return Err("rotator max_scaling must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn evict_grace_period(&self) -> Duration {
        Duration::from_secs(self.evict_grace_period_secs)
    }

    pub fn wait_between_rotations(&self) -> Duration {
        Duration::from_secs(self.wait_between_rotations_secs)
    }

    pub fn wait_between_drains(&self) -> Duration {
        Duration::from_secs(self.wait_between_drains_secs)
    }

    pub fn wait_between_pod_evictions(&self) -> Duration {
        Duration::from_secs(self.wait_between_pod_evictions_secs)
    }
}
