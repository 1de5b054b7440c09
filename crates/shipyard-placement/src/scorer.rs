//! Cluster utilization and threshold checks.
//!
//! Utilization is measured per dimension (CPU, memory, pods) as a percentage
//! of what the cluster's nodes can allocate. A cluster is full once any
//! dimension reaches its threshold.

use serde::{Deserialize, Serialize};
use shipyard_core::config::PlacementConfig;

/// Default threshold when the config sets none, in percent.
pub const DEFAULT_THRESHOLD: u32 = 80;

/// Allocatable capacity and current requests for one cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterResources {
    pub cpu_allocatable_millis: u64,
    pub cpu_used_millis: u64,
    pub memory_allocatable_bytes: u64,
    pub memory_used_bytes: u64,
    pub pods_allocatable: u64,
    pub pods_used: u64,
}

/// What one installation asks the cluster for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub pods: u64,
}

/// Per-dimension utilization in percent.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Utilization {
    pub cpu: f64,
    pub memory: f64,
    pub pods: f64,
}

impl Utilization {
    /// The most loaded dimension.
    pub fn max(&self) -> f64 {
        self.cpu.max(self.memory).max(self.pods)
    }
}

fn percent(used: u64, allocatable: u64) -> f64 {
    if allocatable == 0 {
        // Nothing allocatable reads as full.
        return 100.0;
    }
    used as f64 / allocatable as f64 * 100.0
}

impl ClusterResources {
    pub fn utilization(&self) -> Utilization {
        Utilization {
            cpu: percent(self.cpu_used_millis, self.cpu_allocatable_millis),
            memory: percent(self.memory_used_bytes, self.memory_allocatable_bytes),
            pods: percent(self.pods_used, self.pods_allocatable),
        }
    }

    /// These resources with `request` added on top.
    pub fn with_request(&self, request: &ResourceRequest) -> ClusterResources {
        ClusterResources {
            cpu_used_millis: self.cpu_used_millis + request.cpu_millis,
            memory_used_bytes: self.memory_used_bytes + request.memory_bytes,
            pods_used: self.pods_used + request.pods,
            ..*self
        }
    }
}

/// Thresholds per dimension, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtilizationThresholds {
    pub cpu: u32,
    pub memory: u32,
    pub pods: u32,
}

impl Default for UtilizationThresholds {
    fn default() -> Self {
        Self::uniform(DEFAULT_THRESHOLD)
    }
}

impl UtilizationThresholds {
    pub fn uniform(threshold: u32) -> Self {
        Self {
            cpu: threshold,
            memory: threshold,
            pods: threshold,
        }
    }

    /// Global threshold with per-dimension overrides.
    pub fn from_config(config: &PlacementConfig) -> Self {
        let global = config.cluster_resource_threshold.unwrap_or(DEFAULT_THRESHOLD);
        Self {
            cpu: config.cpu_threshold.unwrap_or(global),
            memory: config.memory_threshold.unwrap_or(global),
            pods: config.pod_threshold.unwrap_or(global),
        }
    }

    /// True while every dimension is strictly below its threshold.
    pub fn admits(&self, utilization: &Utilization) -> bool {
        utilization.cpu < f64::from(self.cpu)
            && utilization.memory < f64::from(self.memory)
            && utilization.pods < f64::from(self.pods)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources(cpu_used: u64, mem_used: u64, pods_used: u64) -> ClusterResources {
        ClusterResources {
            cpu_allocatable_millis: 1000,
            cpu_used_millis: cpu_used,
            memory_allocatable_bytes: 1000,
            memory_used_bytes: mem_used,
            pods_allocatable: 100,
            pods_used,
        }
    }

    #[test]
    fn utilization_per_dimension() {
        let u = resources(500, 250, 10).utilization();
        assert_eq!(u.cpu, 50.0);
        assert_eq!(u.memory, 25.0);
        assert_eq!(u.pods, 10.0);
        assert_eq!(u.max(), 50.0);
    }

    #[test]
    fn empty_cluster_reads_as_full() {
        let u = ClusterResources::default().utilization();
        assert_eq!(u.max(), 100.0);
        assert!(!UtilizationThresholds::default().admits(&u));
    }

    #[test]
    fn threshold_is_exclusive() {
        let t = UtilizationThresholds::uniform(80);
        assert!(t.admits(&resources(790, 0, 0).utilization()));
        assert!(!t.admits(&resources(800, 0, 0).utilization()));
        assert!(!t.admits(&resources(0, 0, 85).utilization()));
    }

    #[test]
    fn overrides_replace_global() {
        let config = PlacementConfig {
            cluster_resource_threshold: Some(70),
            pod_threshold: Some(95),
            ..Default::default()
        };
        let t = UtilizationThresholds::from_config(&config);
        assert_eq!((t.cpu, t.memory, t.pods), (70, 70, 95));
        assert!(t.admits(&resources(600, 600, 90).utilization()));
    }

    #[test]
    fn request_projection() {
        let r = resources(700, 0, 0).with_request(&ResourceRequest {
            cpu_millis: 200,
            memory_bytes: 100,
            pods: 2,
        });
        assert_eq!(r.cpu_used_millis, 900);
        assert_eq!(r.memory_used_bytes, 100);
        assert_eq!(r.pods_used, 2);
        assert_eq!(r.cpu_allocatable_millis, 1000);
    }
}
