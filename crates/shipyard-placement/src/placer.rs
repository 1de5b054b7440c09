//! Placement engine: picks the cluster an installation lands on.
//!
//! Given candidate clusters and their current utilization, the placer:
//! 1. Filters out clusters that are full, locked or closed to new tenants
//! 2. Orders the rest (stable first, then balanced or ID order)
//! 3. Decides whether the winner needs more nodes before the installation fits

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use shipyard_core::config::PlacementConfig;
use tracing::debug;

use crate::scorer::{ClusterResources, ResourceRequest, UtilizationThresholds};

/// Placement knobs, resolved from `[placement]` in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementPolicy {
    pub thresholds: UtilizationThresholds,
    /// Nodes to add when an installation would push a cluster over a threshold.
    /// Zero disables scale-up.
    pub scale_value: u32,
    pub balanced: bool,
    pub prefer_stable: bool,
    pub always_schedule_external: bool,
}

impl Default for PlacementPolicy {
    fn default() -> Self {
        Self::from_config(&PlacementConfig::default())
    }
}

impl PlacementPolicy {
    pub fn from_config(config: &PlacementConfig) -> Self {
        Self {
            thresholds: UtilizationThresholds::from_config(config),
            scale_value: config.cluster_resource_threshold_scale_value.unwrap_or(0),
            balanced: config.balanced_installation_scheduling.unwrap_or(false),
            prefer_stable: config.prefer_stable_clusters.unwrap_or(false),
            always_schedule_external: config.always_schedule_external_clusters.unwrap_or(false),
        }
    }

    /// Whether a cluster in this condition may take one more installation.
    pub fn fits(&self, resources: &ClusterResources, is_external: bool) -> bool {
        if is_external && self.always_schedule_external {
            return true;
        }
        self.thresholds.admits(&resources.utilization())
    }

    /// Whether `candidate` may take the installation at all. Applied when
    /// ranking and again once the chosen cluster is locked.
    pub fn eligible(&self, candidate: &Candidate, isolated: bool) -> bool {
        candidate.allow_installations
            && !candidate.api_locked
            && !candidate.hosts_isolated
            && (!isolated || candidate.installation_count == 0)
            && self.fits(&candidate.resources, candidate.is_external)
    }

    /// Placement of `request` on an eligible `candidate`. External clusters
    /// are never scaled.
    pub fn placement(&self, candidate: &Candidate, request: &ResourceRequest) -> Placement {
        let scale_up = if candidate.is_external {
            None
        } else {
            self.scale_up(&candidate.resources, request)
        };
        Placement {
            cluster_id: candidate.cluster_id.clone(),
            scale_up,
        }
    }

    /// Nodes to request when placing `request` on `resources` would cross a
    /// threshold. `None` when no scale-up is needed or scale-up is disabled.
    pub fn scale_up(&self, resources: &ClusterResources, request: &ResourceRequest) -> Option<u32> {
        if self.scale_value == 0 {
            return None;
        }
        let projected = resources.with_request(request).utilization();
        (!self.thresholds.admits(&projected)).then_some(self.scale_value)
    }
}

/// One cluster as the placer sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub cluster_id: String,
    pub resources: ClusterResources,
    /// Live installations already on the cluster.
    pub installation_count: usize,
    pub allow_installations: bool,
    pub api_locked: bool,
    pub is_stable: bool,
    pub is_external: bool,
    /// The cluster already hosts an isolated installation.
    pub hosts_isolated: bool,
}

/// The chosen cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub cluster_id: String,
    /// Nodes to add before the installation is created.
    pub scale_up: Option<u32>,
}

/// Candidates that can take the installation, best first.
pub fn rank_candidates<'a>(
    candidates: &'a [Candidate],
    request: &ResourceRequest,
    isolated: bool,
    policy: &PlacementPolicy,
) -> Vec<&'a Candidate> {
    let mut eligible: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| {
            let eligible = policy.eligible(c, isolated);
            if !eligible {
                debug!(
                    cluster = %c.cluster_id,
                    utilization = c.resources.utilization().max(),
                    "cluster not eligible for placement"
                );
            }
            eligible
        })
        .collect();

    eligible.sort_by(|a, b| {
        let stable = if policy.prefer_stable {
            b.is_stable.cmp(&a.is_stable)
        } else {
            Ordering::Equal
        };
        let balance = if policy.balanced {
            a.resources
                .utilization()
                .max()
                .partial_cmp(&b.resources.utilization().max())
                .unwrap_or(Ordering::Equal)
                .then(a.installation_count.cmp(&b.installation_count))
        } else {
            Ordering::Equal
        };
        stable.then(balance).then_with(|| a.cluster_id.cmp(&b.cluster_id))
    });

    debug!(
        requested_cpu = request.cpu_millis,
        eligible = eligible.len(),
        total = candidates.len(),
        "ranked placement candidates"
    );
    eligible
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, used_percent: u64) -> Candidate {
        Candidate {
            cluster_id: id.to_string(),
            resources: ClusterResources {
                cpu_allocatable_millis: 100,
                cpu_used_millis: used_percent,
                memory_allocatable_bytes: 100,
                memory_used_bytes: 0,
                pods_allocatable: 100,
                pods_used: 0,
            },
            installation_count: 0,
            allow_installations: true,
            api_locked: false,
            is_stable: true,
            is_external: false,
            hosts_isolated: false,
        }
    }

    fn request(cpu: u64) -> ResourceRequest {
        ResourceRequest {
            cpu_millis: cpu,
            memory_bytes: 0,
            pods: 0,
        }
    }

    fn choose(
        candidates: &[Candidate],
        request: &ResourceRequest,
        isolated: bool,
        policy: &PlacementPolicy,
    ) -> Option<Placement> {
        let best = rank_candidates(candidates, request, isolated, policy).into_iter().next()?;
        Some(policy.placement(best, request))
    }

    fn ids(ranked: &[&Candidate]) -> Vec<String> {
        ranked.iter().map(|c| c.cluster_id.clone()).collect()
    }

    #[test]
    fn id_order_without_balancing() {
        let candidates = vec![candidate("c2", 10), candidate("c1", 50)];
        let policy = PlacementPolicy::default();
        let ranked = rank_candidates(&candidates, &request(1), false, &policy);
        assert_eq!(ids(&ranked), ["c1", "c2"]);
    }

    #[test]
    fn balanced_prefers_least_utilized() {
        let mut busy = candidate("c1", 60);
        busy.installation_count = 1;
        let mut tie_a = candidate("c3", 20);
        tie_a.installation_count = 5;
        let tie_b = candidate("c2", 20);
        let candidates = vec![busy, tie_a, tie_b];
        let policy = PlacementPolicy {
            balanced: true,
            ..Default::default()
        };
        let ranked = rank_candidates(&candidates, &request(1), false, &policy);
        assert_eq!(ids(&ranked), ["c2", "c3", "c1"]);
    }

    #[test]
    fn rejects_clusters_at_or_over_threshold() {
        let candidates = vec![candidate("c1", 80), candidate("c2", 79)];
        let policy = PlacementPolicy::default();
        let placement = choose(&candidates, &request(5), false, &policy).unwrap();
        assert_eq!(placement.cluster_id, "c2");
        assert_eq!(placement.scale_up, None);

        let full = vec![candidate("c1", 95)];
        assert!(choose(&full, &request(1), false, &policy).is_none());
    }

    #[test]
    fn skips_closed_and_locked_clusters() {
        let mut closed = candidate("c1", 0);
        closed.allow_installations = false;
        let mut locked = candidate("c2", 0);
        locked.api_locked = true;
        let open = candidate("c3", 50);
        let candidates = vec![closed, locked, open];
        let placement =
            choose(&candidates, &request(1), false, &PlacementPolicy::default()).unwrap();
        assert_eq!(placement.cluster_id, "c3");
    }

    #[test]
    fn prefer_stable_orders_without_excluding() {
        let mut upgrading = candidate("c1", 0);
        upgrading.is_stable = false;
        let stable = candidate("c2", 0);
        let candidates = vec![upgrading, stable];
        let policy = PlacementPolicy {
            prefer_stable: true,
            ..Default::default()
        };
        let ranked = rank_candidates(&candidates, &request(1), false, &policy);
        assert_eq!(ids(&ranked), ["c2", "c1"]);
    }

    #[test]
    fn external_clusters_bypass_threshold_when_configured() {
        let mut external = candidate("c1", 99);
        external.is_external = true;
        let candidates = vec![external];
        let mut policy = PlacementPolicy::default();
        assert!(choose(&candidates, &request(1), false, &policy).is_none());
        policy.always_schedule_external = true;
        policy.scale_value = 2;
        let placement = choose(&candidates, &request(1), false, &policy).unwrap();
        assert_eq!(placement.cluster_id, "c1");
        assert_eq!(placement.scale_up, None);
    }

    #[test]
    fn scale_up_when_projection_crosses_threshold() {
        let candidates = vec![candidate("c1", 75)];
        let policy = PlacementPolicy {
            scale_value: 3,
            ..Default::default()
        };
        let small = choose(&candidates, &request(2), false, &policy).unwrap();
        assert_eq!(small.scale_up, None);
        let large = choose(&candidates, &request(10), false, &policy).unwrap();
        assert_eq!(large.scale_up, Some(3));
    }

    #[test]
    fn isolated_affinity() {
        let mut occupied = candidate("c1", 10);
        occupied.installation_count = 1;
        let empty = candidate("c2", 10);
        let mut isolated_host = candidate("c3", 0);
        isolated_host.hosts_isolated = true;
        isolated_host.installation_count = 1;
        let candidates = vec![occupied, empty, isolated_host];
        let policy = PlacementPolicy::default();

        let ranked = rank_candidates(&candidates, &request(1), true, &policy);
        assert_eq!(ids(&ranked), ["c2"]);
        let ranked = rank_candidates(&candidates, &request(1), false, &policy);
        assert_eq!(ids(&ranked), ["c1", "c2"]);
    }

    #[test]
    fn eligibility_tracks_a_fresh_tenant() {
        let policy = PlacementPolicy::default();
        let mut cluster = candidate("c1", 10);
        assert!(policy.eligible(&cluster, true));
        cluster.installation_count = 1;
        assert!(!policy.eligible(&cluster, true));
        assert!(policy.eligible(&cluster, false));
        cluster.hosts_isolated = true;
        assert!(!policy.eligible(&cluster, false));
    }

    #[test]
    fn policy_from_config() {
        let config = PlacementConfig {
            cluster_resource_threshold: Some(70),
            cluster_resource_threshold_scale_value: Some(2),
            balanced_installation_scheduling: Some(true),
            ..Default::default()
        };
        let policy = PlacementPolicy::from_config(&config);
        assert_eq!(policy.thresholds.cpu, 70);
        assert_eq!(policy.scale_value, 2);
        assert!(policy.balanced);
        assert!(!policy.prefer_stable);
    }
}
