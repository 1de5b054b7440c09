//! Rotation controller: replaces a cluster's worker nodes batch by batch.
//!
//! Per batch: cordon every node, drain them one after another (evicting
//! pods one at a time), replace the drained nodes and wait for the
//! replacements to report ready. Batches run strictly in sequence, so no
//! more than `max_scaling` nodes are out of service at any instant.

use std::sync::Arc;
use std::time::Duration;

use shipyard_core::RotatorConfig;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::drainer::NodeDrainer;
use crate::error::{RotationError, RotationResult};
use crate::strategy::RotationPlan;

const DEFAULT_READY_POLL: Duration = Duration::from_secs(10);
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// What a completed rotation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationReport {
    pub batch_sizes: Vec<usize>,
    pub nodes_rotated: usize,
    /// Peak number of nodes cordoned but not yet replaced.
    pub max_unavailable: usize,
    /// Drain attempts that failed and were retried.
    pub drain_retries: u32,
    pub replacement_nodes: Vec<String>,
}

pub struct NodeRotator {
    drainer: Arc<dyn NodeDrainer>,
    ready_poll: Duration,
    ready_timeout: Duration,
}

impl NodeRotator {
    pub fn new(drainer: Arc<dyn NodeDrainer>) -> Self {
        Self {
            drainer,
            ready_poll: DEFAULT_READY_POLL,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }

    pub fn with_ready_timeout(mut self, poll: Duration, timeout: Duration) -> Self {
        self.ready_poll = poll;
        self.ready_timeout = timeout;
        self
    }

    /// Rotate every node in `nodes` under `config`.
    ///
    /// A disabled config rotates nothing and returns an empty report.
    pub async fn rotate(
        &self,
        cluster_id: &str,
        nodes: &[String],
        config: &RotatorConfig,
    ) -> RotationResult<RotationReport> {
        if !config.use_rotator {
            debug!(cluster = %cluster_id, "node rotation disabled");
            return Ok(RotationReport::default());
        }
        config.validate().map_err(RotationError::InvalidConfig)?;

        let plan = RotationPlan::new(nodes, config.max_scaling);
        let mut report = RotationReport {
            batch_sizes: plan.batch_sizes(),
            ..Default::default()
        };
        info!(
            cluster = %cluster_id,
            nodes = nodes.len(),
            batches = plan.batch_count(),
            max_scaling = config.max_scaling,
            "starting node rotation"
        );

        let mut unavailable = 0usize;
        for (index, batch) in plan.batches.iter().enumerate() {
            if index > 0 {
                sleep(config.wait_between_rotations()).await;
            }
            debug!(cluster = %cluster_id, batch = index + 1, size = batch.len(), "rotating batch");

            let mut cordoned = Vec::with_capacity(batch.len());
            let drained = self
                .cordon_and_drain(cluster_id, batch, config, &mut cordoned, &mut unavailable, &mut report)
                .await;
            let replacements = match drained {
                Ok(()) => self
                    .drainer
                    .replace_nodes(cluster_id, batch)
                    .await
                    .map_err(RotationError::Replace),
                Err(err) => Err(err),
            };
            let replacements = match replacements {
                Ok(replacements) => replacements,
                Err(err) => {
                    self.release(cluster_id, &cordoned).await;
                    return Err(err);
                }
            };
            for node in &replacements {
                self.wait_ready(cluster_id, node).await?;
            }
            unavailable -= batch.len();
            report.nodes_rotated += batch.len();
            report.replacement_nodes.extend(replacements);
        }

        info!(
            cluster = %cluster_id,
            rotated = report.nodes_rotated,
            retries = report.drain_retries,
            "node rotation complete"
        );
        Ok(report)
    }

    /// Cordon every node of a batch, then drain them in turn. Nodes are
    /// pushed onto `cordoned` as they are cordoned.
    async fn cordon_and_drain(
        &self,
        cluster_id: &str,
        batch: &[String],
        config: &RotatorConfig,
        cordoned: &mut Vec<String>,
        unavailable: &mut usize,
        report: &mut RotationReport,
    ) -> RotationResult<()> {
        for node in batch {
            self.drainer
                .cordon(cluster_id, node)
                .await
                .map_err(|error| RotationError::Cordon {
                    node: node.clone(),
                    error,
                })?;
            cordoned.push(node.clone());
            *unavailable += 1;
            report.max_unavailable = report.max_unavailable.max(*unavailable);
        }

        for (position, node) in batch.iter().enumerate() {
            if position > 0 {
                sleep(config.wait_between_drains()).await;
            }
            report.drain_retries += self.drain_with_retries(cluster_id, node, config).await?;
        }
        Ok(())
    }

    /// Put nodes of a failed batch back into service so a later attempt
    /// starts from a clean cluster.
    async fn release(&self, cluster_id: &str, nodes: &[String]) {
        for node in nodes {
            match self.drainer.uncordon(cluster_id, node).await {
                Ok(()) => debug!(cluster = %cluster_id, %node, "node uncordoned"),
                Err(error) => warn!(cluster = %cluster_id, %node, %error, "failed to uncordon node"),
            }
        }
    }

    /// Drain one node: one attempt plus up to `max_drain_retries` retries.
    /// Returns the number of failed attempts before success.
    async fn drain_with_retries(
        &self,
        cluster_id: &str,
        node: &str,
        config: &RotatorConfig,
    ) -> RotationResult<u32> {
        let attempts = config.max_drain_retries.saturating_add(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.drain(cluster_id, node, config).await {
                Ok(()) => return Ok(attempt - 1),
                Err(error) => {
                    warn!(cluster = %cluster_id, %node, attempt, %error, "node drain failed");
                    last_error = error;
                    if attempt < attempts {
                        sleep(config.wait_between_drains()).await;
                    }
                }
            }
        }
        Err(RotationError::Drain {
            node: node.to_string(),
            attempts,
            error: last_error,
        })
    }

    async fn drain(&self, cluster_id: &str, node: &str, config: &RotatorConfig) -> Result<(), String> {
        let pods = self.drainer.list_pods(cluster_id, node).await?;
        for (index, pod) in pods.iter().enumerate() {
            if index > 0 {
                sleep(config.wait_between_pod_evictions()).await;
            }
            self.drainer
                .evict_pod(cluster_id, node, pod, config.evict_grace_period())
                .await?;
        }
        debug!(cluster = %cluster_id, %node, pods = pods.len(), "node drained");
        Ok(())
    }

    async fn wait_ready(&self, cluster_id: &str, node: &str) -> RotationResult<()> {
        let deadline = Instant::now() + self.ready_timeout;
        loop {
            match self.drainer.node_ready(cluster_id, node).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(error) => debug!(cluster = %cluster_id, %node, %error, "readiness check failed"),
            }
            if Instant::now() >= deadline {
                return Err(RotationError::NotReady(node.to_string()));
            }
            sleep(self.ready_poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drainer::DrainFuture;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeState {
        cordoned: HashSet<String>,
        peak_cordoned: usize,
        cordon_times: Vec<Instant>,
        replace_times: Vec<Instant>,
        evictions: Vec<String>,
        drain_failures: HashMap<String, u32>,
        not_ready_polls: u32,
        replaced: usize,
    }

    #[derive(Default)]
    struct FakeDrainer {
        state: Mutex<FakeState>,
    }

    impl FakeDrainer {
        fn failing(node: &str, times: u32) -> Self {
            let drainer = Self::default();
            drainer
                .state
                .lock()
                .unwrap()
                .drain_failures
                .insert(node.to_string(), times);
            drainer
        }
    }

    impl NodeDrainer for FakeDrainer {
        fn cordon<'a>(&'a self, _cluster_id: &'a str, node: &'a str) -> DrainFuture<'a, ()> {
            Box::pin(async move {
                let mut state = self.state.lock().unwrap();
                state.cordoned.insert(node.to_string());
                state.peak_cordoned = state.peak_cordoned.max(state.cordoned.len());
                state.cordon_times.push(Instant::now());
                Ok(())
            })
        }

        fn uncordon<'a>(&'a self, _cluster_id: &'a str, node: &'a str) -> DrainFuture<'a, ()> {
            Box::pin(async move {
                self.state.lock().unwrap().cordoned.remove(node);
                Ok(())
            })
        }

        fn list_pods<'a>(&'a self, _cluster_id: &'a str, node: &'a str) -> DrainFuture<'a, Vec<String>> {
            Box::pin(async move {
                let mut state = self.state.lock().unwrap();
                if let Some(remaining) = state.drain_failures.get_mut(node)
                    && *remaining > 0
                {
                    *remaining -= 1;
                    return Err(format!("pods on {node} refuse eviction"));
                }
                Ok(vec![format!("{node}-pod-a"), format!("{node}-pod-b")])
            })
        }

        fn evict_pod<'a>(
            &'a self,
            _cluster_id: &'a str,
            _node: &'a str,
            pod: &'a str,
            grace: Duration,
        ) -> DrainFuture<'a, ()> {
            Box::pin(async move {
                assert_eq!(grace, Duration::from_secs(600));
                self.state.lock().unwrap().evictions.push(pod.to_string());
                Ok(())
            })
        }

        fn replace_nodes<'a>(
            &'a self,
            _cluster_id: &'a str,
            nodes: &'a [String],
        ) -> DrainFuture<'a, Vec<String>> {
            Box::pin(async move {
                let mut state = self.state.lock().unwrap();
                state.replace_times.push(Instant::now());
                let mut fresh = Vec::new();
                for node in nodes {
                    state.cordoned.remove(node);
                    state.replaced += 1;
                    fresh.push(format!("new-{}", state.replaced));
                }
                Ok(fresh)
            })
        }

        fn node_ready<'a>(&'a self, _cluster_id: &'a str, _node: &'a str) -> DrainFuture<'a, bool> {
            Box::pin(async move {
                let mut state = self.state.lock().unwrap();
                if state.not_ready_polls > 0 {
                    state.not_ready_polls -= 1;
                    return Ok(false);
                }
                Ok(true)
            })
        }
    }

    fn nodes(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("node-{i}")).collect()
    }

    fn config(max_scaling: u32) -> RotatorConfig {
        RotatorConfig {
            max_scaling,
            ..RotatorConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn five_nodes_rotate_in_three_paced_batches() {
        let drainer = Arc::new(FakeDrainer::default());
        let rotator = NodeRotator::new(drainer.clone());
        let cfg = config(2);

        let report = rotator.rotate("c1", &nodes(5), &cfg).await.unwrap();
        assert_eq!(report.batch_sizes, [2, 2, 1]);
        assert_eq!(report.nodes_rotated, 5);
        assert_eq!(report.replacement_nodes.len(), 5);
        assert!(report.max_unavailable <= 2);

        let state = drainer.state.lock().unwrap();
        assert!(state.peak_cordoned <= 2);
        assert_eq!(state.replace_times.len(), 3);
        assert_eq!(state.evictions.len(), 10);
        // The first cordon of batch N+1 happens a full rotation wait after
        // batch N was replaced.
        let batch_starts = [state.cordon_times[2], state.cordon_times[4]];
        for (start, replaced) in batch_starts.iter().zip(&state.replace_times) {
            assert!(*start - *replaced >= cfg.wait_between_rotations());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_never_exceeds_max_scaling() {
        for (count, max_scaling) in [(1, 1), (4, 1), (7, 3), (6, 6), (9, 4)] {
            let drainer = Arc::new(FakeDrainer::default());
            let report = NodeRotator::new(drainer.clone())
                .rotate("c1", &nodes(count), &config(max_scaling))
                .await
                .unwrap();
            assert!(report.max_unavailable <= max_scaling as usize);
            assert!(drainer.state.lock().unwrap().peak_cordoned <= max_scaling as usize);
            assert_eq!(report.nodes_rotated, count);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn drain_retries_then_succeeds() {
        let drainer = Arc::new(FakeDrainer::failing("node-1", 2));
        let report = NodeRotator::new(drainer)
            .rotate("c1", &nodes(3), &config(3))
            .await
            .unwrap();
        assert_eq!(report.drain_retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_gives_up_after_max_retries() {
        let drainer = Arc::new(FakeDrainer::failing("node-0", 100));
        let cfg = RotatorConfig {
            max_drain_retries: 3,
            ..config(2)
        };
        let err = NodeRotator::new(drainer.clone())
            .rotate("c1", &nodes(2), &cfg)
            .await
            .unwrap_err();
        assert!(matches!(err, RotationError::Drain { attempts: 4, .. }));
        assert_eq!(drainer.state.lock().unwrap().replaced, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn single_retry_is_honoured() {
        let drainer = Arc::new(FakeDrainer::failing("node-0", 1));
        let cfg = RotatorConfig {
            max_drain_retries: 1,
            ..config(1)
        };
        let report = NodeRotator::new(drainer).rotate("c1", &nodes(1), &cfg).await.unwrap();
        assert_eq!(report.drain_retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batch_is_uncordoned_before_the_retry() {
        let drainer = Arc::new(FakeDrainer::failing("node-2", u32::MAX));
        let rotator = NodeRotator::new(drainer.clone());
        let cfg = RotatorConfig {
            max_drain_retries: 1,
            ..config(2)
        };

        let err = rotator.rotate("c1", &nodes(5), &cfg).await.unwrap_err();
        assert!(matches!(err, RotationError::Drain { ref node, .. } if node == "node-2"));
        assert!(drainer.state.lock().unwrap().cordoned.is_empty());

        // The supervisor retries against the nodes the cluster now has.
        let remaining = vec![
            "new-1".to_string(),
            "new-2".to_string(),
            "node-2".to_string(),
            "node-3".to_string(),
            "node-4".to_string(),
        ];
        rotator.rotate("c1", &remaining, &cfg).await.unwrap_err();
        let state = drainer.state.lock().unwrap();
        assert!(state.peak_cordoned <= 2);
        assert!(state.cordoned.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_replacements_to_become_ready() {
        let drainer = Arc::new(FakeDrainer::default());
        drainer.state.lock().unwrap().not_ready_polls = 3;
        let start = Instant::now();
        NodeRotator::new(drainer)
            .with_ready_timeout(Duration::from_secs(5), Duration::from_secs(60))
            .rotate("c1", &nodes(1), &config(1))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn replacement_that_never_readies_fails() {
        let drainer = Arc::new(FakeDrainer::default());
        drainer.state.lock().unwrap().not_ready_polls = u32::MAX;
        let err = NodeRotator::new(drainer)
            .with_ready_timeout(Duration::from_secs(5), Duration::from_secs(20))
            .rotate("c1", &nodes(1), &config(1))
            .await
            .unwrap_err();
        assert_eq!(err, RotationError::NotReady("new-1".to_string()));
    }

    #[tokio::test]
    async fn disabled_rotator_touches_nothing() {
        let drainer = Arc::new(FakeDrainer::default());
        let report = NodeRotator::new(drainer.clone())
            .rotate("c1", &nodes(4), &RotatorConfig::disabled())
            .await
            .unwrap();
        assert_eq!(report, RotationReport::default());
        assert!(drainer.state.lock().unwrap().cordon_times.is_empty());
    }
}
