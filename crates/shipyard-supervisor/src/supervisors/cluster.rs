//! Cluster supervisor.

use shipyard_core::RotatorConfig;
use shipyard_rotator::NodeRotator;
use shipyard_state::{
    Cluster, ClusterInstallation, ClusterInstallationState, ClusterOperation, Phase, Record,
};
use tracing::{debug, info, warn};

use super::SupervisorDeps;
use crate::error::SupervisorResult;
use crate::scheduler::{Supervisor, WorkFuture};

pub struct ClusterSupervisor {
    deps: SupervisorDeps,
    owner: String,
    rotator: NodeRotator,
    default_rotator: RotatorConfig,
}

impl ClusterSupervisor {
    pub fn new(deps: SupervisorDeps, default_rotator: RotatorConfig) -> Self {
        let owner = deps.owner("cluster");
        let rotator = NodeRotator::new(deps.backends.nodes.clone());
        Self {
            deps,
            owner,
            rotator,
            default_rotator,
        }
    }

    /// Replace the node rotator, e.g. to shorten readiness polling.
    pub fn with_rotator(mut self, rotator: NodeRotator) -> Self {
        self.rotator = rotator;
        self
    }

    pub async fn run_once(&self) -> SupervisorResult<()> {
        let clusters = self
            .deps
            .store
            .list_all::<Cluster>(|c| c.state.needs_work() && !c.meta.api_locked)?;
        for cluster in clusters {
            if let Err(e) = self.supervise(&cluster.id).await {
                warn!(cluster = %cluster.id, error = %e, "cluster supervision failed");
            }
        }
        Ok(())
    }

    /// Drive one step of `cluster_id`'s state machine.
    pub async fn supervise(&self, cluster_id: &str) -> SupervisorResult<()> {
        let Some(_guard) = self.deps.lock::<Cluster>(cluster_id, &self.owner)? else {
            return Ok(());
        };
        let mut cluster = self.deps.store.require::<Cluster>(cluster_id)?;
        if cluster.is_deleted() || cluster.meta.api_locked {
            return Ok(());
        }
        let Some((operation, phase)) = cluster.state.operation() else {
            return Ok(());
        };
        let recorder = &self.deps.recorder;
        recorder.warn_if_stuck(&cluster);

        match phase {
            Phase::Requested => {
                if operation == ClusterOperation::Deletion {
                    let remaining = self.live_installation_count(cluster_id)?;
                    if remaining > 0 {
                        recorder.note_error(
                            &mut cluster,
                            format!("cluster still hosts {remaining} cluster installations"),
                        )?;
                        return Ok(());
                    }
                }
                recorder.transition(&mut cluster, operation.state(Phase::InProgress))?;
            }
            Phase::Failed => {
                recorder.transition(&mut cluster, operation.state(Phase::InProgress))?;
            }
            Phase::InProgress => match self.execute(operation, &cluster).await {
                Ok(()) => {
                    if matches!(operation, ClusterOperation::Upgrade | ClusterOperation::Resize)
                        && let Some(change) = cluster.change_request.take()
                    {
                        change.apply_to(&mut cluster.metadata);
                    }
                    if operation == ClusterOperation::Deletion {
                        recorder.mark_deleted(&mut cluster);
                    }
                    recorder.transition(&mut cluster, operation.completed())?;
                }
                Err(e) => {
                    recorder.fail(&mut cluster, operation.state(Phase::Failed), e)?;
                }
            },
        }
        Ok(())
    }

    async fn execute(&self, operation: ClusterOperation, cluster: &Cluster) -> SupervisorResult<()> {
        if cluster.is_external() {
            debug!(cluster = %cluster.id, ?operation, "external cluster, nothing to provision");
            return Ok(());
        }
        let provisioner = &self.deps.backends.clusters;
        match operation {
            ClusterOperation::Creation => provisioner.create_cluster(cluster).await?,
            ClusterOperation::Provisioning => provisioner.provision_cluster(cluster).await?,
            ClusterOperation::Upgrade => {
                provisioner.upgrade_cluster(cluster).await?;
                self.rotate_nodes(cluster).await?;
            }
            ClusterOperation::Resize => {
                provisioner.resize_cluster(cluster).await?;
                self.rotate_nodes(cluster).await?;
            }
            ClusterOperation::Deletion => provisioner.delete_cluster(cluster).await?,
        }
        Ok(())
    }

    async fn rotate_nodes(&self, cluster: &Cluster) -> SupervisorResult<()> {
        let config = cluster
            .change_request
            .as_ref()
            .and_then(|c| c.rotator.clone())
            .unwrap_or_else(|| self.default_rotator.clone());
        if !config.use_rotator {
            return Ok(());
        }
        let nodes = self.deps.backends.clusters.worker_nodes(cluster).await?;
        let report = self.rotator.rotate(&cluster.id, &nodes, &config).await?;
        info!(
            cluster = %cluster.id,
            rotated = report.nodes_rotated,
            batches = report.batch_sizes.len(),
            "node rotation complete"
        );
        Ok(())
    }

    fn live_installation_count(&self, cluster_id: &str) -> SupervisorResult<usize> {
        Ok(self
            .deps
            .store
            .list_all::<ClusterInstallation>(|ci| {
                ci.cluster_id == cluster_id && ci.state != ClusterInstallationState::Deleted
            })?
            .len())
    }
}

impl Supervisor for ClusterSupervisor {
    fn name(&self) -> &'static str {
        "cluster"
    }

    fn do_work(&self) -> WorkFuture<'_> {
        Box::pin(self.run_once())
    }
}
