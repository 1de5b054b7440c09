//! In-memory backend that provisions nothing.
//!
//! `DryRunBackend` implements every provisioner contract against local
//! bookkeeping. Cluster utilization is derived from the store: a fixed
//! per-node capacity times `node_min_count`, and usage from the sizes of the
//! live installations bound to the cluster (plus an optional base load).
//! Any operation can be told to fail, which is how retry paths are driven.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::ready;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use shipyard_placement::{ClusterResources, ResourceRequest, size_to_request};
use shipyard_rotator::{DrainFuture, NodeDrainer};
use shipyard_state::{
    Backup, Cluster, ClusterInstallation, ClusterInstallationState, DbMigration, EffectiveConfig,
    Import, Installation, Restoration, StateStore,
};
use tracing::debug;

use crate::provisioner::{
    ClusterProvisioner, DnsProvider, InstallationProvisioner, JobStatus, OperationProvisioner,
    ProvisionFuture, ProvisionerError,
};

pub const NODE_CPU_MILLIS: u64 = 4_000;
pub const NODE_MEMORY_BYTES: u64 = 16 * 1024 * 1024 * 1024;
pub const NODE_PODS: u64 = 110;
const PODS_PER_NODE: usize = 2;

#[derive(Debug, Clone, Copy)]
enum Failure {
    Times(u32),
    Always,
}

#[derive(Debug, Default)]
struct DryRunState {
    failures: HashMap<String, Failure>,
    base_usage: HashMap<String, ResourceRequest>,
    dns: BTreeMap<String, String>,
    calls: Vec<String>,
    nodes: HashMap<String, Vec<String>>,
    cordoned: BTreeSet<String>,
    next_node: u64,
    jobs_running: bool,
}

#[derive(Debug)]
pub struct DryRunBackend {
    store: StateStore,
    state: Mutex<DryRunState>,
}

impl DryRunBackend {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            state: Mutex::new(DryRunState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, DryRunState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `times` calls of `operation` fail.
    pub fn fail_next(&self, operation: &str, times: u32) {
        self.state()
            .failures
            .insert(operation.to_string(), Failure::Times(times));
    }

    /// Make every call of `operation` fail until cleared.
    pub fn fail_always(&self, operation: &str) {
        self.state()
            .failures
            .insert(operation.to_string(), Failure::Always);
    }

    pub fn clear_failures(&self, operation: &str) {
        self.state().failures.remove(operation);
    }

    /// Load already present on a cluster before any installation lands.
    pub fn set_base_usage(&self, cluster_id: &str, usage: ResourceRequest) {
        self.state().base_usage.insert(cluster_id.to_string(), usage);
    }

    /// Report every backend job as still running.
    pub fn hold_jobs(&self, running: bool) {
        self.state().jobs_running = running;
    }

    pub fn dns_target(&self, domain: &str) -> Option<String> {
        self.state().dns.get(domain).cloned()
    }

    /// Every call made so far, as `operation:subject`.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        let prefix = format!("{operation}:");
        self.state()
            .calls
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    pub fn cordoned_nodes(&self) -> Vec<String> {
        self.state().cordoned.iter().cloned().collect()
    }

    /// Log the call, then fail it if a failure was injected.
    fn call(&self, operation: &str, subject: &str) -> Result<(), ProvisionerError> {
        let mut state = self.state();
        state.calls.push(format!("{operation}:{subject}"));
        debug!(%operation, %subject, "dry-run call");
        let fail = match state.failures.get_mut(operation) {
            Some(Failure::Always) => true,
            Some(Failure::Times(n)) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        };
        if fail {
            return Err(ProvisionerError(format!("injected failure: {operation}")));
        }
        Ok(())
    }

    fn job_status(&self, operation: &str, subject: &str) -> JobStatus {
        match self.call(operation, subject) {
            Err(e) => JobStatus::Failed(e.0),
            Ok(()) if self.state().jobs_running => JobStatus::Running,
            Ok(()) => JobStatus::Succeeded,
        }
    }

    fn ensure_nodes(state: &mut DryRunState, cluster_id: &str, count: usize) -> Vec<String> {
        let mut next = state.next_node;
        let nodes = state.nodes.entry(cluster_id.to_string()).or_default();
        while nodes.len() < count {
            nodes.push(format!("{cluster_id}-node-{next}"));
            next += 1;
        }
        nodes.truncate(count.max(1));
        let current = nodes.clone();
        state.next_node = next;
        current
    }

    fn resources(&self, cluster: &Cluster) -> Result<ClusterResources, ProvisionerError> {
        let store_err = |e: shipyard_state::StateError| ProvisionerError(e.to_string());
        let nodes = u64::from(cluster.metadata.node_min_count.max(1));
        let base = self
            .state()
            .base_usage
            .get(&cluster.id)
            .copied()
            .unwrap_or_default();
        let mut resources = ClusterResources {
            cpu_allocatable_millis: nodes * NODE_CPU_MILLIS,
            cpu_used_millis: base.cpu_millis,
            memory_allocatable_bytes: nodes * NODE_MEMORY_BYTES,
            memory_used_bytes: base.memory_bytes,
            pods_allocatable: nodes * NODE_PODS,
            pods_used: base.pods,
        };
        let bound = self
            .store
            .list_all::<ClusterInstallation>(|ci| {
                ci.cluster_id == cluster.id && ci.state != ClusterInstallationState::Deleted
            })
            .map_err(store_err)?;
        for ci in bound {
            let Some(installation) = self
                .store
                .get::<Installation>(&ci.installation_id)
                .map_err(store_err)?
            else {
                continue;
            };
            if let Ok(request) = size_to_request(&installation.size) {
                resources = resources.with_request(&request);
            }
        }
        Ok(resources)
    }
}

fn done<'a, T: Send + 'a>(result: Result<T, ProvisionerError>) -> ProvisionFuture<'a, T> {
    Box::pin(ready(result))
}

fn drained<'a, T: Send + 'a>(result: Result<T, ProvisionerError>) -> DrainFuture<'a, T> {
    Box::pin(ready(result.map_err(|e| e.0)))
}

impl ClusterProvisioner for DryRunBackend {
    fn create_cluster<'a>(&'a self, cluster: &'a Cluster) -> ProvisionFuture<'a, ()> {
        let result = self.call("create_cluster", &cluster.id).map(|()| {
            let count = cluster.metadata.node_min_count as usize;
            Self::ensure_nodes(&mut self.state(), &cluster.id, count);
        });
        done(result)
    }

    fn provision_cluster<'a>(&'a self, cluster: &'a Cluster) -> ProvisionFuture<'a, ()> {
        done(self.call("provision_cluster", &cluster.id))
    }

    fn upgrade_cluster<'a>(&'a self, cluster: &'a Cluster) -> ProvisionFuture<'a, ()> {
        done(self.call("upgrade_cluster", &cluster.id))
    }

    fn resize_cluster<'a>(&'a self, cluster: &'a Cluster) -> ProvisionFuture<'a, ()> {
        let result = self.call("resize_cluster", &cluster.id).map(|()| {
            let count = cluster
                .change_request
                .as_ref()
                .and_then(|c| c.node_min_count)
                .unwrap_or(cluster.metadata.node_min_count);
            Self::ensure_nodes(&mut self.state(), &cluster.id, count as usize);
        });
        done(result)
    }

    fn delete_cluster<'a>(&'a self, cluster: &'a Cluster) -> ProvisionFuture<'a, ()> {
        let result = self.call("delete_cluster", &cluster.id).map(|()| {
            self.state().nodes.remove(&cluster.id);
        });
        done(result)
    }

    fn cluster_resources<'a>(&'a self, cluster: &'a Cluster) -> ProvisionFuture<'a, ClusterResources> {
        let result = self
            .call("cluster_resources", &cluster.id)
            .and_then(|()| self.resources(cluster));
        done(result)
    }

    fn cluster_endpoint<'a>(&'a self, cluster: &'a Cluster) -> ProvisionFuture<'a, String> {
        let result = self
            .call("cluster_endpoint", &cluster.id)
            .map(|()| format!("{}.ingress.dry-run.local", cluster.id));
        done(result)
    }

    fn worker_nodes<'a>(&'a self, cluster: &'a Cluster) -> ProvisionFuture<'a, Vec<String>> {
        let result = self.call("worker_nodes", &cluster.id).map(|()| {
            let count = cluster.metadata.node_min_count as usize;
            let mut state = self.state();
            match state.nodes.get(&cluster.id) {
                Some(nodes) => nodes.clone(),
                None => Self::ensure_nodes(&mut state, &cluster.id, count),
            }
        });
        done(result)
    }
}

impl InstallationProvisioner for DryRunBackend {
    fn provision_cluster_installation<'a>(
        &'a self,
        _cluster: &'a Cluster,
        _installation: &'a Installation,
        cluster_installation: &'a ClusterInstallation,
        config: &'a EffectiveConfig,
    ) -> ProvisionFuture<'a, ()> {
        debug!(ci = %cluster_installation.id, version = %config.version, "dry-run provision");
        done(self.call("provision_cluster_installation", &cluster_installation.id))
    }

    fn hibernate_cluster_installation<'a>(
        &'a self,
        _cluster: &'a Cluster,
        _installation: &'a Installation,
        cluster_installation: &'a ClusterInstallation,
    ) -> ProvisionFuture<'a, ()> {
        done(self.call("hibernate_cluster_installation", &cluster_installation.id))
    }

    fn delete_cluster_installation<'a>(
        &'a self,
        _cluster: &'a Cluster,
        _installation: &'a Installation,
        cluster_installation: &'a ClusterInstallation,
    ) -> ProvisionFuture<'a, ()> {
        done(self.call("delete_cluster_installation", &cluster_installation.id))
    }
}

impl OperationProvisioner for DryRunBackend {
    fn trigger_backup<'a>(
        &'a self,
        backup: &'a Backup,
        installation: &'a Installation,
    ) -> ProvisionFuture<'a, String> {
        let result = self
            .call("trigger_backup", &backup.id)
            .map(|()| format!("s3://dry-run-backups/{}/{}", installation.id, backup.id));
        done(result)
    }

    fn backup_status<'a>(&'a self, backup: &'a Backup) -> ProvisionFuture<'a, JobStatus> {
        done(Ok(self.job_status("backup_status", &backup.id)))
    }

    fn trigger_restoration<'a>(
        &'a self,
        restoration: &'a Restoration,
        _installation: &'a Installation,
        _backup: &'a Backup,
    ) -> ProvisionFuture<'a, ()> {
        done(self.call("trigger_restoration", &restoration.id))
    }

    fn restoration_status<'a>(&'a self, restoration: &'a Restoration) -> ProvisionFuture<'a, JobStatus> {
        done(Ok(self.job_status("restoration_status", &restoration.id)))
    }

    fn start_import<'a>(
        &'a self,
        import: &'a Import,
        _installation: &'a Installation,
    ) -> ProvisionFuture<'a, ()> {
        done(self.call("start_import", &import.id))
    }

    fn import_status<'a>(&'a self, import: &'a Import) -> ProvisionFuture<'a, JobStatus> {
        done(Ok(self.job_status("import_status", &import.id)))
    }

    fn start_db_migration<'a>(
        &'a self,
        migration: &'a DbMigration,
        _installation: &'a Installation,
    ) -> ProvisionFuture<'a, ()> {
        done(self.call("start_db_migration", &migration.id))
    }

    fn db_migration_status<'a>(&'a self, migration: &'a DbMigration) -> ProvisionFuture<'a, JobStatus> {
        done(Ok(self.job_status("db_migration_status", &migration.id)))
    }

    fn rollback_db_migration<'a>(
        &'a self,
        migration: &'a DbMigration,
        _installation: &'a Installation,
    ) -> ProvisionFuture<'a, ()> {
        done(self.call("rollback_db_migration", &migration.id))
    }
}

impl DnsProvider for DryRunBackend {
    fn upsert_records<'a>(&'a self, domains: &'a [String], target: &'a str) -> ProvisionFuture<'a, ()> {
        let result = self.call("upsert_records", &domains.join(",")).map(|()| {
            let mut state = self.state();
            for domain in domains {
                state.dns.insert(domain.clone(), target.to_string());
            }
        });
        done(result)
    }

    fn delete_records<'a>(&'a self, domains: &'a [String]) -> ProvisionFuture<'a, ()> {
        let result = self.call("delete_records", &domains.join(",")).map(|()| {
            let mut state = self.state();
            for domain in domains {
                state.dns.remove(domain);
            }
        });
        done(result)
    }
}

impl NodeDrainer for DryRunBackend {
    fn cordon<'a>(&'a self, _cluster_id: &'a str, node: &'a str) -> DrainFuture<'a, ()> {
        let result = self.call("cordon", node).map(|()| {
            self.state().cordoned.insert(node.to_string());
        });
        drained(result)
    }

    fn uncordon<'a>(&'a self, _cluster_id: &'a str, node: &'a str) -> DrainFuture<'a, ()> {
        let result = self.call("uncordon", node).map(|()| {
            self.state().cordoned.remove(node);
        });
        drained(result)
    }

    fn list_pods<'a>(&'a self, _cluster_id: &'a str, node: &'a str) -> DrainFuture<'a, Vec<String>> {
        let result = self
            .call("list_pods", node)
            .map(|()| (0..PODS_PER_NODE).map(|i| format!("{node}-pod-{i}")).collect());
        drained(result)
    }

    fn evict_pod<'a>(
        &'a self,
        _cluster_id: &'a str,
        _node: &'a str,
        pod: &'a str,
        _grace: Duration,
    ) -> DrainFuture<'a, ()> {
        drained(self.call("evict_pod", pod))
    }

    fn replace_nodes<'a>(
        &'a self,
        cluster_id: &'a str,
        nodes: &'a [String],
    ) -> DrainFuture<'a, Vec<String>> {
        let result = self.call("replace_nodes", &nodes.join(",")).map(|()| {
            let mut state = self.state();
            let mut next = state.next_node;
            let mut replacements = Vec::with_capacity(nodes.len());
            for _ in nodes {
                replacements.push(format!("{cluster_id}-node-{next}"));
                next += 1;
            }
            state.next_node = next;
            for node in nodes {
                state.cordoned.remove(node);
            }
            let current = state.nodes.entry(cluster_id.to_string()).or_default();
            current.retain(|n| !nodes.contains(n));
            current.extend(replacements.iter().cloned());
            replacements
        });
        drained(result)
    }

    fn node_ready<'a>(&'a self, _cluster_id: &'a str, node: &'a str) -> DrainFuture<'a, bool> {
        drained(self.call("node_ready", node).map(|()| true))
    }
}
