//! Installation supervisor, including placement onto clusters.
//!
//! A new installation is placed by listing schedulable clusters, ranking
//! them with the placement engine and then taking each candidate's lock in
//! order. Under the lock the cluster's utilization and tenants are read
//! again and the placement policy's eligibility check is repeated.

use shipyard_core::config::PlacementConfig;
use shipyard_core::new_id;
use shipyard_placement::{
    Candidate, PlacementPolicy, ResourceRequest, cluster_to_candidate, installation_request,
    is_isolated, rank_candidates,
};
use shipyard_state::{
    Cluster, ClusterInstallation, ClusterInstallationState, ClusterOperation, ClusterState,
    DatabaseType, Group, Installation, InstallationState, MultitenantDatabase, Phase, Record,
};
use tracing::{debug, info, warn};

use super::SupervisorDeps;
use crate::error::SupervisorResult;
use crate::lock::LockGuard;
use crate::scheduler::{Supervisor, WorkFuture};

type CiState = ClusterInstallationState;

pub struct InstallationSupervisor {
    deps: SupervisorDeps,
    owner: String,
    policy: PlacementPolicy,
}

/// A cluster picked for placement, still locked.
struct Chosen {
    cluster: Cluster,
    scale_up: Option<u32>,
    _guard: LockGuard<Cluster>,
}

/// Whether new installations may be bound to a cluster in `state`.
fn schedulable(state: ClusterState) -> bool {
    match state.operation() {
        Some((ClusterOperation::Creation | ClusterOperation::Deletion, _)) => false,
        Some(_) => true,
        None => state == ClusterState::Stable,
    }
}

impl InstallationSupervisor {
    pub fn new(deps: SupervisorDeps, placement: &PlacementConfig) -> Self {
        let owner = deps.owner("installation");
        Self {
            deps,
            owner,
            policy: PlacementPolicy::from_config(placement),
        }
    }

    pub async fn run_once(&self) -> SupervisorResult<()> {
        let installations = self.deps.store.list_all::<Installation>(|i| {
            InstallationState::SUPERVISED.contains(&i.state) && !i.meta.api_locked
        })?;
        for installation in installations {
            if let Err(e) = self.supervise(&installation.id).await {
                warn!(installation = %installation.id, error = %e, "installation supervision failed");
            }
        }
        Ok(())
    }

    pub async fn supervise(&self, installation_id: &str) -> SupervisorResult<()> {
        let Some(_guard) = self.deps.lock::<Installation>(installation_id, &self.owner)? else {
            return Ok(());
        };
        let mut installation = self.deps.store.require::<Installation>(installation_id)?;
        if installation.is_deleted()
            || installation.meta.api_locked
            || !InstallationState::SUPERVISED.contains(&installation.state)
        {
            return Ok(());
        }
        self.deps.recorder.warn_if_stuck(&installation);

        use InstallationState as S;
        match installation.state {
            S::CreationRequested => self.create(&mut installation).await,
            S::CreationInProgress => self.await_creation(&mut installation).await,
            S::CreationFailed => self.retry(&mut installation, S::CreationRequested),
            S::UpdateRequested => self.request_update(&mut installation),
            S::UpdateInProgress => self.await_update(&mut installation),
            S::UpdateFailed => self.retry(&mut installation, S::UpdateRequested),
            S::HibernationRequested => self.hibernate(&mut installation).await,
            S::WakeUpRequested => self.wake_up(&mut installation).await,
            S::DeletionRequested => self.request_deletion(&mut installation).await,
            S::DeletionInProgress => self.await_deletion(&mut installation),
            S::DeletionFailed => self.retry(&mut installation, S::DeletionRequested),
            S::Stable | S::Hibernating | S::DeletionPending | S::Deleted => Ok(()),
        }
    }

    fn retry(&self, installation: &mut Installation, to: InstallationState) -> SupervisorResult<()> {
        self.deps.recorder.transition(installation, to)?;
        Ok(())
    }

    // ── Creation ───────────────────────────────────────────────────

    async fn create(&self, installation: &mut Installation) -> SupervisorResult<()> {
        let recorder = &self.deps.recorder;
        if !self.deps.live_cluster_installations(&installation.id)?.is_empty() {
            recorder.transition(installation, InstallationState::CreationInProgress)?;
            return Ok(());
        }

        if installation.database_type == DatabaseType::Multitenant
            && !self.assign_database(installation)?
        {
            recorder.note_error(installation, "no multitenant database available")?;
            return Ok(());
        }

        let request = installation_request(installation)?;
        let Some(chosen) = self.place(installation, &request).await? else {
            recorder.note_error(installation, "no cluster has capacity for this installation")?;
            return Ok(());
        };
        let Chosen {
            mut cluster,
            scale_up,
            _guard,
        } = chosen;

        if let Some(nodes) = scale_up {
            self.request_scale_up(&mut cluster, nodes)?;
        }

        let mut ci = ClusterInstallation::new(new_id(), &cluster.id, &installation.id, true, self.deps.now());
        self.deps.store.create(&mut ci)?;
        info!(
            installation = %installation.id,
            cluster = %cluster.id,
            cluster_installation = %ci.id,
            "installation placed"
        );
        recorder.transition(installation, InstallationState::CreationInProgress)?;
        Ok(())
    }

    /// Give a multitenant installation a schema. False when no database exists.
    fn assign_database(&self, installation: &mut Installation) -> SupervisorResult<bool> {
        let store = &self.deps.store;
        let existing = match &installation.database_id {
            Some(id) => store.get::<MultitenantDatabase>(id)?,
            None => None,
        };
        let mut database = match existing {
            Some(database) => database,
            None => {
                let databases = store.list_all::<MultitenantDatabase>(|_| true)?;
                match databases.into_iter().min_by_key(|d| d.installation_count()) {
                    Some(database) => database,
                    None => return Ok(false),
                }
            }
        };
        if database.find(&installation.id).is_none() {
            let assignment = database.assign(&installation.id);
            store.update(&mut database)?;
            debug!(
                installation = %installation.id,
                database = %database.id,
                logical_database = %assignment.logical_database,
                schema = %assignment.schema,
                "database schema assigned"
            );
        }
        if installation.database_id.as_deref() != Some(database.id.as_str()) {
            installation.database_id = Some(database.id.clone());
            store.update(installation)?;
        }
        Ok(true)
    }

    /// Rank schedulable clusters and lock the first that still fits.
    async fn place(
        &self,
        installation: &Installation,
        request: &ResourceRequest,
    ) -> SupervisorResult<Option<Chosen>> {
        let clusters = self
            .deps
            .store
            .list_all::<Cluster>(|c| schedulable(c.state))?;
        let mut candidates: Vec<Candidate> = Vec::with_capacity(clusters.len());
        for cluster in &clusters {
            let resources = match self.deps.backends.clusters.cluster_resources(cluster).await {
                Ok(resources) => resources,
                Err(e) => {
                    warn!(cluster = %cluster.id, error = %e, "cluster resources unavailable");
                    continue;
                }
            };
            let hosted = self.hosted_installations(&cluster.id, &installation.id)?;
            candidates.push(cluster_to_candidate(cluster, resources, &hosted));
        }

        let isolated = is_isolated(installation);
        let ranked = rank_candidates(&candidates, request, isolated, &self.policy);
        for candidate in ranked {
            if let Some(chosen) = self.claim(&candidate.cluster_id, installation, request, isolated).await? {
                return Ok(Some(chosen));
            }
        }
        Ok(None)
    }

    /// Lock a ranked cluster and decide its eligibility again from fresh
    /// state. Another replica may have bound an installation since the
    /// ranking snapshot was taken.
    async fn claim(
        &self,
        cluster_id: &str,
        installation: &Installation,
        request: &ResourceRequest,
        isolated: bool,
    ) -> SupervisorResult<Option<Chosen>> {
        let Some(guard) = self.deps.lock::<Cluster>(cluster_id, &self.owner)? else {
            return Ok(None);
        };
        let cluster = self.deps.store.require::<Cluster>(cluster_id)?;
        if cluster.is_deleted() || !schedulable(cluster.state) {
            return Ok(None);
        }
        let resources = match self.deps.backends.clusters.cluster_resources(&cluster).await {
            Ok(resources) => resources,
            Err(e) => {
                warn!(cluster = %cluster.id, error = %e, "cluster resources unavailable");
                return Ok(None);
            }
        };
        let hosted = self.hosted_installations(&cluster.id, &installation.id)?;
        let fresh = cluster_to_candidate(&cluster, resources, &hosted);
        if !self.policy.eligible(&fresh, isolated) {
            debug!(cluster = %cluster.id, "cluster no longer eligible under lock");
            return Ok(None);
        }
        let placement = self.policy.placement(&fresh, request);
        Ok(Some(Chosen {
            cluster,
            scale_up: placement.scale_up,
            _guard: guard,
        }))
    }

    /// Live installations bound to `cluster_id`, other than `except`.
    fn hosted_installations(&self, cluster_id: &str, except: &str) -> SupervisorResult<Vec<Installation>> {
        let cis = self.deps.store.list_all::<ClusterInstallation>(|ci| {
            ci.cluster_id == cluster_id
                && ci.installation_id != except
                && ci.state != CiState::Deleted
        })?;
        let mut hosted = Vec::with_capacity(cis.len());
        for ci in cis {
            if let Some(installation) = self.deps.store.get::<Installation>(&ci.installation_id)?
                && !installation.is_deleted()
            {
                hosted.push(installation);
            }
        }
        Ok(hosted)
    }

    /// Ask a locked cluster for `nodes` more nodes.
    fn request_scale_up(&self, cluster: &mut Cluster, nodes: u32) -> SupervisorResult<()> {
        if cluster.state != ClusterState::Stable {
            debug!(cluster = %cluster.id, state = %cluster.state, "cluster busy, scale-up skipped");
            return Ok(());
        }
        let min = cluster.metadata.node_min_count + nodes;
        let max = cluster.metadata.node_max_count.max(min);
        let change = cluster.change_request.get_or_insert_with(Default::default);
        change.node_min_count = Some(min);
        change.node_max_count = Some(max);
        info!(cluster = %cluster.id, nodes, new_min = min, "requesting cluster scale-up");
        self.deps
            .recorder
            .transition(cluster, ClusterOperation::Resize.state(Phase::Requested))?;
        Ok(())
    }

    async fn await_creation(&self, installation: &mut Installation) -> SupervisorResult<()> {
        let recorder = &self.deps.recorder;
        let cis = self.deps.live_cluster_installations(&installation.id)?;
        if cis.is_empty() {
            warn!(installation = %installation.id, "no cluster installation, placing again");
            recorder.transition(installation, InstallationState::CreationRequested)?;
            return Ok(());
        }
        if let Some(failed) = cis.iter().find(|ci| ci.state == CiState::CreationFailed) {
            let reason = failed
                .last_error
                .clone()
                .unwrap_or_else(|| format!("cluster installation {} failed", failed.id));
            recorder.fail(installation, InstallationState::CreationFailed, reason)?;
            return Ok(());
        }
        if !cis.iter().all(|ci| ci.state == CiState::Stable) {
            return Ok(());
        }
        let Some(active) = cis.iter().find(|ci| ci.is_active) else {
            return Ok(());
        };
        if let Err(e) = self.point_dns(installation, &active.cluster_id).await {
            recorder.note_error(installation, e)?;
            return Ok(());
        }
        recorder.transition(installation, InstallationState::Stable)?;
        Ok(())
    }

    /// Upsert the installation's records to the cluster's endpoint. The
    /// caller persists the updated targets.
    async fn point_dns(&self, installation: &mut Installation, cluster_id: &str) -> SupervisorResult<()> {
        let cluster = self.deps.store.require::<Cluster>(cluster_id)?;
        let endpoint = self.deps.backends.clusters.cluster_endpoint(&cluster).await?;
        let domains = installation.domain_names();
        self.deps.backends.dns.upsert_records(&domains, &endpoint).await?;
        for record in &mut installation.dns_records {
            record.target = endpoint.clone();
        }
        debug!(installation = %installation.id, %endpoint, "dns records upserted");
        Ok(())
    }

    // ── Updates ────────────────────────────────────────────────────

    fn request_update(&self, installation: &mut Installation) -> SupervisorResult<()> {
        let cis = self.deps.live_cluster_installations(&installation.id)?;
        let mut guards = Vec::with_capacity(cis.len());
        for ci in &cis {
            match self.deps.lock::<ClusterInstallation>(&ci.id, &self.owner)? {
                Some(guard) => guards.push(guard),
                None => return Ok(()),
            }
        }
        for ci in &cis {
            let mut ci = self.deps.store.require::<ClusterInstallation>(&ci.id)?;
            if matches!(ci.state, CiState::Stable | CiState::ReconcilingFailed) {
                self.deps.recorder.transition(&mut ci, CiState::Reconciling)?;
            }
        }
        self.deps
            .recorder
            .transition(installation, InstallationState::UpdateInProgress)?;
        Ok(())
    }

    fn await_update(&self, installation: &mut Installation) -> SupervisorResult<()> {
        let cis = self.deps.live_cluster_installations(&installation.id)?;
        if let Some(failed) = cis.iter().find(|ci| ci.state == CiState::ReconcilingFailed) {
            let reason = failed
                .last_error
                .clone()
                .unwrap_or_else(|| format!("cluster installation {} failed to reconcile", failed.id));
            self.deps
                .recorder
                .fail(installation, InstallationState::UpdateFailed, reason)?;
        } else if cis.iter().all(|ci| ci.state == CiState::Stable) {
            self.deps
                .recorder
                .transition(installation, InstallationState::Stable)?;
        }
        Ok(())
    }

    // ── Hibernation ────────────────────────────────────────────────

    async fn hibernate(&self, installation: &mut Installation) -> SupervisorResult<()> {
        let provisioner = &self.deps.backends.installations;
        for ci in self.deps.live_cluster_installations(&installation.id)? {
            let cluster = self.deps.store.require::<Cluster>(&ci.cluster_id)?;
            if let Err(e) = provisioner
                .hibernate_cluster_installation(&cluster, installation, &ci)
                .await
            {
                self.deps.recorder.note_error(installation, e)?;
                return Ok(());
            }
        }
        self.deps
            .recorder
            .transition(installation, InstallationState::Hibernating)?;
        Ok(())
    }

    async fn wake_up(&self, installation: &mut Installation) -> SupervisorResult<()> {
        let group = match &installation.group_id {
            Some(id) => self.deps.store.get::<Group>(id)?,
            None => None,
        };
        let config = installation.effective_config(group.as_ref());
        let fingerprint = config.fingerprint();
        let provisioner = &self.deps.backends.installations;

        for ci in self.deps.live_cluster_installations(&installation.id)? {
            let Some(_ci_guard) = self.deps.lock::<ClusterInstallation>(&ci.id, &self.owner)? else {
                return Ok(());
            };
            let mut ci = self.deps.store.require::<ClusterInstallation>(&ci.id)?;
            let cluster = self.deps.store.require::<Cluster>(&ci.cluster_id)?;
            if let Err(e) = provisioner
                .provision_cluster_installation(&cluster, installation, &ci, &config)
                .await
            {
                self.deps.recorder.note_error(installation, e)?;
                return Ok(());
            }
            if ci.applied_fingerprint.as_deref() != Some(fingerprint.as_str()) {
                ci.applied_fingerprint = Some(fingerprint.clone());
                self.deps.store.update(&mut ci)?;
            }
        }
        self.deps
            .recorder
            .transition(installation, InstallationState::Stable)?;
        Ok(())
    }

    // ── Deletion ───────────────────────────────────────────────────

    async fn request_deletion(&self, installation: &mut Installation) -> SupervisorResult<()> {
        if installation.deletion_locked {
            warn!(installation = %installation.id, "deletion locked, not deleting");
            return Ok(());
        }
        let domains = installation.domain_names();
        if !domains.is_empty()
            && let Err(e) = self.deps.backends.dns.delete_records(&domains).await
        {
            self.deps.recorder.note_error(installation, e)?;
            return Ok(());
        }

        let cis = self.deps.live_cluster_installations(&installation.id)?;
        let mut guards = Vec::with_capacity(cis.len());
        for ci in &cis {
            match self.deps.lock::<ClusterInstallation>(&ci.id, &self.owner)? {
                Some(guard) => guards.push(guard),
                None => return Ok(()),
            }
        }
        for ci in &cis {
            let mut ci = self.deps.store.require::<ClusterInstallation>(&ci.id)?;
            if !matches!(
                ci.state,
                CiState::DeletionRequested | CiState::DeletionInProgress | CiState::DeletionFailed
            ) {
                self.deps
                    .recorder
                    .transition(&mut ci, CiState::DeletionRequested)?;
            }
        }
        self.deps
            .recorder
            .transition(installation, InstallationState::DeletionInProgress)?;
        Ok(())
    }

    fn await_deletion(&self, installation: &mut Installation) -> SupervisorResult<()> {
        let cis = self.deps.live_cluster_installations(&installation.id)?;
        if let Some(failed) = cis.iter().find(|ci| ci.state == CiState::DeletionFailed) {
            let reason = failed
                .last_error
                .clone()
                .unwrap_or_else(|| format!("cluster installation {} failed to delete", failed.id));
            self.deps
                .recorder
                .fail(installation, InstallationState::DeletionFailed, reason)?;
            return Ok(());
        }
        if !cis.is_empty() {
            return Ok(());
        }
        self.release_database(installation)?;
        self.deps.recorder.mark_deleted(installation);
        self.deps
            .recorder
            .transition(installation, InstallationState::Deleted)?;
        Ok(())
    }

    fn release_database(&self, installation: &Installation) -> SupervisorResult<()> {
        let Some(database_id) = &installation.database_id else {
            return Ok(());
        };
        let Some(mut database) = self.deps.store.get::<MultitenantDatabase>(database_id)? else {
            return Ok(());
        };
        if database.release(&installation.id) {
            self.deps.store.update(&mut database)?;
            debug!(installation = %installation.id, database = %database_id, "database schema released");
        }
        Ok(())
    }
}

impl Supervisor for InstallationSupervisor {
    fn name(&self) -> &'static str {
        "installation"
    }

    fn do_work(&self) -> WorkFuture<'_> {
        Box::pin(self.run_once())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisors::testing::{Harness, installation as fixture};
    use shipyard_state::{Affinity, ClusterMetadata};

    fn supervisor(harness: &Harness) -> InstallationSupervisor {
        InstallationSupervisor::new(
            harness.deps.clone(),
            &PlacementConfig {
                cluster_resource_threshold: Some(80),
                ..Default::default()
            },
        )
    }

    fn state(harness: &Harness, id: &str) -> InstallationState {
        harness.store().require::<Installation>(id).unwrap().state
    }

    fn cis(harness: &Harness, installation_id: &str) -> Vec<ClusterInstallation> {
        harness.deps.live_cluster_installations(installation_id).unwrap()
    }

    fn settle_cis(harness: &Harness, installation_id: &str, to: CiState) {
        for mut ci in cis(harness, installation_id) {
            ci.state = to;
            harness.store().update(&mut ci).unwrap();
        }
    }

    #[tokio::test]
    async fn placement_creates_an_active_cluster_installation() {
        let harness = Harness::new();
        harness.stable_cluster("c1");
        harness.installation("i1", InstallationState::CreationRequested);
        let supervisor = supervisor(&harness);

        supervisor.supervise("i1").await.unwrap();
        assert_eq!(state(&harness, "i1"), InstallationState::CreationInProgress);
        let bound = cis(&harness, "i1");
        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0].cluster_id, "c1");
        assert!(bound[0].is_active);
        assert_eq!(bound[0].state, CiState::CreationRequested);

        // Waits for the cluster installation.
        supervisor.supervise("i1").await.unwrap();
        assert_eq!(state(&harness, "i1"), InstallationState::CreationInProgress);

        settle_cis(&harness, "i1", CiState::Stable);
        supervisor.supervise("i1").await.unwrap();
        let installation = harness.store().require::<Installation>("i1").unwrap();
        assert_eq!(installation.state, InstallationState::Stable);
        assert_eq!(installation.dns_records[0].target, "c1.ingress.dry-run.local");
        assert_eq!(
            harness.backend.dns_target("i1.example.com").as_deref(),
            Some("c1.ingress.dry-run.local")
        );
    }

    #[tokio::test]
    async fn second_installation_waits_when_cluster_crosses_threshold() {
        let harness = Harness::new();
        harness.stable_cluster("c1");
        harness.backend.set_base_usage(
            "c1",
            ResourceRequest {
                cpu_millis: 6_320,
                memory_bytes: 0,
                pods: 0,
            },
        );
        harness.installation("i1", InstallationState::CreationRequested);
        harness.installation("i2", InstallationState::CreationRequested);
        let supervisor = supervisor(&harness);

        supervisor.run_once().await.unwrap();
        assert_eq!(state(&harness, "i1"), InstallationState::CreationInProgress);
        assert_eq!(state(&harness, "i2"), InstallationState::CreationRequested);
        assert!(cis(&harness, "i2").is_empty());
        let deferred = harness.store().require::<Installation>("i2").unwrap();
        assert!(deferred.last_error.is_some());

        // A new cluster becomes eligible.
        harness.stable_cluster("c2");
        supervisor.run_once().await.unwrap();
        assert_eq!(state(&harness, "i2"), InstallationState::CreationInProgress);
        assert_eq!(cis(&harness, "i2")[0].cluster_id, "c2");
    }

    #[tokio::test]
    async fn scale_value_requests_a_resize() {
        let harness = Harness::new();
        harness.stable_cluster("c1");
        harness.backend.set_base_usage(
            "c1",
            ResourceRequest {
                cpu_millis: 6_320,
                memory_bytes: 0,
                pods: 0,
            },
        );
        harness.installation("i1", InstallationState::CreationRequested);
        let supervisor = InstallationSupervisor::new(
            harness.deps.clone(),
            &PlacementConfig {
                cluster_resource_threshold: Some(80),
                cluster_resource_threshold_scale_value: Some(2),
                ..Default::default()
            },
        );

        supervisor.supervise("i1").await.unwrap();
        let cluster = harness.store().require::<Cluster>("c1").unwrap();
        assert_eq!(cluster.state, ClusterState::ResizeRequested);
        let change = cluster.change_request.unwrap();
        assert_eq!(change.node_min_count, Some(4));
        assert_eq!(cis(&harness, "i1").len(), 1);
    }

    #[tokio::test]
    async fn isolated_installations_get_their_own_cluster() {
        let harness = Harness::new();
        harness.stable_cluster("c1");
        harness.stable_cluster("c2");
        let mut tenant = ClusterInstallation::new("ci0".into(), "c1", "i0", true, 0);
        harness.installation("i0", InstallationState::Stable);
        harness.store().create(&mut tenant).unwrap();

        let mut isolated = fixture("i1", InstallationState::CreationRequested);
        isolated.affinity = Affinity::Isolated;
        harness.store().create(&mut isolated).unwrap();

        supervisor(&harness).supervise("i1").await.unwrap();
        assert_eq!(cis(&harness, "i1")[0].cluster_id, "c2");
    }

    #[tokio::test]
    async fn isolation_is_checked_again_under_the_lock() {
        let harness = Harness::new();
        harness.stable_cluster("c1");
        let mut isolated = fixture("i1", InstallationState::CreationRequested);
        isolated.affinity = Affinity::Isolated;
        harness.store().create(&mut isolated).unwrap();
        let supervisor = supervisor(&harness);
        let request = installation_request(&isolated).unwrap();

        // Ranked while c1 was empty, then another tenant is bound to it.
        harness.installation("i0", InstallationState::Stable);
        let mut tenant = ClusterInstallation::new("ci0".into(), "c1", "i0", true, 0);
        harness.store().create(&mut tenant).unwrap();

        let claimed = supervisor.claim("c1", &isolated, &request, true).await.unwrap();
        assert!(claimed.is_none());
        // The lock is released again when the claim is refused.
        assert!(harness.store().require::<Cluster>("c1").unwrap().meta.lock.holder().is_none());
        assert!(supervisor.claim("c1", &isolated, &request, false).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn clusters_being_created_are_not_candidates() {
        let harness = Harness::new();
        let mut cluster = Cluster::new("c1".into(), "aws", ClusterMetadata::default(), 0);
        harness.store().create(&mut cluster).unwrap();
        harness.installation("i1", InstallationState::CreationRequested);
        supervisor(&harness).supervise("i1").await.unwrap();
        assert_eq!(state(&harness, "i1"), InstallationState::CreationRequested);
    }

    #[tokio::test]
    async fn multitenant_installation_gets_a_schema() {
        let harness = Harness::new();
        harness.stable_cluster("c1");
        let mut database = MultitenantDatabase::new("db1".into(), "db:5432".into(), 10, 0);
        harness.store().create(&mut database).unwrap();
        let mut installation = fixture("i1", InstallationState::CreationRequested);
        installation.database_type = DatabaseType::Multitenant;
        harness.store().create(&mut installation).unwrap();

        supervisor(&harness).supervise("i1").await.unwrap();
        let installation = harness.store().require::<Installation>("i1").unwrap();
        assert_eq!(installation.database_id.as_deref(), Some("db1"));
        let database = harness.store().require::<MultitenantDatabase>("db1").unwrap();
        assert!(database.find("i1").is_some());
    }

    #[tokio::test]
    async fn update_reconciles_every_cluster_installation() {
        let harness = Harness::new();
        harness.stable_cluster("c1");
        harness.installation("i1", InstallationState::UpdateRequested);
        let mut ci = ClusterInstallation::new("ci1".into(), "c1", "i1", true, 0);
        ci.state = CiState::Stable;
        harness.store().create(&mut ci).unwrap();
        let supervisor = supervisor(&harness);

        supervisor.supervise("i1").await.unwrap();
        assert_eq!(state(&harness, "i1"), InstallationState::UpdateInProgress);
        assert_eq!(cis(&harness, "i1")[0].state, CiState::Reconciling);

        settle_cis(&harness, "i1", CiState::ReconcilingFailed);
        supervisor.supervise("i1").await.unwrap();
        assert_eq!(state(&harness, "i1"), InstallationState::UpdateFailed);
        supervisor.supervise("i1").await.unwrap();
        assert_eq!(state(&harness, "i1"), InstallationState::UpdateRequested);
        supervisor.supervise("i1").await.unwrap();
        assert_eq!(cis(&harness, "i1")[0].state, CiState::Reconciling);

        settle_cis(&harness, "i1", CiState::Stable);
        supervisor.supervise("i1").await.unwrap();
        assert_eq!(state(&harness, "i1"), InstallationState::Stable);
    }

    #[tokio::test]
    async fn hibernation_failure_is_recorded_and_retried() {
        let harness = Harness::new();
        harness.stable_cluster("c1");
        harness.installation("i1", InstallationState::HibernationRequested);
        let mut ci = ClusterInstallation::new("ci1".into(), "c1", "i1", true, 0);
        ci.state = CiState::Stable;
        harness.store().create(&mut ci).unwrap();
        harness.backend.fail_next("hibernate_cluster_installation", 1);
        let supervisor = supervisor(&harness);

        supervisor.supervise("i1").await.unwrap();
        let installation = harness.store().require::<Installation>("i1").unwrap();
        assert_eq!(installation.state, InstallationState::HibernationRequested);
        assert!(installation.last_error.is_some());

        supervisor.supervise("i1").await.unwrap();
        assert_eq!(state(&harness, "i1"), InstallationState::Hibernating);

        let mut installation = harness.store().require::<Installation>("i1").unwrap();
        installation.state = InstallationState::WakeUpRequested;
        harness.store().update(&mut installation).unwrap();
        supervisor.supervise("i1").await.unwrap();
        assert_eq!(state(&harness, "i1"), InstallationState::Stable);
        assert!(cis(&harness, "i1")[0].applied_fingerprint.is_some());
    }

    #[tokio::test]
    async fn deletion_removes_dns_and_cluster_installations() {
        let harness = Harness::new();
        harness.stable_cluster("c1");
        let mut database = MultitenantDatabase::new("db1".into(), "db:5432".into(), 10, 0);
        database.assign("i1");
        harness.store().create(&mut database).unwrap();
        let mut installation = fixture("i1", InstallationState::DeletionRequested);
        installation.database_type = DatabaseType::Multitenant;
        installation.database_id = Some("db1".into());
        harness.store().create(&mut installation).unwrap();
        let mut ci = ClusterInstallation::new("ci1".into(), "c1", "i1", true, 0);
        ci.state = CiState::Stable;
        harness.store().create(&mut ci).unwrap();
        let supervisor = supervisor(&harness);

        supervisor.supervise("i1").await.unwrap();
        assert_eq!(state(&harness, "i1"), InstallationState::DeletionInProgress);
        assert_eq!(cis(&harness, "i1")[0].state, CiState::DeletionRequested);
        assert_eq!(harness.backend.call_count("delete_records"), 1);

        supervisor.supervise("i1").await.unwrap();
        assert_eq!(state(&harness, "i1"), InstallationState::DeletionInProgress);

        harness.store().soft_delete::<ClusterInstallation>("ci1", 5).unwrap();
        supervisor.supervise("i1").await.unwrap();
        let deleted = harness.store().require::<Installation>("i1").unwrap();
        assert_eq!(deleted.state, InstallationState::Deleted);
        assert!(deleted.is_deleted());
        let database = harness.store().require::<MultitenantDatabase>("db1").unwrap();
        assert!(database.find("i1").is_none());
    }
}
