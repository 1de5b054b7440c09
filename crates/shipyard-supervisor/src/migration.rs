//! Cross-cluster migration of installations.
//!
//! A migration is four operator-driven steps, each safe to re-run:
//!
//! 1. [`MigrationWorkflow::migrate_installations`] creates an inactive
//!    cluster installation on the target for every installation on the
//!    source. The cluster installation supervisor provisions them.
//! 2. [`MigrationWorkflow::switch_dns`] repoints DNS at the target and swaps
//!    which cluster installation is active.
//! 3. [`MigrationWorkflow::delete_inactive_cluster_installations`] tears down
//!    the cluster installations left behind.
//! 4. [`MigrationWorkflow::switch_cluster_roles`] swaps primary and secondary.
//!
//! Every step reports how many records it changed; a repeated call reports
//! zero changes.

use serde::Serialize;
use shipyard_core::new_id;
use shipyard_state::{
    Cluster, ClusterInstallation, ClusterInstallationState, ClusterRole, Installation, Record,
};
use tracing::{debug, info};

use crate::error::{MigrationError, MigrationResult};
use crate::lock::LockGuard;
use crate::supervisors::SupervisorDeps;

type CiState = ClusterInstallationState;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationSummary {
    pub changed: usize,
    pub unchanged: usize,
    /// Cluster installations the step touched or found already done.
    pub cluster_installation_ids: Vec<String>,
}

impl MigrationSummary {
    fn changed(&mut self, id: &str) {
        self.changed += 1;
        self.cluster_installation_ids.push(id.to_string());
    }

    fn unchanged(&mut self, id: &str) {
        self.unchanged += 1;
        self.cluster_installation_ids.push(id.to_string());
    }
}

/// What `delete_inactive_cluster_installations` cleans up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupScope {
    /// Every inactive cluster installation on the cluster.
    Cluster(String),
    /// One cluster installation, which must be inactive.
    ClusterInstallation(String),
}

#[derive(Clone, Debug)]
pub struct MigrationWorkflow {
    deps: SupervisorDeps,
    owner: String,
}

impl MigrationWorkflow {
    pub fn new(deps: SupervisorDeps) -> Self {
        let owner = deps.owner("migration");
        Self { deps, owner }
    }

    fn cluster(&self, id: &str) -> MigrationResult<Cluster> {
        self.deps
            .store
            .get::<Cluster>(id)?
            .filter(|c| !c.is_deleted())
            .ok_or_else(|| MigrationError::ClusterNotFound(id.to_string()))
    }

    fn live_on(&self, cluster_id: &str, installation_id: &str) -> MigrationResult<Option<ClusterInstallation>> {
        Ok(self
            .deps
            .store
            .list_all::<ClusterInstallation>(|ci| {
                ci.cluster_id == cluster_id
                    && ci.installation_id == installation_id
                    && ci.state != CiState::Deleted
            })?
            .into_iter()
            .next())
    }

    fn lock<R: Record>(&self, id: &str) -> MigrationResult<LockGuard<R>> {
        LockGuard::try_acquire(&self.deps.store, id, &self.owner, self.deps.now())?
            .ok_or_else(|| MigrationError::Locked(format!("{} {id}", R::KIND)))
    }

    /// Step 1: create inactive cluster installations on `target` for the
    /// installations on `source`, or only for `installation_id`.
    pub fn migrate_installations(
        &self,
        source: &str,
        target: &str,
        installation_id: Option<&str>,
    ) -> MigrationResult<MigrationSummary> {
        if source == target {
            return Err(MigrationError::SameCluster(source.to_string()));
        }
        self.cluster(source)?;
        let target_cluster = self.cluster(target)?;
        if !target_cluster.allow_installations {
            return Err(MigrationError::TargetClosed(target.to_string()));
        }

        let on_source = self.deps.store.list_all::<ClusterInstallation>(|ci| {
            ci.cluster_id == source
                && ci.state != CiState::Deleted
                && installation_id.is_none_or(|id| id == ci.installation_id)
        })?;
        if let Some(id) = installation_id
            && on_source.is_empty()
        {
            return Err(MigrationError::NotOnSource {
                installation: id.to_string(),
                cluster: source.to_string(),
            });
        }

        let mut summary = MigrationSummary::default();
        for ci in on_source {
            if let Some(existing) = self.live_on(target, &ci.installation_id)? {
                summary.unchanged(&existing.id);
                continue;
            }
            let mut copy = ClusterInstallation::new(
                new_id(),
                target,
                &ci.installation_id,
                false,
                self.deps.now(),
            );
            self.deps.store.create(&mut copy)?;
            info!(
                installation = %ci.installation_id,
                source,
                target,
                cluster_installation = %copy.id,
                "inactive cluster installation created on target"
            );
            summary.changed(&copy.id);
        }
        Ok(summary)
    }

    /// Step 2: point each installation's DNS at `target` and make its target
    /// cluster installation the active one.
    ///
    /// With `lock_installations` each installation is API-locked for the
    /// duration of its cut-over, and unlocked again even if it fails.
    pub async fn switch_dns(
        &self,
        source: &str,
        target: &str,
        installation_ids: &[String],
        lock_installations: bool,
    ) -> MigrationResult<MigrationSummary> {
        self.cluster(source)?;
        let target_cluster = self.cluster(target)?;
        let endpoint = self
            .deps
            .backends
            .clusters
            .cluster_endpoint(&target_cluster)
            .await?;

        let mut summary = MigrationSummary::default();
        for installation_id in installation_ids {
            if self
                .deps
                .store
                .get::<Installation>(installation_id)?
                .is_none_or(|i| i.is_deleted())
            {
                return Err(MigrationError::InstallationNotFound(installation_id.clone()));
            }
            let _guard = self.lock::<Installation>(installation_id)?;
            let mut installation = self.deps.store.require::<Installation>(installation_id)?;
            let target_ci = match self.live_on(target, installation_id)? {
                Some(ci) if ci.state == CiState::Stable => ci,
                _ => {
                    return Err(MigrationError::TargetNotReady {
                        installation: installation_id.clone(),
                        cluster: target.to_string(),
                    });
                }
            };
            let source_ci = self.live_on(source, installation_id)?;

            let done = target_ci.is_active
                && source_ci.as_ref().is_none_or(|ci| !ci.is_active)
                && installation.dns_records.iter().all(|r| r.target == endpoint);
            if done {
                summary.unchanged(&target_ci.id);
                continue;
            }

            let locked_here =
                lock_installations && self.deps.store.set_api_lock::<Installation>(installation_id, true)?;
            let result = self
                .cut_over(&mut installation, &target_ci, source_ci.as_ref(), &endpoint)
                .await;
            if locked_here {
                self.deps.store.set_api_lock::<Installation>(installation_id, false)?;
            }
            result?;
            info!(installation = %installation_id, source, target, %endpoint, "dns switched to target cluster");
            summary.changed(&target_ci.id);
        }
        Ok(summary)
    }

    async fn cut_over(
        &self,
        installation: &mut Installation,
        target_ci: &ClusterInstallation,
        source_ci: Option<&ClusterInstallation>,
        endpoint: &str,
    ) -> MigrationResult<()> {
        let _target_lock = self.lock::<ClusterInstallation>(&target_ci.id)?;
        let _source_lock = match source_ci {
            Some(ci) => Some(self.lock::<ClusterInstallation>(&ci.id)?),
            None => None,
        };

        let domains = installation.domain_names();
        self.deps.backends.dns.upsert_records(&domains, endpoint).await?;
        if installation.dns_records.iter().any(|r| r.target != endpoint) {
            for record in &mut installation.dns_records {
                record.target = endpoint.to_string();
            }
            self.deps.store.update(installation)?;
        }

        let mut target_ci = self.deps.store.require::<ClusterInstallation>(&target_ci.id)?;
        if !target_ci.is_active {
            target_ci.is_active = true;
            self.deps.store.update(&mut target_ci)?;
        }
        if let Some(source_ci) = source_ci {
            let mut source_ci = self.deps.store.require::<ClusterInstallation>(&source_ci.id)?;
            if source_ci.is_active {
                source_ci.is_active = false;
                self.deps.store.update(&mut source_ci)?;
            }
        }
        Ok(())
    }

    /// Step 3: request deletion of inactive cluster installations.
    pub fn delete_inactive_cluster_installations(
        &self,
        scope: &CleanupScope,
    ) -> MigrationResult<MigrationSummary> {
        let candidates = match scope {
            CleanupScope::Cluster(cluster_id) => {
                self.cluster(cluster_id)?;
                self.deps.store.list_all::<ClusterInstallation>(|ci| {
                    ci.cluster_id == *cluster_id && !ci.is_active && ci.state != CiState::Deleted
                })?
            }
            CleanupScope::ClusterInstallation(id) => {
                let ci = self
                    .deps
                    .store
                    .get::<ClusterInstallation>(id)?
                    .ok_or_else(|| MigrationError::ClusterInstallationNotFound(id.clone()))?;
                if ci.is_active {
                    return Err(MigrationError::StillActive(id.clone()));
                }
                vec![ci]
            }
        };

        let mut summary = MigrationSummary::default();
        for candidate in candidates {
            let _guard = self.lock::<ClusterInstallation>(&candidate.id)?;
            let mut ci = self.deps.store.require::<ClusterInstallation>(&candidate.id)?;
            if ci.is_active {
                return Err(MigrationError::StillActive(ci.id));
            }
            if matches!(
                ci.state,
                CiState::DeletionRequested
                    | CiState::DeletionInProgress
                    | CiState::DeletionFailed
                    | CiState::Deleted
            ) {
                summary.unchanged(&ci.id);
                continue;
            }
            self.deps.recorder.transition(&mut ci, CiState::DeletionRequested)?;
            summary.changed(&ci.id);
        }
        debug!(changed = summary.changed, unchanged = summary.unchanged, "inactive cluster installations cleaned up");
        Ok(summary)
    }

    /// Step 4: `secondary` becomes the primary cluster and takes new
    /// installations; `primary` becomes the secondary and stops taking them.
    pub fn switch_cluster_roles(&self, primary: &str, secondary: &str) -> MigrationResult<MigrationSummary> {
        if primary == secondary {
            return Err(MigrationError::SameCluster(primary.to_string()));
        }
        self.cluster(primary)?;
        self.cluster(secondary)?;
        let _primary_lock = self.lock::<Cluster>(primary)?;
        let _secondary_lock = self.lock::<Cluster>(secondary)?;

        let mut summary = MigrationSummary::default();
        for (id, role, allow) in [
            (secondary, ClusterRole::Primary, true),
            (primary, ClusterRole::Secondary, false),
        ] {
            let mut cluster = self.deps.store.require::<Cluster>(id)?;
            if cluster.role == Some(role) && cluster.allow_installations == allow {
                summary.unchanged += 1;
                continue;
            }
            cluster.role = Some(role);
            cluster.allow_installations = allow;
            self.deps.store.update(&mut cluster)?;
            info!(cluster = %id, ?role, allow_installations = allow, "cluster role switched");
            summary.changed += 1;
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisors::ClusterInstallationSupervisor;
    use crate::supervisors::testing::Harness;
    use shipyard_state::InstallationState;

    const A_ENDPOINT: &str = "cluster-a.ingress.dry-run.local";
    const B_ENDPOINT: &str = "cluster-b.ingress.dry-run.local";

    /// Installation `x` served by a stable, active cluster installation on `cluster-a`.
    fn setup(harness: &Harness) -> MigrationWorkflow {
        harness.stable_cluster("cluster-a");
        harness.stable_cluster("cluster-b");
        let mut installation = harness.installation("x", InstallationState::Stable);
        for record in &mut installation.dns_records {
            record.target = A_ENDPOINT.to_string();
        }
        harness.store().update(&mut installation).unwrap();
        let mut ci = ClusterInstallation::new("ci-a".into(), "cluster-a", "x", true, 0);
        ci.state = CiState::Stable;
        harness.store().create(&mut ci).unwrap();
        MigrationWorkflow::new(harness.deps.clone())
    }

    fn live_cis(harness: &Harness) -> Vec<ClusterInstallation> {
        harness
            .store()
            .list_all::<ClusterInstallation>(|ci| ci.installation_id == "x" && ci.state != CiState::Deleted)
            .unwrap()
    }

    async fn settle(harness: &Harness, ci_id: &str) {
        let supervisor = ClusterInstallationSupervisor::new(harness.deps.clone());
        for _ in 0..3 {
            supervisor.supervise(ci_id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn full_migration_leaves_one_active_installation_on_target() {
        let harness = Harness::new();
        let workflow = setup(&harness);

        let migrated = workflow.migrate_installations("cluster-a", "cluster-b", None).unwrap();
        assert_eq!(migrated.changed, 1);
        let target_ci = migrated.cluster_installation_ids[0].clone();
        let created = harness.store().require::<ClusterInstallation>(&target_ci).unwrap();
        assert!(!created.is_active);
        assert_eq!(created.cluster_id, "cluster-b");

        // Not provisioned yet.
        let err = workflow
            .switch_dns("cluster-a", "cluster-b", &["x".to_string()], true)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::TargetNotReady { .. }));

        settle(&harness, &target_ci).await;
        let switched = workflow
            .switch_dns("cluster-a", "cluster-b", &["x".to_string()], true)
            .await
            .unwrap();
        assert_eq!(switched.changed, 1);
        assert_eq!(harness.backend.dns_target("x.example.com").as_deref(), Some(B_ENDPOINT));
        let installation = harness.store().require::<Installation>("x").unwrap();
        assert!(!installation.meta.api_locked);
        assert_eq!(installation.dns_records[0].target, B_ENDPOINT);

        let cleaned = workflow
            .delete_inactive_cluster_installations(&CleanupScope::Cluster("cluster-a".into()))
            .unwrap();
        assert_eq!(cleaned.cluster_installation_ids, vec!["ci-a".to_string()]);
        settle(&harness, "ci-a").await;

        let live = live_cis(&harness);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].cluster_id, "cluster-b");
        assert!(live[0].is_active);

        // Every step is idempotent.
        assert_eq!(workflow.migrate_installations("cluster-a", "cluster-b", None).unwrap().changed, 0);
        let again = workflow
            .switch_dns("cluster-a", "cluster-b", &["x".to_string()], false)
            .await
            .unwrap();
        assert_eq!((again.changed, again.unchanged), (0, 1));
        let cleaned = workflow
            .delete_inactive_cluster_installations(&CleanupScope::Cluster("cluster-a".into()))
            .unwrap();
        assert_eq!(cleaned.changed, 0);
    }

    #[test]
    fn migrate_is_idempotent_and_validates_clusters() {
        let harness = Harness::new();
        let workflow = setup(&harness);
        assert_eq!(workflow.migrate_installations("cluster-a", "cluster-b", Some("x")).unwrap().changed, 1);
        let again = workflow.migrate_installations("cluster-a", "cluster-b", Some("x")).unwrap();
        assert_eq!((again.changed, again.unchanged), (0, 1));

        assert!(matches!(
            workflow.migrate_installations("cluster-a", "nope", None),
            Err(MigrationError::ClusterNotFound(_))
        ));
        assert!(matches!(
            workflow.migrate_installations("cluster-a", "cluster-a", None),
            Err(MigrationError::SameCluster(_))
        ));
        assert!(matches!(
            workflow.migrate_installations("cluster-b", "cluster-a", Some("x")),
            Err(MigrationError::NotOnSource { .. })
        ));

        let mut closed = harness.store().require::<Cluster>("cluster-b").unwrap();
        closed.allow_installations = false;
        harness.store().update(&mut closed).unwrap();
        assert!(matches!(
            workflow.migrate_installations("cluster-a", "cluster-b", None),
            Err(MigrationError::TargetClosed(_))
        ));
    }

    #[test]
    fn active_cluster_installation_cannot_be_cleaned_up() {
        let harness = Harness::new();
        let workflow = setup(&harness);
        let err = workflow
            .delete_inactive_cluster_installations(&CleanupScope::ClusterInstallation("ci-a".into()))
            .unwrap_err();
        assert!(matches!(err, MigrationError::StillActive(_)));
        // Cluster scope only picks inactive ones.
        let summary = workflow
            .delete_inactive_cluster_installations(&CleanupScope::Cluster("cluster-a".into()))
            .unwrap();
        assert_eq!(summary, MigrationSummary::default());
    }

    #[tokio::test]
    async fn switch_dns_reports_locked_installations() {
        let harness = Harness::new();
        let workflow = setup(&harness);
        harness.store().lock::<Installation>("x", "someone-else", 0).unwrap();
        let err = workflow
            .switch_dns("cluster-a", "cluster-b", &["x".to_string()], true)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Locked(_)));
        assert_eq!(harness.backend.dns_target("x.example.com"), None);
    }

    #[test]
    fn roles_swap_once() {
        let harness = Harness::new();
        let workflow = setup(&harness);
        let summary = workflow.switch_cluster_roles("cluster-a", "cluster-b").unwrap();
        assert_eq!(summary.changed, 2);
        let a = harness.store().require::<Cluster>("cluster-a").unwrap();
        let b = harness.store().require::<Cluster>("cluster-b").unwrap();
        assert_eq!(a.role, Some(ClusterRole::Secondary));
        assert!(!a.allow_installations);
        assert_eq!(b.role, Some(ClusterRole::Primary));
        assert!(b.allow_installations);
        // Released on return.
        assert!(a.meta.lock.holder().is_none());

        let again = workflow.switch_cluster_roles("cluster-a", "cluster-b").unwrap();
        assert_eq!((again.changed, again.unchanged), (0, 2));
    }
}
