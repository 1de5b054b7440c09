//! The binding of one installation to one cluster.

use serde::{Deserialize, Serialize};

use crate::event::ResourceKind;
use crate::record::{RecordMeta, ResourceState, impl_record, impl_stateful, state_names};
use crate::tables::CLUSTER_INSTALLATIONS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterInstallationState {
    CreationRequested,
    CreationInProgress,
    CreationFailed,
    Stable,
    Reconciling,
    ReconcilingFailed,
    DeletionRequested,
    DeletionInProgress,
    DeletionFailed,
    Deleted,
}

state_names!(ClusterInstallationState {
    CreationRequested => "creation-requested",
    CreationInProgress => "creation-in-progress",
    CreationFailed => "creation-failed",
    Stable => "stable",
    Reconciling => "reconciling",
    ReconcilingFailed => "reconciling-failed",
    DeletionRequested => "deletion-requested",
    DeletionInProgress => "deletion-in-progress",
    DeletionFailed => "deletion-failed",
    Deleted => "deleted",
});

impl ResourceState for ClusterInstallationState {
    fn as_str(&self) -> &'static str {
        self.name()
    }

    fn is_failed(&self) -> bool {
        matches!(
            self,
            ClusterInstallationState::CreationFailed
                | ClusterInstallationState::ReconcilingFailed
                | ClusterInstallationState::DeletionFailed
        )
    }

    fn is_settled(&self) -> bool {
        matches!(
            self,
            ClusterInstallationState::Stable | ClusterInstallationState::Deleted
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterInstallation {
    pub id: String,
    pub state: ClusterInstallationState,
    pub cluster_id: String,
    pub installation_id: String,
    /// Serving traffic. Only false on the far side of a migration.
    pub is_active: bool,
    /// Fingerprint of the effective config last provisioned.
    pub applied_fingerprint: Option<String>,
    pub last_error: Option<String>,
    pub failed_since: Option<u64>,
    #[serde(flatten)]
    pub meta: RecordMeta,
}

impl_record!(
    ClusterInstallation,
    ResourceKind::ClusterInstallation,
    CLUSTER_INSTALLATIONS
);
impl_stateful!(ClusterInstallation, ClusterInstallationState);

impl ClusterInstallation {
    pub fn new(
        id: String,
        cluster_id: &str,
        installation_id: &str,
        is_active: bool,
        now: u64,
    ) -> Self {
        Self {
            id,
            state: ClusterInstallationState::CreationRequested,
            cluster_id: cluster_id.to_string(),
            installation_id: installation_id.to_string(),
            is_active,
            applied_fingerprint: None,
            last_error: None,
            failed_since: None,
            meta: RecordMeta::new(now),
        }
    }
}

/// Listing filter for cluster installations.
#[derive(Debug, Clone, Default)]
pub struct ClusterInstallationFilter {
    pub cluster_id: Option<String>,
    pub installation_id: Option<String>,
    pub is_active: Option<bool>,
}

impl ClusterInstallationFilter {
    pub fn cluster(cluster_id: &str) -> Self {
        Self {
            cluster_id: Some(cluster_id.to_string()),
            ..Self::default()
        }
    }

    pub fn installation(installation_id: &str) -> Self {
        Self {
            installation_id: Some(installation_id.to_string()),
            ..Self::default()
        }
    }

    pub fn matches(&self, ci: &ClusterInstallation) -> bool {
        self.cluster_id.as_deref().is_none_or(|c| c == ci.cluster_id)
            && self
                .installation_id
                .as_deref()
                .is_none_or(|i| i == ci.installation_id)
            && self.is_active.is_none_or(|a| a == ci.is_active)
    }
}
