//! Clusters and their state machine vocabulary.

use serde::{Deserialize, Serialize};
use shipyard_core::{Patch, RotatorConfig};

use crate::event::ResourceKind;
use crate::record::{RecordMeta, ResourceState, impl_record, impl_stateful, state_names};
use crate::tables::CLUSTERS;

/// Provider value for clusters this system does not provision itself.
pub const EXTERNAL_PROVIDER: &str = "external";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterState {
    CreationRequested,
    CreationInProgress,
    CreationFailed,
    ProvisioningRequested,
    ProvisioningInProgress,
    ProvisioningFailed,
    UpgradeRequested,
    UpgradeInProgress,
    UpgradeFailed,
    ResizeRequested,
    ResizeInProgress,
    ResizeFailed,
    DeletionRequested,
    DeletionInProgress,
    DeletionFailed,
    Stable,
    Deleted,
}

state_names!(ClusterState {
    CreationRequested => "creation-requested",
    CreationInProgress => "creation-in-progress",
    CreationFailed => "creation-failed",
    ProvisioningRequested => "provisioning-requested",
    ProvisioningInProgress => "provisioning-in-progress",
    ProvisioningFailed => "provisioning-failed",
    UpgradeRequested => "upgrade-requested",
    UpgradeInProgress => "upgrade-in-progress",
    UpgradeFailed => "upgrade-failed",
    ResizeRequested => "resize-requested",
    ResizeInProgress => "resize-in-progress",
    ResizeFailed => "resize-failed",
    DeletionRequested => "deletion-requested",
    DeletionInProgress => "deletion-in-progress",
    DeletionFailed => "deletion-failed",
    Stable => "stable",
    Deleted => "deleted",
});

/// The long-running operations a cluster goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterOperation {
    Creation,
    Provisioning,
    Upgrade,
    Resize,
    Deletion,
}

/// Where a cluster is within one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Requested,
    InProgress,
    Failed,
}

impl ClusterOperation {
    pub fn state(self, phase: Phase) -> ClusterState {
        use ClusterOperation::*;
        use ClusterState as S;
        match (self, phase) {
            (Creation, Phase::Requested) => S::CreationRequested,
            (Creation, Phase::InProgress) => S::CreationInProgress,
            (Creation, Phase::Failed) => S::CreationFailed,
            (Provisioning, Phase::Requested) => S::ProvisioningRequested,
            (Provisioning, Phase::InProgress) => S::ProvisioningInProgress,
            (Provisioning, Phase::Failed) => S::ProvisioningFailed,
            (Upgrade, Phase::Requested) => S::UpgradeRequested,
            (Upgrade, Phase::InProgress) => S::UpgradeInProgress,
            (Upgrade, Phase::Failed) => S::UpgradeFailed,
            (Resize, Phase::Requested) => S::ResizeRequested,
            (Resize, Phase::InProgress) => S::ResizeInProgress,
            (Resize, Phase::Failed) => S::ResizeFailed,
            (Deletion, Phase::Requested) => S::DeletionRequested,
            (Deletion, Phase::InProgress) => S::DeletionInProgress,
            (Deletion, Phase::Failed) => S::DeletionFailed,
        }
    }

    /// State reached when the operation succeeds.
    pub fn completed(self) -> ClusterState {
        match self {
            ClusterOperation::Deletion => ClusterState::Deleted,
            _ => ClusterState::Stable,
        }
    }
}

impl ClusterState {
    /// Operation and phase this state belongs to, or `None` for `stable`/`deleted`.
    pub fn operation(self) -> Option<(ClusterOperation, Phase)> {
        use ClusterOperation::*;
        use ClusterState as S;
        let pair = match self {
            S::CreationRequested => (Creation, Phase::Requested),
            S::CreationInProgress => (Creation, Phase::InProgress),
            S::CreationFailed => (Creation, Phase::Failed),
            S::ProvisioningRequested => (Provisioning, Phase::Requested),
            S::ProvisioningInProgress => (Provisioning, Phase::InProgress),
            S::ProvisioningFailed => (Provisioning, Phase::Failed),
            S::UpgradeRequested => (Upgrade, Phase::Requested),
            S::UpgradeInProgress => (Upgrade, Phase::InProgress),
            S::UpgradeFailed => (Upgrade, Phase::Failed),
            S::ResizeRequested => (Resize, Phase::Requested),
            S::ResizeInProgress => (Resize, Phase::InProgress),
            S::ResizeFailed => (Resize, Phase::Failed),
            S::DeletionRequested => (Deletion, Phase::Requested),
            S::DeletionInProgress => (Deletion, Phase::InProgress),
            S::DeletionFailed => (Deletion, Phase::Failed),
            S::Stable | S::Deleted => return None,
        };
        Some(pair)
    }

    /// States the cluster supervisor acts on.
    pub fn needs_work(self) -> bool {
        self.operation().is_some()
    }
}

impl ResourceState for ClusterState {
    fn as_str(&self) -> &'static str {
        self.name()
    }

    fn is_failed(&self) -> bool {
        matches!(self.operation(), Some((_, Phase::Failed)))
    }

    fn is_settled(&self) -> bool {
        matches!(self, ClusterState::Stable | ClusterState::Deleted)
    }
}

/// Which side of a migration pair a cluster is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterRole {
    Primary,
    Secondary,
}

/// Provider-specific shape of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMetadata {
    pub size: String,
    pub node_instance_type: String,
    pub node_min_count: u32,
    pub node_max_count: u32,
    pub networking: String,
    pub image: String,
    pub kubernetes_version: String,
}

impl Default for ClusterMetadata {
    fn default() -> Self {
        Self {
            size: "SizeAlef500".to_string(),
            node_instance_type: "m5.large".to_string(),
            node_min_count: 2,
            node_max_count: 2,
            networking: "calico".to_string(),
            image: String::new(),
            kubernetes_version: "1.29.0".to_string(),
        }
    }
}

/// Pending upgrade or resize parameters, folded into the metadata once the
/// operation succeeds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterChangeRequest {
    pub kubernetes_version: Option<String>,
    pub image: Option<String>,
    pub node_instance_type: Option<String>,
    pub node_min_count: Option<u32>,
    pub node_max_count: Option<u32>,
    pub rotator: Option<RotatorConfig>,
}

impl ClusterChangeRequest {
    pub fn apply_to(&self, metadata: &mut ClusterMetadata) {
        if let Some(v) = &self.kubernetes_version {
            metadata.kubernetes_version = v.clone();
        }
        if let Some(v) = &self.image {
            metadata.image = v.clone();
        }
        if let Some(v) = &self.node_instance_type {
            metadata.node_instance_type = v.clone();
        }
        if let Some(v) = self.node_min_count {
            metadata.node_min_count = v;
        }
        if let Some(v) = self.node_max_count {
            metadata.node_max_count = v;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub state: ClusterState,
    pub provider: String,
    pub metadata: ClusterMetadata,
    pub change_request: Option<ClusterChangeRequest>,
    pub allow_installations: bool,
    pub role: Option<ClusterRole>,
    pub annotations: Vec<String>,
    pub last_error: Option<String>,
    pub failed_since: Option<u64>,
    #[serde(flatten)]
    pub meta: RecordMeta,
}

impl_record!(Cluster, ResourceKind::Cluster, CLUSTERS);
impl_stateful!(Cluster, ClusterState);

impl Cluster {
    /// A freshly requested cluster.
    pub fn new(id: String, provider: &str, metadata: ClusterMetadata, now: u64) -> Self {
        Self {
            id,
            state: ClusterState::CreationRequested,
            provider: provider.to_string(),
            metadata,
            change_request: None,
            allow_installations: true,
            role: None,
            annotations: Vec::new(),
            last_error: None,
            failed_since: None,
            meta: RecordMeta::new(now),
        }
    }

    /// Managed outside this system; only scheduled onto, never provisioned.
    pub fn is_external(&self) -> bool {
        self.provider == EXTERNAL_PROVIDER
    }
}

/// Mutable cluster settings exposed to the API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterPatch {
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub allow_installations: Patch<bool>,
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub annotations: Patch<Vec<String>>,
}

impl ClusterPatch {
    /// Apply to `cluster`, returning whether anything changed.
    pub fn apply(&self, cluster: &mut Cluster) -> bool {
        let mut changed = self.allow_installations.apply_to(&mut cluster.allow_installations);
        changed |= self.annotations.apply_to(&mut cluster.annotations);
        changed
    }
}
