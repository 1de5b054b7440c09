//! Installations: one tenant workload and its desired configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shipyard_core::Patch;

use crate::event::ResourceKind;
use crate::record::{RecordMeta, ResourceState, impl_record, impl_stateful, state_names};
use crate::tables::INSTALLATIONS;
use crate::types::group::Group;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallationState {
    CreationRequested,
    CreationInProgress,
    CreationFailed,
    Stable,
    UpdateRequested,
    UpdateInProgress,
    UpdateFailed,
    HibernationRequested,
    Hibernating,
    WakeUpRequested,
    DeletionPending,
    DeletionRequested,
    DeletionInProgress,
    DeletionFailed,
    Deleted,
}

state_names!(InstallationState {
    CreationRequested => "creation-requested",
    CreationInProgress => "creation-in-progress",
    CreationFailed => "creation-failed",
    Stable => "stable",
    UpdateRequested => "update-requested",
    UpdateInProgress => "update-in-progress",
    UpdateFailed => "update-failed",
    HibernationRequested => "hibernation-requested",
    Hibernating => "hibernating",
    WakeUpRequested => "wake-up-requested",
    DeletionPending => "deletion-pending",
    DeletionRequested => "deletion-requested",
    DeletionInProgress => "deletion-in-progress",
    DeletionFailed => "deletion-failed",
    Deleted => "deleted",
});

impl InstallationState {
    /// States the installation supervisor drives. `deletion-pending` belongs
    /// to the deletion sweep.
    pub const SUPERVISED: &'static [InstallationState] = &[
        InstallationState::CreationRequested,
        InstallationState::CreationInProgress,
        InstallationState::CreationFailed,
        InstallationState::UpdateRequested,
        InstallationState::UpdateInProgress,
        InstallationState::UpdateFailed,
        InstallationState::HibernationRequested,
        InstallationState::WakeUpRequested,
        InstallationState::DeletionRequested,
        InstallationState::DeletionInProgress,
        InstallationState::DeletionFailed,
    ];

    pub fn is_deleting(self) -> bool {
        matches!(
            self,
            InstallationState::DeletionRequested | InstallationState::DeletionInProgress
        )
    }

    pub fn is_updating(self) -> bool {
        matches!(
            self,
            InstallationState::UpdateRequested | InstallationState::UpdateInProgress
        )
    }
}

impl ResourceState for InstallationState {
    fn as_str(&self) -> &'static str {
        self.name()
    }

    fn is_failed(&self) -> bool {
        matches!(
            self,
            InstallationState::CreationFailed
                | InstallationState::UpdateFailed
                | InstallationState::DeletionFailed
        )
    }

    fn is_settled(&self) -> bool {
        matches!(
            self,
            InstallationState::Stable
                | InstallationState::Hibernating
                | InstallationState::DeletionPending
                | InstallationState::Deleted
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatabaseType {
    #[default]
    SingleTenant,
    Multitenant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilestoreType {
    #[default]
    Bucket,
    SharedBucket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Affinity {
    /// Sole tenant of its cluster.
    Isolated,
    #[default]
    Multitenant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub domain_name: String,
    pub is_primary: bool,
    /// Endpoint the record currently resolves to. Empty until first upsert.
    #[serde(default)]
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Installation {
    pub id: String,
    pub state: InstallationState,
    pub owner_id: String,
    pub group_id: Option<String>,
    /// Group sequence last rolled onto this installation.
    pub group_sequence: Option<u64>,
    pub version: String,
    pub image: String,
    pub size: String,
    pub database_type: DatabaseType,
    pub filestore_type: FilestoreType,
    /// Multitenant database hosting this installation's schema.
    pub database_id: Option<String>,
    pub env: BTreeMap<String, String>,
    pub affinity: Affinity,
    pub dns_records: Vec<DnsRecord>,
    pub deletion_locked: bool,
    pub deletion_pending_expiry: Option<u64>,
    /// State to return to if a pending deletion is cancelled.
    #[serde(default)]
    pub resume_state: Option<InstallationState>,
    pub last_error: Option<String>,
    pub failed_since: Option<u64>,
    #[serde(flatten)]
    pub meta: RecordMeta,
}

impl_record!(
    Installation,
    ResourceKind::Installation,
    INSTALLATIONS,
    owner = owner_id,
    guarded = deletion_locked
);
impl_stateful!(Installation, InstallationState);

impl Installation {
    pub fn primary_dns(&self) -> Option<&DnsRecord> {
        self.dns_records.iter().find(|r| r.is_primary)
    }

    pub fn domain_names(&self) -> Vec<String> {
        self.dns_records.iter().map(|r| r.domain_name.clone()).collect()
    }

    /// Configuration actually deployed: the group's version, image and env
    /// take precedence, with the installation's own env overrides on top.
    pub fn effective_config(&self, group: Option<&Group>) -> EffectiveConfig {
        let mut config = EffectiveConfig {
            version: self.version.clone(),
            image: self.image.clone(),
            size: self.size.clone(),
            env: BTreeMap::new(),
        };
        if let Some(group) = group {
            if let Some(version) = &group.version {
                config.version = version.clone();
            }
            if let Some(image) = &group.image {
                config.image = image.clone();
            }
            config.env.extend(group.env.clone());
        }
        config.env.extend(self.env.clone());
        config
    }
}

/// The fully-resolved configuration provisioned onto a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub version: String,
    pub image: String,
    pub size: String,
    pub env: BTreeMap<String, String>,
}

impl EffectiveConfig {
    /// Stable sha256 over the serialized config. `BTreeMap` keeps env order fixed.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(bytes))
    }
}

/// Check that the DNS records name exactly one primary.
pub fn validate_dns_records(records: &[DnsRecord]) -> Result<(), String> {
    if records.is_empty() {
        return Err("at least one DNS record is required".to_string());
    }
    let primaries = records.iter().filter(|r| r.is_primary).count();
    if primaries != 1 {
        return Err(format!("exactly one primary DNS record required, found {primaries}"));
    }
    for record in records {
        if !shipyard_core::validate::is_valid_dns_name(&record.domain_name) {
            return Err(format!("invalid DNS name {:?}", record.domain_name));
        }
    }
    Ok(())
}

/// Mutable installation settings exposed to the API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallationPatch {
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub version: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub image: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub size: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub env: Patch<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub owner_id: Patch<String>,
}

impl InstallationPatch {
    /// Apply to `installation`, returning whether anything changed.
    pub fn apply(&self, installation: &mut Installation) -> bool {
        let mut changed = self.version.apply_to(&mut installation.version);
        changed |= self.image.apply_to(&mut installation.image);
        changed |= self.size.apply_to(&mut installation.size);
        changed |= self.env.apply_to(&mut installation.env);
        changed |= self.owner_id.apply_to(&mut installation.owner_id);
        changed
    }

    /// Whether the patch touches anything that must be re-provisioned.
    pub fn affects_deployment(&self) -> bool {
        !(self.version.is_keep() && self.image.is_keep() && self.size.is_keep() && self.env.is_keep())
    }
}
