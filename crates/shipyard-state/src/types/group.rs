//! Installation groups: shared configuration rolled out to members.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use shipyard_core::Patch;

use crate::event::ResourceKind;
use crate::record::{RecordMeta, impl_record};
use crate::tables::GROUPS;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub version: Option<String>,
    pub image: Option<String>,
    pub env: BTreeMap<String, String>,
    /// Members updated concurrently. Zero means unlimited.
    pub max_rolling: u32,
    /// Bumped on every configuration change.
    pub sequence: u64,
    #[serde(flatten)]
    pub meta: RecordMeta,
}

impl_record!(Group, ResourceKind::Group, GROUPS);

impl Group {
    pub fn new(id: String, name: String, now: u64) -> Self {
        Self {
            id,
            name,
            version: None,
            image: None,
            env: BTreeMap::new(),
            max_rolling: 1,
            sequence: 1,
            meta: RecordMeta::new(now),
        }
    }

    /// Free rolling slots given `updating` members already in flight.
    pub fn rolling_capacity(&self, updating: usize) -> usize {
        if self.max_rolling == 0 {
            usize::MAX
        } else {
            (self.max_rolling as usize).saturating_sub(updating)
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupPatch {
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub name: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub version: Patch<Option<String>>,
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub image: Patch<Option<String>>,
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub env: Patch<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub max_rolling: Patch<u32>,
}

impl GroupPatch {
    /// Apply to `group`. A change to the rolled-out configuration bumps
    /// `sequence`; renames and rolling limits do not.
    pub fn apply(&self, group: &mut Group) -> bool {
        let mut config_changed = self.version.apply_to(&mut group.version);
        config_changed |= self.image.apply_to(&mut group.image);
        config_changed |= self.env.apply_to(&mut group.env);
        if config_changed {
            group.sequence += 1;
        }
        let mut changed = self.name.apply_to(&mut group.name);
        changed |= self.max_rolling.apply_to(&mut group.max_rolling);
        changed || config_changed
    }
}
