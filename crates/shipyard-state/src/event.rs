//! State change events and webhook subscriptions.

use serde::{Deserialize, Serialize};

use crate::record::{RecordMeta, ResourceState, Stateful, impl_record};
use crate::tables::SUBSCRIPTIONS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Cluster,
    Installation,
    ClusterInstallation,
    Group,
    MultitenantDatabase,
    Backup,
    Restoration,
    Import,
    DbMigration,
    Subscription,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Cluster => "cluster",
            ResourceKind::Installation => "installation",
            ResourceKind::ClusterInstallation => "cluster_installation",
            ResourceKind::Group => "group",
            ResourceKind::MultitenantDatabase => "multitenant_database",
            ResourceKind::Backup => "backup",
            ResourceKind::Restoration => "restoration",
            ResourceKind::Import => "import",
            ResourceKind::DbMigration => "db_migration",
            ResourceKind::Subscription => "subscription",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted state transition. Append-only, keyed by `sequence`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangeEvent {
    /// Assigned by the store on append.
    pub sequence: u64,
    pub resource_type: ResourceKind,
    pub resource_id: String,
    pub old_state: String,
    pub new_state: String,
    pub timestamp: u64,
    pub owner_id: Option<String>,
}

impl StateChangeEvent {
    /// Event for `record` having moved from `old` to its current state.
    pub fn transition<R: Stateful>(record: &R, old: R::State, timestamp: u64) -> Self {
        Self {
            sequence: 0,
            resource_type: R::KIND,
            resource_id: record.id().to_string(),
            old_state: old.as_str().to_string(),
            new_state: record.state().as_str().to_string(),
            timestamp,
            owner_id: record.owner_id().map(str::to_string),
        }
    }
}

/// A webhook endpoint receiving state change events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub url: String,
    /// Only deliver events for resources with this owner.
    pub owner_id: Option<String>,
    /// Only deliver events for this resource type.
    pub resource_type: Option<ResourceKind>,
    /// Delivery cursor: every event up to this sequence has been acknowledged.
    pub last_delivered_sequence: u64,
    pub failure_count: u32,
    pub degraded: bool,
    pub last_attempt_at: u64,
    #[serde(flatten)]
    pub meta: RecordMeta,
}

impl_record!(Subscription, ResourceKind::Subscription, SUBSCRIPTIONS);

impl Subscription {
    pub fn new(id: String, url: String, now: u64) -> Self {
        Self {
            id,
            url,
            owner_id: None,
            resource_type: None,
            last_delivered_sequence: 0,
            failure_count: 0,
            degraded: false,
            last_attempt_at: 0,
            meta: RecordMeta::new(now),
        }
    }

    /// Whether `event` passes this subscription's filters.
    pub fn matches(&self, event: &StateChangeEvent) -> bool {
        if let Some(kind) = self.resource_type
            && kind != event.resource_type
        {
            return false;
        }
        match &self.owner_id {
            Some(owner) => event.owner_id.as_deref() == Some(owner.as_str()),
            None => true,
        }
    }
}
