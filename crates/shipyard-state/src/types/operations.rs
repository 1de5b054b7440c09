//! Installation operations: backups, restorations, imports and database
//! migrations. Terminal records are never mutated again except by soft delete.

use serde::{Deserialize, Serialize};

use crate::event::ResourceKind;
use crate::record::{RecordMeta, ResourceState, impl_record, impl_stateful, state_names};
use crate::tables::{BACKUPS, DB_MIGRATIONS, IMPORTS, RESTORATIONS};

/// Lifecycle shared by backups, restorations and imports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationState {
    Requested,
    InProgress,
    Succeeded,
    Failed,
}

state_names!(OperationState {
    Requested => "requested",
    InProgress => "in-progress",
    Succeeded => "succeeded",
    Failed => "failed",
});

impl ResourceState for OperationState {
    fn as_str(&self) -> &'static str {
        self.name()
    }

    // A failed job is terminal, not retried.
    fn is_failed(&self) -> bool {
        false
    }

    fn is_settled(&self) -> bool {
        matches!(self, OperationState::Succeeded | OperationState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub state: OperationState,
    pub installation_id: String,
    /// Object store location, known once the job has started.
    pub location: Option<String>,
    pub last_error: Option<String>,
    pub failed_since: Option<u64>,
    #[serde(flatten)]
    pub meta: RecordMeta,
}

impl_record!(Backup, ResourceKind::Backup, BACKUPS);
impl_stateful!(Backup, OperationState);

impl Backup {
    pub fn new(id: String, installation_id: &str, now: u64) -> Self {
        Self {
            id,
            state: OperationState::Requested,
            installation_id: installation_id.to_string(),
            location: None,
            last_error: None,
            failed_since: None,
            meta: RecordMeta::new(now),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Restoration {
    pub id: String,
    pub state: OperationState,
    pub installation_id: String,
    pub backup_id: String,
    pub last_error: Option<String>,
    pub failed_since: Option<u64>,
    #[serde(flatten)]
    pub meta: RecordMeta,
}

impl_record!(Restoration, ResourceKind::Restoration, RESTORATIONS);
impl_stateful!(Restoration, OperationState);

impl Restoration {
    pub fn new(id: String, installation_id: &str, backup_id: &str, now: u64) -> Self {
        Self {
            id,
            state: OperationState::Requested,
            installation_id: installation_id.to_string(),
            backup_id: backup_id.to_string(),
            last_error: None,
            failed_since: None,
            meta: RecordMeta::new(now),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Import {
    pub id: String,
    pub state: OperationState,
    pub installation_id: String,
    pub archive_url: String,
    pub last_error: Option<String>,
    pub failed_since: Option<u64>,
    #[serde(flatten)]
    pub meta: RecordMeta,
}

impl_record!(Import, ResourceKind::Import, IMPORTS);
impl_stateful!(Import, OperationState);

impl Import {
    pub fn new(id: String, installation_id: &str, archive_url: &str, now: u64) -> Self {
        Self {
            id,
            state: OperationState::Requested,
            installation_id: installation_id.to_string(),
            archive_url: archive_url.to_string(),
            last_error: None,
            failed_since: None,
            meta: RecordMeta::new(now),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DbMigrationState {
    Requested,
    InProgress,
    Succeeded,
    Failed,
    Committed,
    RollbackRequested,
    RolledBack,
}

state_names!(DbMigrationState {
    Requested => "requested",
    InProgress => "in-progress",
    Succeeded => "succeeded",
    Failed => "failed",
    Committed => "committed",
    RollbackRequested => "rollback-requested",
    RolledBack => "rolled-back",
});

impl ResourceState for DbMigrationState {
    fn as_str(&self) -> &'static str {
        self.name()
    }

    fn is_failed(&self) -> bool {
        false
    }

    fn is_settled(&self) -> bool {
        matches!(
            self,
            DbMigrationState::Succeeded
                | DbMigrationState::Failed
                | DbMigrationState::Committed
                | DbMigrationState::RolledBack
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbMigration {
    pub id: String,
    pub state: DbMigrationState,
    pub installation_id: String,
    pub source_database_id: String,
    pub destination_database_id: String,
    pub last_error: Option<String>,
    pub failed_since: Option<u64>,
    #[serde(flatten)]
    pub meta: RecordMeta,
}

impl_record!(DbMigration, ResourceKind::DbMigration, DB_MIGRATIONS);
impl_stateful!(DbMigration, DbMigrationState);

impl DbMigration {
    pub fn new(
        id: String,
        installation_id: &str,
        source_database_id: &str,
        destination_database_id: &str,
        now: u64,
    ) -> Self {
        Self {
            id,
            state: DbMigrationState::Requested,
            installation_id: installation_id.to_string(),
            source_database_id: source_database_id.to_string(),
            destination_database_id: destination_database_id.to_string(),
            last_error: None,
            failed_since: None,
            meta: RecordMeta::new(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_state_names() {
        for state in OperationState::ALL {
            let json = serde_json::to_string(state).unwrap();
            assert_eq!(json, format!("\"{state}\""));
        }
        for state in DbMigrationState::ALL {
            let json = serde_json::to_string(state).unwrap();
            assert_eq!(json, format!("\"{state}\""));
        }
    }

    #[test]
    fn terminal_states() {
        assert!(OperationState::Failed.is_settled());
        assert!(!OperationState::InProgress.is_settled());
        assert!(DbMigrationState::RolledBack.is_settled());
        assert!(!DbMigrationState::RollbackRequested.is_settled());
    }
}
