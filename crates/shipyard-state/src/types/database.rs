//! Shared multitenant databases and their per-installation schemas.

use serde::{Deserialize, Serialize};

use crate::event::ResourceKind;
use crate::record::{RecordMeta, impl_record};
use crate::tables::MULTITENANT_DATABASES;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSchema {
    pub installation_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalDatabase {
    pub name: String,
    pub schemas: Vec<DatabaseSchema>,
}

/// Where an installation's schema landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaAssignment {
    pub logical_database: String,
    pub schema: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultitenantDatabase {
    pub id: String,
    /// Connection endpoint of the shared database cluster.
    pub endpoint: String,
    pub max_installations_per_logical_database: u32,
    pub logical_databases: Vec<LogicalDatabase>,
    #[serde(flatten)]
    pub meta: RecordMeta,
}

impl_record!(
    MultitenantDatabase,
    ResourceKind::MultitenantDatabase,
    MULTITENANT_DATABASES
);

impl MultitenantDatabase {
    pub fn new(id: String, endpoint: String, max_per_logical: u32, now: u64) -> Self {
        Self {
            id,
            endpoint,
            max_installations_per_logical_database: max_per_logical.max(1),
            logical_databases: Vec::new(),
            meta: RecordMeta::new(now),
        }
    }

    pub fn installation_count(&self) -> usize {
        self.logical_databases.iter().map(|l| l.schemas.len()).sum()
    }

    pub fn find(&self, installation_id: &str) -> Option<SchemaAssignment> {
        self.logical_databases.iter().find_map(|ldb| {
            ldb.schemas
                .iter()
                .find(|s| s.installation_id == installation_id)
                .map(|s| SchemaAssignment {
                    logical_database: ldb.name.clone(),
                    schema: s.name.clone(),
                })
        })
    }

    /// Place `installation_id` in the first logical database with room,
    /// creating `<id>-ldb-N` when all are full. Idempotent.
    pub fn assign(&mut self, installation_id: &str) -> SchemaAssignment {
        if let Some(existing) = self.find(installation_id) {
            return existing;
        }
        let max = self.max_installations_per_logical_database.max(1) as usize;
        let index = match self.logical_databases.iter().position(|l| l.schemas.len() < max) {
            Some(index) => index,
            None => {
                let name = format!("{}-ldb-{}", self.id, self.logical_databases.len());
                self.logical_databases.push(LogicalDatabase {
                    name,
                    schemas: Vec::new(),
                });
                self.logical_databases.len() - 1
            }
        };
        let ldb = &mut self.logical_databases[index];
        let schema = format!("id_{installation_id}");
        ldb.schemas.push(DatabaseSchema {
            installation_id: installation_id.to_string(),
            name: schema.clone(),
        });
        SchemaAssignment {
            logical_database: ldb.name.clone(),
            schema,
        }
    }

    /// Drop the installation's schema. Returns whether one was removed.
    pub fn release(&mut self, installation_id: &str) -> bool {
        for ldb in &mut self.logical_databases {
            let before = ldb.schemas.len();
            ldb.schemas.retain(|s| s.installation_id != installation_id);
            if ldb.schemas.len() != before {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_then_spills_into_new_logical_database() {
        let mut db = MultitenantDatabase::new("db1".into(), "db.local:5432".into(), 2, 0);
        assert_eq!(db.assign("a").logical_database, "db1-ldb-0");
        assert_eq!(db.assign("b").logical_database, "db1-ldb-0");
        assert_eq!(db.assign("c").logical_database, "db1-ldb-1");
        assert_eq!(db.installation_count(), 3);
    }

    #[test]
    fn assign_is_idempotent() {
        let mut db = MultitenantDatabase::new("db1".into(), "e".into(), 2, 0);
        let first = db.assign("a");
        assert_eq!(db.assign("a"), first);
        assert_eq!(db.installation_count(), 1);
    }

    #[test]
    fn release_frees_room() {
        let mut db = MultitenantDatabase::new("db1".into(), "e".into(), 1, 0);
        db.assign("a");
        assert!(db.release("a"));
        assert!(!db.release("a"));
        assert_eq!(db.assign("b").logical_database, "db1-ldb-0");
        assert!(db.find("b").is_some());
        assert!(db.find("a").is_none());
    }
}
