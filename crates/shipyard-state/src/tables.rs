//! redb table definitions for the Shipyard state store.
//!
//! Record tables use `&str` keys (the record ID) and `&[u8]` values
//! (JSON-serialized domain types), so key order is ID order. Events are
//! keyed by their monotonic sequence number.

use redb::TableDefinition;

/// Raw table shape shared by every record table.
pub type RecordTable = TableDefinition<'static, &'static str, &'static [u8]>;

pub const CLUSTERS: RecordTable = TableDefinition::new("clusters");

pub const INSTALLATIONS: RecordTable = TableDefinition::new("installations");

pub const CLUSTER_INSTALLATIONS: RecordTable = TableDefinition::new("cluster_installations");

pub const GROUPS: RecordTable = TableDefinition::new("groups");

pub const MULTITENANT_DATABASES: RecordTable = TableDefinition::new("multitenant_databases");

pub const BACKUPS: RecordTable = TableDefinition::new("backups");

pub const RESTORATIONS: RecordTable = TableDefinition::new("restorations");

pub const IMPORTS: RecordTable = TableDefinition::new("imports");

pub const DB_MIGRATIONS: RecordTable = TableDefinition::new("db_migrations");

pub const SUBSCRIPTIONS: RecordTable = TableDefinition::new("subscriptions");

/// State change events keyed by sequence number.
pub const EVENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("events");

/// Every record table, for schema bootstrap.
pub const RECORD_TABLES: [RecordTable; 10] = [
    CLUSTERS,
    INSTALLATIONS,
    CLUSTER_INSTALLATIONS,
    GROUPS,
    MULTITENANT_DATABASES,
    BACKUPS,
    RESTORATIONS,
    IMPORTS,
    DB_MIGRATIONS,
    SUBSCRIPTIONS,
];
