//! StateStore: redb-backed persistence for every Shipyard record.
//!
//! Records are JSON-serialized into `&[u8]` value columns keyed by ID, so a
//! table scan yields ID order. Each mutation runs in its own write
//! transaction; redb serializes writers, which makes the read-check-write
//! sequences below (version checks, lock acquisition, event sequencing)
//! atomic. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::event::StateChangeEvent;
use crate::lock::Lock;
use crate::paging::Paging;
use crate::record::{Record, Stateful};
use crate::tables::*;
use crate::types::Installation;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn encode<T: serde::Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in RECORD_TABLES {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.open_table(EVENTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Records ────────────────────────────────────────────────────

    /// Insert a new record at version 1. Fails if the ID is taken.
    pub fn create<R: Record>(&self, record: &mut R) -> StateResult<()> {
        record.meta_mut().version = 1;
        let value = encode(record)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(R::TABLE).map_err(map_err!(Table))?;
            if table.get(record.id()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(format!("{} {}", R::KIND, record.id())));
            }
            table
                .insert(record.id(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(kind = %R::KIND, id = record.id(), "record created");
        Ok(())
    }

    /// Fetch a record by ID, including soft-deleted ones.
    pub fn get<R: Record>(&self, id: &str) -> StateResult<Option<R>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Fetch a record that must exist.
    pub fn require<R: Record>(&self, id: &str) -> StateResult<R> {
        self.get(id)?
            .ok_or_else(|| StateError::NotFound(format!("{} {id}", R::KIND)))
    }

    /// Records matching `filter`, in ID order, windowed by `paging`.
    pub fn list<R: Record>(
        &self,
        paging: &Paging,
        filter: impl Fn(&R) -> bool,
    ) -> StateResult<Vec<R>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        let mut skip = paging.skip();
        let take = paging.take();
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            if results.len() >= take {
                break;
            }
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: R = decode(value.value())?;
            if (record.is_deleted() && !paging.include_deleted) || !filter(&record) {
                continue;
            }
            if skip > 0 {
                skip -= 1;
                continue;
            }
            results.push(record);
        }
        Ok(results)
    }

    /// Every live record matching `filter`.
    pub fn list_all<R: Record>(&self, filter: impl Fn(&R) -> bool) -> StateResult<Vec<R>> {
        self.list(&Paging::all(), filter)
    }

    /// Persist a modified record.
    ///
    /// The stored version must equal `record`'s version (the one it was read
    /// at), otherwise [`StateError::Conflict`]. On success the version is
    /// bumped in both the store and `record`. Lock columns always keep their
    /// stored values; use the dedicated lock operations to change them.
    pub fn update<R: Record>(&self, record: &mut R) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        Self::write_update(&txn, record)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(kind = %R::KIND, id = record.id(), version = record.meta().version, "record updated");
        Ok(())
    }

    /// Persist a state transition of `record` away from `from`, appending the
    /// matching [`StateChangeEvent`] in the same transaction.
    ///
    /// Returns the event's sequence number.
    pub fn transition<R: Stateful>(
        &self,
        record: &mut R,
        from: R::State,
        now: u64,
    ) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        Self::write_update(&txn, record)?;
        let sequence = Self::append_event(&txn, StateChangeEvent::transition(record, from, now))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(sequence)
    }

    fn write_update<R: Record>(txn: &WriteTransaction, record: &mut R) -> StateResult<()> {
        let mut table = txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        let stored: R = match table.get(record.id()).map_err(map_err!(Read))? {
            Some(guard) => decode(guard.value())?,
            None => return Err(StateError::NotFound(format!("{} {}", R::KIND, record.id()))),
        };
        let found = stored.meta().version;
        if found != record.meta().version {
            return Err(StateError::Conflict {
                id: record.id().to_string(),
                expected: record.meta().version,
                found,
            });
        }
        {
            let meta = record.meta_mut();
            meta.version = found + 1;
            meta.lock = stored.meta().lock.clone();
            meta.api_locked = stored.meta().api_locked;
        }
        record.preserve_guarded(&stored);
        let value = encode(record)?;
        table
            .insert(record.id(), value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    /// Read-modify-write one record inside a single transaction without
    /// touching its version.
    fn modify<R: Record, T>(&self, id: &str, f: impl FnOnce(&mut R) -> T) -> StateResult<T> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let out;
        {
            let mut table = txn.open_table(R::TABLE).map_err(map_err!(Table))?;
            let mut record: R = match table.get(id).map_err(map_err!(Read))? {
                Some(guard) => decode(guard.value())?,
                None => return Err(StateError::NotFound(format!("{} {id}", R::KIND))),
            };
            out = f(&mut record);
            let value = encode(&record)?;
            table.insert(id, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(out)
    }

    /// Mark a record deleted. Returns false if it already was.
    pub fn soft_delete<R: Record>(&self, id: &str, now: u64) -> StateResult<bool> {
        let deleted = self.modify::<R, _>(id, |record| {
            let meta = record.meta_mut();
            if meta.is_deleted() {
                return false;
            }
            meta.delete_at = now.max(1);
            meta.version += 1;
            true
        })?;
        debug!(kind = %R::KIND, %id, deleted, "record soft-deleted");
        Ok(deleted)
    }

    // ── Locks ──────────────────────────────────────────────────────

    /// Try to take the reconciliation lock on a record.
    ///
    /// Returns false when another owner holds it. Idempotent for the holder.
    pub fn lock<R: Record>(&self, id: &str, owner: &str, now: u64) -> StateResult<bool> {
        self.modify::<R, _>(id, |record| record.meta_mut().lock.try_acquire(owner, now))
    }

    /// Release the reconciliation lock if `owner` holds it.
    pub fn unlock<R: Record>(&self, id: &str, owner: &str) -> StateResult<bool> {
        let released = self.modify::<R, _>(id, |record| record.meta_mut().lock.release(owner))?;
        if !released {
            warn!(kind = %R::KIND, %id, %owner, "unlock by non-holder ignored");
        }
        Ok(released)
    }

    /// Drop the reconciliation lock whoever holds it. Operator recovery only.
    pub fn force_unlock<R: Record>(&self, id: &str) -> StateResult<Option<Lock>> {
        let previous = self.modify::<R, _>(id, |record| record.meta_mut().lock.force_release())?;
        if let Some(lock) = &previous {
            warn!(kind = %R::KIND, %id, owner = %lock.owner_id, "lock forcibly released");
        }
        Ok(previous)
    }

    /// Set or clear the API security lock. Returns whether it changed.
    pub fn set_api_lock<R: Record>(&self, id: &str, locked: bool) -> StateResult<bool> {
        self.modify::<R, _>(id, |record| {
            let meta = record.meta_mut();
            let changed = meta.api_locked != locked;
            meta.api_locked = locked;
            changed
        })
    }

    /// Set or clear an installation's deletion lock. Returns whether it changed.
    pub fn set_deletion_lock(&self, id: &str, locked: bool) -> StateResult<bool> {
        self.modify::<Installation, _>(id, |installation| {
            let changed = installation.deletion_locked != locked;
            installation.deletion_locked = locked;
            changed
        })
    }

    // ── Events ─────────────────────────────────────────────────────

    /// Append an event, assigning the next sequence number.
    pub fn record_event(&self, event: StateChangeEvent) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let sequence = Self::append_event(&txn, event)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(sequence)
    }

    fn append_event(txn: &WriteTransaction, mut event: StateChangeEvent) -> StateResult<u64> {
        let mut table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
        let last = table
            .last()
            .map_err(map_err!(Read))?
            .map(|(key, _)| key.value())
            .unwrap_or(0);
        event.sequence = last + 1;
        let value = encode(&event)?;
        table
            .insert(event.sequence, value.as_slice())
            .map_err(map_err!(Write))?;
        debug!(
            sequence = event.sequence,
            kind = %event.resource_type,
            id = %event.resource_id,
            from = %event.old_state,
            to = %event.new_state,
            "state change recorded"
        );
        Ok(event.sequence)
    }

    /// Up to `limit` events with sequence greater than `after` that match `filter`.
    pub fn list_events(
        &self,
        after: u64,
        limit: usize,
        filter: impl Fn(&StateChangeEvent) -> bool,
    ) -> StateResult<Vec<StateChangeEvent>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(after.saturating_add(1)..).map_err(map_err!(Read))? {
            if results.len() >= limit {
                break;
            }
            let (_, value) = entry.map_err(map_err!(Read))?;
            let event: StateChangeEvent = decode(value.value())?;
            if filter(&event) {
                results.push(event);
            }
        }
        Ok(results)
    }

    /// Highest sequence number recorded so far, zero when empty.
    pub fn last_event_sequence(&self) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
        Ok(table
            .last()
            .map_err(map_err!(Read))?
            .map(|(key, _)| key.value())
            .unwrap_or(0))
    }
}
