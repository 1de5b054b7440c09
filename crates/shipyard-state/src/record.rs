//! Traits shared by every persisted record.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::event::ResourceKind;
use crate::lock::LockSlot;
use crate::tables::RecordTable;

/// Bookkeeping columns present on every record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMeta {
    /// Creation time, epoch millis.
    pub create_at: u64,
    /// Soft-delete time, epoch millis. Zero while the record is live.
    pub delete_at: u64,
    /// Optimistic concurrency version, bumped on every update. Serialized
    /// under its own key so it cannot collide with a record's `version`.
    #[serde(rename = "record_version")]
    pub version: u64,
    /// Reconciliation lock. Only changed through the store's lock operations.
    pub lock: LockSlot,
    /// API security lock. Only changed through the store's lock operations.
    pub api_locked: bool,
}

impl RecordMeta {
    pub fn new(now: u64) -> Self {
        Self {
            create_at: now,
            ..Self::default()
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.delete_at != 0
    }
}

/// A JSON-serialized row in one of the record tables.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: ResourceKind;
    const TABLE: RecordTable;

    fn id(&self) -> &str;
    fn meta(&self) -> &RecordMeta;
    fn meta_mut(&mut self) -> &mut RecordMeta;

    /// Owner used for subscription filtering.
    fn owner_id(&self) -> Option<&str> {
        None
    }

    fn is_deleted(&self) -> bool {
        self.meta().is_deleted()
    }

    /// Copy fields that only dedicated store operations may change from the
    /// persisted `stored` copy before an update is written.
    fn preserve_guarded(&mut self, _stored: &Self) {}
}

/// Naming and classification every state enum provides.
pub trait ResourceState:
    Copy + Eq + fmt::Debug + fmt::Display + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn as_str(&self) -> &'static str;

    /// A `*-failed` state that the owning supervisor retries.
    fn is_failed(&self) -> bool;

    /// A resting state: nothing left to do until someone asks for more.
    fn is_settled(&self) -> bool;
}

/// A record driven by a state machine.
pub trait Stateful: Record {
    type State: ResourceState;

    fn state(&self) -> Self::State;
    fn set_state(&mut self, state: Self::State);
    fn last_error(&self) -> Option<&str>;
    fn set_last_error(&mut self, error: Option<String>);
    /// First time the record entered a failed state in its current failure streak.
    fn failed_since(&self) -> Option<u64>;
    fn set_failed_since(&mut self, at: Option<u64>);
}

/// Implement [`Record`] (and optionally [`Stateful`]) for a struct with the
/// standard `id` / `meta` (/ `state` / `last_error` / `failed_since`) fields.
macro_rules! impl_record {
    ($ty:ty, $kind:expr, $table:expr $(, owner = $owner:ident)? $(, guarded = $guarded:ident)?) => {
        impl $crate::record::Record for $ty {
            const KIND: $crate::event::ResourceKind = $kind;
            const TABLE: $crate::tables::RecordTable = $table;

            fn id(&self) -> &str {
                &self.id
            }

            fn meta(&self) -> &$crate::record::RecordMeta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut $crate::record::RecordMeta {
                &mut self.meta
            }

            $(
                fn owner_id(&self) -> Option<&str> {
                    Some(self.$owner.as_str())
                }
            )?

            $(
                fn preserve_guarded(&mut self, stored: &Self) {
                    self.$guarded = stored.$guarded.clone();
                }
            )?
        }
    };
}

macro_rules! impl_stateful {
    ($ty:ty, $state:ty) => {
        impl $crate::record::Stateful for $ty {
            type State = $state;

            fn state(&self) -> $state {
                self.state
            }

            fn set_state(&mut self, state: $state) {
                self.state = state;
            }

            fn last_error(&self) -> Option<&str> {
                self.last_error.as_deref()
            }

            fn set_last_error(&mut self, error: Option<String>) {
                self.last_error = error;
            }

            fn failed_since(&self) -> Option<u64> {
                self.failed_since
            }

            fn set_failed_since(&mut self, at: Option<u64>) {
                self.failed_since = at;
            }
        }
    };
}

/// Derive `as_str`, `Display` and `ALL` for a kebab-case state enum.
macro_rules! state_names {
    ($ty:ident { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            pub fn name(&self) -> &'static str {
                match self {
                    $($ty::$variant => $name),+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

pub(crate) use {impl_record, impl_stateful, state_names};
