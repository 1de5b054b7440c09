//! shipyard-state — embedded state store for the Shipyard control plane.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for clusters, installations, cluster installations, groups,
//! multitenant databases, installation operations, webhook subscriptions and
//! the state change event log.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns keyed
//! by their 26-character ID. Every record carries a [`RecordMeta`] header
//! (timestamps, optimistic version, reconciliation lock, API lock).
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod event;
pub mod lock;
pub mod paging;
pub mod record;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use event::{ResourceKind, StateChangeEvent, Subscription};
pub use lock::{Lock, LockSlot};
pub use paging::Paging;
pub use record::{Record, RecordMeta, ResourceState, Stateful};
pub use store::StateStore;
pub use types::*;
