//! Scoped reconciliation locks.

use std::marker::PhantomData;

use shipyard_core::Context;
use shipyard_state::{Record, StateStore};
use tracing::{debug, warn};

use crate::error::SupervisorResult;

/// Lock owner for one component of this instance, e.g. `i-abc:cluster`.
pub fn lock_owner(ctx: &Context, component: &str) -> String {
    format!("{}:{}", ctx.instance_id(), component)
}

/// Holds the reconciliation lock on one record; released on drop.
pub struct LockGuard<R: Record> {
    store: StateStore,
    id: String,
    owner: String,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> LockGuard<R> {
    /// Take the lock, or `None` when another owner holds it.
    pub fn try_acquire(
        store: &StateStore,
        id: &str,
        owner: &str,
        now: u64,
    ) -> SupervisorResult<Option<Self>> {
        if !store.lock::<R>(id, owner, now)? {
            debug!(kind = %R::KIND, %id, %owner, "record locked by another owner");
            return Ok(None);
        }
        Ok(Some(Self {
            store: store.clone(),
            id: id.to_string(),
            owner: owner.to_string(),
            _record: PhantomData,
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl<R: Record> Drop for LockGuard<R> {
    fn drop(&mut self) {
        if let Err(e) = self.store.unlock::<R>(&self.id, &self.owner) {
            warn!(kind = %R::KIND, id = %self.id, error = %e, "failed to release lock");
        }
    }
}
