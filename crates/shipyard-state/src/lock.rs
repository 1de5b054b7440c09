//! Reconciliation lock value type.
//!
//! A `LockSlot` is the nullable lock-owner column of a record. The store
//! applies these operations inside a single write transaction, which makes
//! them a compare-and-swap against the persisted value.

use serde::{Deserialize, Serialize};

/// Who holds a record and since when (epoch millis).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub owner_id: String,
    pub acquired_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockSlot(Option<Lock>);

impl LockSlot {
    /// Take the lock for `owner`.
    ///
    /// Fails if another owner holds it. Re-acquiring as the current holder
    /// succeeds and keeps the original acquisition time.
    pub fn try_acquire(&mut self, owner: &str, now: u64) -> bool {
        match &self.0 {
            Some(lock) => lock.owner_id == owner,
            None => {
                self.0 = Some(Lock {
                    owner_id: owner.to_string(),
                    acquired_at: now,
                });
                true
            }
        }
    }

    /// Release the lock if `owner` holds it. Returns whether it was released.
    pub fn release(&mut self, owner: &str) -> bool {
        if self.is_held_by(owner) {
            self.0 = None;
            true
        } else {
            false
        }
    }

    /// Drop the lock regardless of owner, returning the previous holder.
    pub fn force_release(&mut self) -> Option<Lock> {
        self.0.take()
    }

    pub fn is_held(&self) -> bool {
        self.0.is_some()
    }

    pub fn is_held_by(&self, owner: &str) -> bool {
        self.0.as_ref().is_some_and(|l| l.owner_id == owner)
    }

    pub fn holder(&self) -> Option<&Lock> {
        self.0.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_free_slot() {
        let mut slot = LockSlot::default();
        assert!(!slot.is_held());
        assert!(slot.try_acquire("a", 10));
        assert!(slot.is_held_by("a"));
        assert_eq!(slot.holder().unwrap().acquired_at, 10);
    }

    #[test]
    fn second_owner_is_refused() {
        let mut slot = LockSlot::default();
        assert!(slot.try_acquire("a", 10));
        assert!(!slot.try_acquire("b", 11));
        assert!(slot.is_held_by("a"));
    }

    #[test]
    fn reacquire_is_idempotent() {
        let mut slot = LockSlot::default();
        assert!(slot.try_acquire("a", 10));
        assert!(slot.try_acquire("a", 20));
        assert_eq!(slot.holder().unwrap().acquired_at, 10);
    }

    #[test]
    fn release_by_non_holder_is_noop() {
        let mut slot = LockSlot::default();
        assert!(!slot.release("a"));
        slot.try_acquire("a", 1);
        assert!(!slot.release("b"));
        assert!(slot.is_held_by("a"));
        assert!(slot.release("a"));
        assert!(!slot.is_held());
        assert!(slot.try_acquire("b", 2));
    }

    #[test]
    fn force_release_returns_holder() {
        let mut slot = LockSlot::default();
        slot.try_acquire("stuck", 5);
        let prev = slot.force_release().unwrap();
        assert_eq!(prev.owner_id, "stuck");
        assert!(!slot.is_held());
    }

    #[test]
    fn serializes_as_nullable_column() {
        let mut slot = LockSlot::default();
        assert_eq!(serde_json::to_string(&slot).unwrap(), "null");
        slot.try_acquire("a", 1);
        let json = serde_json::to_string(&slot).unwrap();
        let back: LockSlot = serde_json::from_str(&json).unwrap();
        assert!(back.is_held_by("a"));
    }
}
