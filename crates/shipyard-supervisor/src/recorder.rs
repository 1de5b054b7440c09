//! Persisting state transitions together with their events.

use std::fmt::Display;
use std::time::Duration;

use shipyard_core::Context;
use shipyard_state::{Record, ResourceState, StateStore, Stateful};
use tracing::{info, warn};

use crate::error::SupervisorResult;

/// Writes state transitions and their `StateChangeEvent`s atomically and
/// keeps the failure bookkeeping (`last_error`, `failed_since`) current.
#[derive(Clone, Debug)]
pub struct EventRecorder {
    store: StateStore,
    ctx: Context,
    stuck_after: Duration,
}

impl EventRecorder {
    pub fn new(store: StateStore, ctx: Context, stuck_after: Duration) -> Self {
        Self {
            store,
            ctx,
            stuck_after,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    /// Move `record` to `to`, persist it and append the event.
    ///
    /// Returns false without writing when the record is already in `to`.
    pub fn transition<R: Stateful>(&self, record: &mut R, to: R::State) -> SupervisorResult<bool> {
        self.write_transition(record, to, None)
    }

    /// Record `error` on `record` and move it to the failed state `to`.
    pub fn fail<R: Stateful>(
        &self,
        record: &mut R,
        to: R::State,
        error: impl Display,
    ) -> SupervisorResult<bool> {
        let message = error.to_string();
        warn!(kind = %R::KIND, id = record.id(), error = %message, "operation failed");
        self.write_transition(record, to, Some(message))
    }

    fn write_transition<R: Stateful>(
        &self,
        record: &mut R,
        to: R::State,
        error: Option<String>,
    ) -> SupervisorResult<bool> {
        let from = record.state();
        if from == to {
            return Ok(false);
        }
        let now = self.ctx.now();
        record.set_state(to);
        if to.is_failed() && record.failed_since().is_none() {
            record.set_failed_since(Some(now));
        }
        match error {
            Some(message) => record.set_last_error(Some(message)),
            None if to.is_settled() => {
                record.set_failed_since(None);
                record.set_last_error(None);
            }
            None => {}
        }
        let sequence = self.store.transition(record, from, now)?;
        info!(
            kind = %R::KIND,
            id = record.id(),
            from = %from,
            to = %to,
            sequence,
            "state transition"
        );
        Ok(true)
    }

    /// Save `error` on a record that stays in its current state.
    pub fn note_error<R: Stateful>(&self, record: &mut R, error: impl Display) -> SupervisorResult<()> {
        let message = error.to_string();
        if record.last_error() == Some(message.as_str()) {
            return Ok(());
        }
        warn!(kind = %R::KIND, id = record.id(), state = %record.state(), error = %message, "step deferred");
        record.set_last_error(Some(message));
        self.store.update(record)?;
        Ok(())
    }

    /// Log a warning when a record has been failing for longer than the
    /// configured threshold. Retries continue regardless.
    pub fn warn_if_stuck<R: Stateful>(&self, record: &R) {
        let Some(since) = record.failed_since() else {
            return;
        };
        let stuck_for = Duration::from_millis(self.ctx.now().saturating_sub(since));
        if stuck_for >= self.stuck_after {
            warn!(
                kind = %R::KIND,
                id = record.id(),
                state = %record.state(),
                stuck_secs = stuck_for.as_secs(),
                last_error = record.last_error().unwrap_or_default(),
                "resource stuck in failure"
            );
        }
    }

    /// Soft-delete marker for records reaching their `deleted` state. Set
    /// before the final transition so both land in one write.
    pub fn mark_deleted<R: Record>(&self, record: &mut R) {
        record.meta_mut().delete_at = self.ctx.now().max(1);
    }
}
