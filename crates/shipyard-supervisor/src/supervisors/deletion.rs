//! Deletion sweep: promotes `deletion-pending` installations whose grace
//! window has expired.

use shipyard_state::{Installation, InstallationState, Record};
use tracing::{debug, info};

use super::SupervisorDeps;
use crate::error::SupervisorResult;
use crate::scheduler::{Cadence, Supervisor, WorkFuture};

pub struct DeletionSweep {
    deps: SupervisorDeps,
    owner: String,
    max_updating: usize,
}

impl DeletionSweep {
    pub fn new(deps: SupervisorDeps, max_updating: u32) -> Self {
        let owner = deps.owner("deletion_sweep");
        Self {
            deps,
            owner,
            max_updating: max_updating as usize,
        }
    }

    fn expired(installation: &Installation, now: u64) -> bool {
        installation.state == InstallationState::DeletionPending
            && !installation.deletion_locked
            && !installation.meta.api_locked
            && !installation.is_deleted()
            && installation.deletion_pending_expiry.is_some_and(|at| at <= now)
    }

    /// Returns how many installations were moved to `deletion-requested`.
    pub fn sweep(&self) -> SupervisorResult<usize> {
        let now = self.deps.now();
        let mut deleting = self
            .deps
            .store
            .list_all::<Installation>(|i| i.state.is_deleting())?
            .len();
        let mut expired = self
            .deps
            .store
            .list_all::<Installation>(|i| Self::expired(i, now))?;
        expired.sort_by_key(|i| i.deletion_pending_expiry);

        let mut promoted = 0;
        for candidate in expired {
            if deleting >= self.max_updating {
                debug!(deleting, max = self.max_updating, "deletion limit reached");
                break;
            }
            let Some(_guard) = self.deps.lock::<Installation>(&candidate.id, &self.owner)? else {
                continue;
            };
            let mut installation = self.deps.store.require::<Installation>(&candidate.id)?;
            if !Self::expired(&installation, now) {
                continue;
            }
            self.deps
                .recorder
                .transition(&mut installation, InstallationState::DeletionRequested)?;
            deleting += 1;
            promoted += 1;
        }
        if promoted > 0 {
            info!(promoted, deleting, "deletion-pending installations promoted");
        }
        Ok(promoted)
    }
}

impl Supervisor for DeletionSweep {
    fn name(&self) -> &'static str {
        "deletion_sweep"
    }

    fn cadence(&self) -> Cadence {
        Cadence::Slow
    }

    fn do_work(&self) -> WorkFuture<'_> {
        Box::pin(async move { self.sweep().map(|_| ()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisors::testing::Harness;

    fn pending(harness: &Harness, id: &str, expiry: u64) {
        let mut installation = harness.installation(id, InstallationState::DeletionPending);
        installation.deletion_pending_expiry = Some(expiry);
        harness.store().update(&mut installation).unwrap();
    }

    fn state(harness: &Harness, id: &str) -> InstallationState {
        harness.store().require::<Installation>(id).unwrap().state
    }

    #[test]
    fn only_expired_installations_are_promoted() {
        let harness = Harness::new();
        pending(&harness, "i1", 1_000_000);
        pending(&harness, "i2", 1_000_001);
        let sweep = DeletionSweep::new(harness.deps.clone(), 25);

        assert_eq!(sweep.sweep().unwrap(), 1);
        assert_eq!(state(&harness, "i1"), InstallationState::DeletionRequested);
        assert_eq!(state(&harness, "i2"), InstallationState::DeletionPending);

        harness.clock.advance(1);
        assert_eq!(sweep.sweep().unwrap(), 1);
        assert_eq!(state(&harness, "i2"), InstallationState::DeletionRequested);
    }

    #[test]
    fn deletion_locked_installations_stay_pending() {
        let harness = Harness::new();
        pending(&harness, "i1", 0);
        harness.store().set_deletion_lock("i1", true).unwrap();
        let sweep = DeletionSweep::new(harness.deps.clone(), 25);
        assert_eq!(sweep.sweep().unwrap(), 0);
        assert_eq!(state(&harness, "i1"), InstallationState::DeletionPending);

        harness.store().set_deletion_lock("i1", false).unwrap();
        assert_eq!(sweep.sweep().unwrap(), 1);
    }

    #[test]
    fn in_flight_deletions_count_against_the_limit() {
        let harness = Harness::new();
        harness.installation("busy", InstallationState::DeletionInProgress);
        pending(&harness, "i1", 10);
        pending(&harness, "i2", 20);
        pending(&harness, "i3", 30);
        let sweep = DeletionSweep::new(harness.deps.clone(), 2);

        assert_eq!(sweep.sweep().unwrap(), 1);
        assert_eq!(state(&harness, "i1"), InstallationState::DeletionRequested);
        assert_eq!(state(&harness, "i2"), InstallationState::DeletionPending);
        assert_eq!(sweep.sweep().unwrap(), 0);
    }
}
