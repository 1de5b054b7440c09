//! Group rollouts.
//!
//! A group's `sequence` is bumped whenever its shared configuration changes.
//! Members whose `group_sequence` lags behind are moved to `update-requested`
//! a few at a time, never more than `max_rolling` updating at once.

use shipyard_state::{Group, Installation, InstallationState, Record};
use tracing::{debug, info, warn};

use super::SupervisorDeps;
use crate::error::SupervisorResult;
use crate::scheduler::{Cadence, Supervisor, WorkFuture};

pub struct GroupSupervisor {
    deps: SupervisorDeps,
    owner: String,
}

impl GroupSupervisor {
    pub fn new(deps: SupervisorDeps) -> Self {
        let owner = deps.owner("group");
        Self { deps, owner }
    }

    pub async fn run_once(&self) -> SupervisorResult<()> {
        let groups = self.deps.store.list_all::<Group>(|g| !g.meta.api_locked)?;
        for group in groups {
            if let Err(e) = self.roll_out(&group) {
                warn!(group = %group.id, error = %e, "group rollout failed");
            }
        }
        Ok(())
    }

    /// Start updates on lagging members of `group` while rolling slots remain.
    /// Returns how many members were started.
    pub fn roll_out(&self, group: &Group) -> SupervisorResult<usize> {
        let members = self.deps.store.list_all::<Installation>(|i| {
            i.group_id.as_deref() == Some(group.id.as_str())
        })?;
        let updating = members.iter().filter(|i| i.state.is_updating()).count();
        let mut capacity = group.rolling_capacity(updating);
        let lagging = members
            .iter()
            .filter(|i| Self::lags(i, group.sequence))
            .count();
        if lagging == 0 {
            return Ok(0);
        }
        debug!(group = %group.id, sequence = group.sequence, updating, lagging, "group rollout pending");

        let mut started = 0;
        for member in members.iter().filter(|i| Self::lags(i, group.sequence)) {
            if capacity == 0 {
                break;
            }
            let Some(_guard) = self.deps.lock::<Installation>(&member.id, &self.owner)? else {
                continue;
            };
            let mut installation = self.deps.store.require::<Installation>(&member.id)?;
            if !Self::lags(&installation, group.sequence) {
                continue;
            }
            installation.group_sequence = Some(group.sequence);
            self.deps
                .recorder
                .transition(&mut installation, InstallationState::UpdateRequested)?;
            capacity -= 1;
            started += 1;
        }
        if started > 0 {
            info!(group = %group.id, sequence = group.sequence, started, "group members updating");
        }
        Ok(started)
    }

    fn lags(installation: &Installation, sequence: u64) -> bool {
        installation.state == InstallationState::Stable
            && !installation.is_deleted()
            && !installation.meta.api_locked
            && installation.group_sequence != Some(sequence)
    }
}

impl Supervisor for GroupSupervisor {
    fn name(&self) -> &'static str {
        "group"
    }

    fn cadence(&self) -> Cadence {
        Cadence::Slow
    }

    fn do_work(&self) -> WorkFuture<'_> {
        Box::pin(self.run_once())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisors::testing::Harness;

    fn group(harness: &Harness, max_rolling: u32) -> Group {
        let mut group = Group::new("g1".into(), "blue".into(), 0);
        group.max_rolling = max_rolling;
        group.version = Some("9.1.0".into());
        harness.store().create(&mut group).unwrap();
        group
    }

    fn member(harness: &Harness, id: &str, sequence: Option<u64>) {
        let mut installation = harness.installation(id, InstallationState::Stable);
        installation.group_id = Some("g1".into());
        installation.group_sequence = sequence;
        harness.store().update(&mut installation).unwrap();
    }

    fn updating(harness: &Harness) -> Vec<String> {
        let mut ids: Vec<_> = harness
            .store()
            .list_all::<Installation>(|i| i.state == InstallationState::UpdateRequested)
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn rollout_respects_max_rolling() {
        let harness = Harness::new();
        let group = group(&harness, 2);
        for id in ["i1", "i2", "i3"] {
            member(&harness, id, None);
        }
        let supervisor = GroupSupervisor::new(harness.deps.clone());

        assert_eq!(supervisor.roll_out(&group).unwrap(), 2);
        assert_eq!(updating(&harness).len(), 2);
        // Both slots are taken.
        assert_eq!(supervisor.roll_out(&group).unwrap(), 0);

        let mut done = harness
            .store()
            .require::<Installation>(&updating(&harness)[0])
            .unwrap();
        done.state = InstallationState::Stable;
        harness.store().update(&mut done).unwrap();
        assert_eq!(done.group_sequence, Some(group.sequence));

        assert_eq!(supervisor.roll_out(&group).unwrap(), 1);
        assert_eq!(updating(&harness).len(), 2);
    }

    #[tokio::test]
    async fn current_members_are_left_alone() {
        let harness = Harness::new();
        let group = group(&harness, 0);
        member(&harness, "i1", Some(group.sequence));
        member(&harness, "i2", Some(group.sequence - 1));
        let supervisor = GroupSupervisor::new(harness.deps.clone());
        supervisor.run_once().await.unwrap();
        assert_eq!(updating(&harness), vec!["i2".to_string()]);
    }

    #[tokio::test]
    async fn locked_members_wait() {
        let harness = Harness::new();
        let group = group(&harness, 0);
        member(&harness, "i1", None);
        member(&harness, "i2", None);
        harness.store().set_api_lock::<Installation>("i1", true).unwrap();
        harness.store().lock::<Installation>("i2", "elsewhere", 0).unwrap();
        let supervisor = GroupSupervisor::new(harness.deps.clone());
        assert_eq!(supervisor.roll_out(&group).unwrap(), 0);
        assert!(updating(&harness).is_empty());
    }
}
