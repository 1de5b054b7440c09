//! Backup, restoration and import supervisors.
//!
//! All three share one lifecycle: `requested → in-progress → succeeded |
//! failed`. They differ only in how the backend job is started and polled,
//! which [`OperationJob`] captures. Failed jobs are terminal.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use shipyard_state::{
    Backup, Import, Installation, InstallationState, OperationState, Restoration, Stateful,
};
use tracing::{debug, warn};

use super::SupervisorDeps;
use crate::error::{SupervisorError, SupervisorResult};
use crate::provisioner::JobStatus;
use crate::scheduler::{Supervisor, WorkFuture};

pub type JobFuture<'a, T> = Pin<Box<dyn Future<Output = SupervisorResult<T>> + Send + 'a>>;

/// An operation record driven through the shared job lifecycle.
pub trait OperationJob: Stateful<State = OperationState> {
    /// Supervisor and lock component name.
    const COMPONENT: &'static str;

    fn installation_id(&self) -> &str;

    /// Kick off the backend job. May record job details on `self`.
    fn start<'a>(&'a mut self, deps: &'a SupervisorDeps, installation: &'a Installation) -> JobFuture<'a, ()>;

    fn status<'a>(&'a self, deps: &'a SupervisorDeps) -> JobFuture<'a, JobStatus>;
}

impl OperationJob for Backup {
    const COMPONENT: &'static str = "backup";

    fn installation_id(&self) -> &str {
        &self.installation_id
    }

    fn start<'a>(&'a mut self, deps: &'a SupervisorDeps, installation: &'a Installation) -> JobFuture<'a, ()> {
        Box::pin(async move {
            let location = deps.backends.operations.trigger_backup(&*self, installation).await?;
            self.location = Some(location);
            Ok(())
        })
    }

    fn status<'a>(&'a self, deps: &'a SupervisorDeps) -> JobFuture<'a, JobStatus> {
        Box::pin(async move { Ok(deps.backends.operations.backup_status(self).await?) })
    }
}

impl OperationJob for Restoration {
    const COMPONENT: &'static str = "restoration";

    fn installation_id(&self) -> &str {
        &self.installation_id
    }

    fn start<'a>(&'a mut self, deps: &'a SupervisorDeps, installation: &'a Installation) -> JobFuture<'a, ()> {
        Box::pin(async move {
            let backup = deps.store.require::<Backup>(&self.backup_id)?;
            if backup.state != OperationState::Succeeded {
                return Err(SupervisorError::Precondition(format!(
                    "backup {} is {}",
                    backup.id, backup.state
                )));
            }
            deps.backends
                .operations
                .trigger_restoration(self, installation, &backup)
                .await?;
            Ok(())
        })
    }

    fn status<'a>(&'a self, deps: &'a SupervisorDeps) -> JobFuture<'a, JobStatus> {
        Box::pin(async move { Ok(deps.backends.operations.restoration_status(self).await?) })
    }
}

impl OperationJob for Import {
    const COMPONENT: &'static str = "import";

    fn installation_id(&self) -> &str {
        &self.installation_id
    }

    fn start<'a>(&'a mut self, deps: &'a SupervisorDeps, installation: &'a Installation) -> JobFuture<'a, ()> {
        Box::pin(async move {
            deps.backends.operations.start_import(self, installation).await?;
            Ok(())
        })
    }

    fn status<'a>(&'a self, deps: &'a SupervisorDeps) -> JobFuture<'a, JobStatus> {
        Box::pin(async move { Ok(deps.backends.operations.import_status(self).await?) })
    }
}

/// Drives every open operation of type `J`.
pub struct OperationSupervisor<J: OperationJob> {
    deps: SupervisorDeps,
    owner: String,
    _job: PhantomData<fn() -> J>,
}

pub type BackupSupervisor = OperationSupervisor<Backup>;
pub type RestorationSupervisor = OperationSupervisor<Restoration>;
pub type ImportSupervisor = OperationSupervisor<Import>;

impl<J: OperationJob> OperationSupervisor<J> {
    pub fn new(deps: SupervisorDeps) -> Self {
        let owner = deps.owner(J::COMPONENT);
        Self {
            deps,
            owner,
            _job: PhantomData,
        }
    }

    pub async fn run_once(&self) -> SupervisorResult<()> {
        let jobs = self.deps.store.list_all::<J>(|job| {
            matches!(job.state(), OperationState::Requested | OperationState::InProgress)
                && !job.meta().api_locked
        })?;
        for job in jobs {
            if let Err(e) = self.supervise(job.id()).await {
                warn!(kind = %J::KIND, id = job.id(), error = %e, "operation supervision failed");
            }
        }
        Ok(())
    }

    pub async fn supervise(&self, id: &str) -> SupervisorResult<()> {
        let Some(_guard) = self.deps.lock::<J>(id, &self.owner)? else {
            return Ok(());
        };
        let mut job = self.deps.store.require::<J>(id)?;
        if job.is_deleted() || job.meta().api_locked {
            return Ok(());
        }
        let recorder = &self.deps.recorder;
        match job.state() {
            OperationState::Requested => {
                let installation = self.deps.store.require::<Installation>(job.installation_id())?;
                if !matches!(
                    installation.state,
                    InstallationState::Stable | InstallationState::Hibernating
                ) {
                    debug!(kind = %J::KIND, id, installation = %installation.id, state = %installation.state, "waiting for installation");
                    return Ok(());
                }
                match job.start(&self.deps, &installation).await {
                    Ok(()) => {
                        job.set_last_error(None);
                        recorder.transition(&mut job, OperationState::InProgress)?;
                    }
                    Err(e) => recorder.note_error(&mut job, e)?,
                }
            }
            OperationState::InProgress => match job.status(&self.deps).await? {
                JobStatus::Running => {}
                JobStatus::Succeeded => {
                    recorder.transition(&mut job, OperationState::Succeeded)?;
                }
                JobStatus::Failed(reason) => {
                    recorder.fail(&mut job, OperationState::Failed, reason)?;
                }
            },
            OperationState::Succeeded | OperationState::Failed => {}
        }
        Ok(())
    }
}

impl<J: OperationJob> Supervisor for OperationSupervisor<J> {
    fn name(&self) -> &'static str {
        J::COMPONENT
    }

    fn do_work(&self) -> WorkFuture<'_> {
        Box::pin(self.run_once())
    }
}
