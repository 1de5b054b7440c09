//! Multitenant database migrations.
//!
//! The supervisor moves a hibernating installation's schema to another
//! multitenant database. A succeeded migration waits for the operator to
//! commit it (dropping the source schema) or roll it back (pointing the
//! installation at the source again).

use shipyard_state::{DbMigration, DbMigrationState, Installation, InstallationState, MultitenantDatabase, Record};
use tracing::{debug, info, warn};

use super::SupervisorDeps;
use crate::error::{SupervisorError, SupervisorResult};
use crate::provisioner::JobStatus;
use crate::scheduler::{Supervisor, WorkFuture};

type S = DbMigrationState;

pub struct DbMigrationSupervisor {
    deps: SupervisorDeps,
    owner: String,
}

impl DbMigrationSupervisor {
    pub fn new(deps: SupervisorDeps) -> Self {
        let owner = deps.owner("db_migration");
        Self { deps, owner }
    }

    pub async fn run_once(&self) -> SupervisorResult<()> {
        let migrations = self.deps.store.list_all::<DbMigration>(|m| {
            matches!(m.state, S::Requested | S::InProgress | S::RollbackRequested) && !m.meta.api_locked
        })?;
        for migration in migrations {
            if let Err(e) = self.supervise(&migration.id).await {
                warn!(db_migration = %migration.id, error = %e, "db migration supervision failed");
            }
        }
        Ok(())
    }

    pub async fn supervise(&self, id: &str) -> SupervisorResult<()> {
        let Some(_guard) = self.deps.lock::<DbMigration>(id, &self.owner)? else {
            return Ok(());
        };
        let mut migration = self.deps.store.require::<DbMigration>(id)?;
        if migration.is_deleted() || migration.meta.api_locked {
            return Ok(());
        }
        match migration.state {
            S::Requested => self.start(&mut migration).await,
            S::InProgress => self.poll(&mut migration).await,
            S::RollbackRequested => self.roll_back(&mut migration).await,
            S::Succeeded | S::Failed | S::Committed | S::RolledBack => Ok(()),
        }
    }

    async fn start(&self, migration: &mut DbMigration) -> SupervisorResult<()> {
        let installation = self.deps.store.require::<Installation>(&migration.installation_id)?;
        if installation.state != InstallationState::Hibernating {
            debug!(db_migration = %migration.id, state = %installation.state, "waiting for installation to hibernate");
            return Ok(());
        }
        match self
            .deps
            .backends
            .operations
            .start_db_migration(migration, &installation)
            .await
        {
            Ok(()) => {
                migration.last_error = None;
                self.deps.recorder.transition(migration, S::InProgress)?;
            }
            Err(e) => self.deps.recorder.note_error(migration, e)?,
        }
        Ok(())
    }

    async fn poll(&self, migration: &mut DbMigration) -> SupervisorResult<()> {
        match self.deps.backends.operations.db_migration_status(migration).await? {
            JobStatus::Running => {}
            JobStatus::Failed(reason) => {
                self.deps.recorder.fail(migration, S::Failed, reason)?;
            }
            JobStatus::Succeeded => {
                let Some(_installation_lock) = self
                    .deps
                    .lock::<Installation>(&migration.installation_id, &self.owner)?
                else {
                    return Ok(());
                };
                assign_schema(&self.deps, &migration.destination_database_id, &migration.installation_id)?;
                set_database(&self.deps, &migration.installation_id, &migration.destination_database_id)?;
                self.deps.recorder.transition(migration, S::Succeeded)?;
                info!(
                    db_migration = %migration.id,
                    installation = %migration.installation_id,
                    destination = %migration.destination_database_id,
                    "installation database migrated"
                );
            }
        }
        Ok(())
    }

    async fn roll_back(&self, migration: &mut DbMigration) -> SupervisorResult<()> {
        let Some(_installation_lock) = self
            .deps
            .lock::<Installation>(&migration.installation_id, &self.owner)?
        else {
            return Ok(());
        };
        let installation = self.deps.store.require::<Installation>(&migration.installation_id)?;
        if let Err(e) = self
            .deps
            .backends
            .operations
            .rollback_db_migration(migration, &installation)
            .await
        {
            return self.deps.recorder.note_error(migration, e);
        }
        assign_schema(&self.deps, &migration.source_database_id, &migration.installation_id)?;
        set_database(&self.deps, &migration.installation_id, &migration.source_database_id)?;
        release_schema(&self.deps, &migration.destination_database_id, &migration.installation_id)?;
        self.deps.recorder.transition(migration, S::RolledBack)?;
        Ok(())
    }
}

impl Supervisor for DbMigrationSupervisor {
    fn name(&self) -> &'static str {
        "db_migration"
    }

    fn do_work(&self) -> WorkFuture<'_> {
        Box::pin(self.run_once())
    }
}

/// Accept a succeeded migration and drop the source schema.
pub fn commit_db_migration(deps: &SupervisorDeps, id: &str) -> SupervisorResult<DbMigration> {
    let mut migration = deps.store.require::<DbMigration>(id)?;
    if migration.state != S::Succeeded {
        return Err(SupervisorError::Precondition(format!(
            "db migration {id} is {}, only succeeded migrations can be committed",
            migration.state
        )));
    }
    release_schema(deps, &migration.source_database_id, &migration.installation_id)?;
    deps.recorder.transition(&mut migration, S::Committed)?;
    Ok(migration)
}

/// Ask the supervisor to undo a succeeded migration.
pub fn request_db_migration_rollback(deps: &SupervisorDeps, id: &str) -> SupervisorResult<DbMigration> {
    let mut migration = deps.store.require::<DbMigration>(id)?;
    if migration.state != S::Succeeded {
        return Err(SupervisorError::Precondition(format!(
            "db migration {id} is {}, only succeeded migrations can be rolled back",
            migration.state
        )));
    }
    deps.recorder.transition(&mut migration, S::RollbackRequested)?;
    Ok(migration)
}

fn assign_schema(deps: &SupervisorDeps, database_id: &str, installation_id: &str) -> SupervisorResult<()> {
    let mut database = deps.store.require::<MultitenantDatabase>(database_id)?;
    if database.find(installation_id).is_none() {
        let assignment = database.assign(installation_id);
        deps.store.update(&mut database)?;
        debug!(database = %database_id, installation = %installation_id, schema = %assignment.schema, "schema assigned");
    }
    Ok(())
}

fn release_schema(deps: &SupervisorDeps, database_id: &str, installation_id: &str) -> SupervisorResult<()> {
    let Some(mut database) = deps.store.get::<MultitenantDatabase>(database_id)? else {
        return Ok(());
    };
    if database.release(installation_id) {
        deps.store.update(&mut database)?;
        debug!(database = %database_id, installation = %installation_id, "schema released");
    }
    Ok(())
}

fn set_database(deps: &SupervisorDeps, installation_id: &str, database_id: &str) -> SupervisorResult<()> {
    let mut installation = deps.store.require::<Installation>(installation_id)?;
    if installation.database_id.as_deref() != Some(database_id) {
        installation.database_id = Some(database_id.to_string());
        deps.store.update(&mut installation)?;
    }
    Ok(())
}
