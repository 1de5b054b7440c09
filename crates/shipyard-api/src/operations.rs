//! Installation operations: backups, restorations, imports, multitenant
//! database migrations, and the multitenant database registry.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use shipyard_core::new_id;
use shipyard_state::{
    Backup, DatabaseType, DbMigration, DbMigrationState, Import, Installation, InstallationState,
    MultitenantDatabase, OperationState, Record, Restoration,
};
use shipyard_supervisor::supervisors::{commit_db_migration as commit, request_db_migration_rollback};
use tracing::info;

use crate::ApiState;
use crate::error::{ApiError, ApiResult};
use crate::response::{ApiResponse, Created, PageQuery, Reply, created};

/// `?installation_id=` on operation list endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OperationQuery {
    pub installation_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBackupRequest {
    pub installation_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRestorationRequest {
    pub installation_id: String,
    pub backup_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateImportRequest {
    pub installation_id: String,
    pub archive_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateDbMigrationRequest {
    pub installation_id: String,
    pub destination_database_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateDatabaseRequest {
    pub endpoint: String,
    pub max_installations_per_logical_database: Option<u32>,
}

const DEFAULT_INSTALLATIONS_PER_LOGICAL_DATABASE: u32 = 10;

/// An installation operations may target: live, not API-locked, and not on
/// its way out.
fn operable_installation(state: &ApiState, id: &str) -> ApiResult<Installation> {
    let installation = state.fetch::<Installation>(id)?;
    crate::ensure_unlocked(&installation)?;
    if installation.state.is_deleting()
        || matches!(
            installation.state,
            InstallationState::DeletionPending | InstallationState::DeletionFailed
        )
    {
        return Err(ApiError::bad_request(format!(
            "installation {id} is {}",
            installation.state
        )));
    }
    Ok(installation)
}

fn list_for<R: Record>(
    state: &ApiState,
    page: &PageQuery,
    query: &OperationQuery,
    installation_of: impl Fn(&R) -> &str,
) -> Reply<Vec<R>> {
    let records = state.store().list::<R>(&page.paging(), |r| {
        query
            .installation_id
            .as_deref()
            .is_none_or(|id| id == installation_of(r))
    })?;
    Ok(ApiResponse::ok(records))
}

fn store_new<R: Record>(state: &ApiState, mut record: R, what: &str) -> Created<R> {
    state.store().create(&mut record)?;
    info!(kind = %R::KIND, id = record.id(), "{what} requested");
    state.wake();
    created(record)
}

// ── Backups ────────────────────────────────────────────────────

/// GET /api/v1/backups
pub async fn list_backups(
    State(state): State<ApiState>,
    Query(page): Query<PageQuery>,
    Query(query): Query<OperationQuery>,
) -> Reply<Vec<Backup>> {
    list_for::<Backup>(&state, &page, &query, |b| b.installation_id.as_str())
}

/// GET /api/v1/backups/{id}
pub async fn get_backup(State(state): State<ApiState>, Path(id): Path<String>) -> Reply<Backup> {
    Ok(ApiResponse::ok(state.fetch::<Backup>(&id)?))
}

/// POST /api/v1/backups
pub async fn create_backup(
    State(state): State<ApiState>,
    Json(req): Json<CreateBackupRequest>,
) -> Created<Backup> {
    let installation = operable_installation(&state, &req.installation_id)?;
    let running = state.store().list_all::<Backup>(|b| {
        b.installation_id == installation.id
            && matches!(b.state, OperationState::Requested | OperationState::InProgress)
    })?;
    if let Some(backup) = running.first() {
        return Err(ApiError::Conflict(format!(
            "backup {} is already running for installation {}",
            backup.id, installation.id
        )));
    }
    store_new(&state, Backup::new(new_id(), &installation.id, state.now()), "backup")
}

// ── Restorations ───────────────────────────────────────────────

/// GET /api/v1/restorations
pub async fn list_restorations(
    State(state): State<ApiState>,
    Query(page): Query<PageQuery>,
    Query(query): Query<OperationQuery>,
) -> Reply<Vec<Restoration>> {
    list_for::<Restoration>(&state, &page, &query, |r| r.installation_id.as_str())
}

/// GET /api/v1/restorations/{id}
pub async fn get_restoration(State(state): State<ApiState>, Path(id): Path<String>) -> Reply<Restoration> {
    Ok(ApiResponse::ok(state.fetch::<Restoration>(&id)?))
}

/// POST /api/v1/restorations
///
/// Only a succeeded backup of the same installation can be restored.
pub async fn create_restoration(
    State(state): State<ApiState>,
    Json(req): Json<CreateRestorationRequest>,
) -> Created<Restoration> {
    let installation = operable_installation(&state, &req.installation_id)?;
    let backup = state.fetch::<Backup>(&req.backup_id)?;
    if backup.installation_id != installation.id {
        return Err(ApiError::bad_request(format!(
            "backup {} belongs to installation {}",
            backup.id, backup.installation_id
        )));
    }
    if backup.state != OperationState::Succeeded {
        return Err(ApiError::bad_request(format!(
            "backup {} is {}, only succeeded backups can be restored",
            backup.id, backup.state
        )));
    }
    let restoration = Restoration::new(new_id(), &installation.id, &backup.id, state.now());
    store_new(&state, restoration, "restoration")
}

// ── Imports ────────────────────────────────────────────────────

/// GET /api/v1/imports
pub async fn list_imports(
    State(state): State<ApiState>,
    Query(page): Query<PageQuery>,
    Query(query): Query<OperationQuery>,
) -> Reply<Vec<Import>> {
    list_for::<Import>(&state, &page, &query, |i| i.installation_id.as_str())
}

/// GET /api/v1/imports/{id}
pub async fn get_import(State(state): State<ApiState>, Path(id): Path<String>) -> Reply<Import> {
    Ok(ApiResponse::ok(state.fetch::<Import>(&id)?))
}

/// POST /api/v1/imports
pub async fn create_import(
    State(state): State<ApiState>,
    Json(req): Json<CreateImportRequest>,
) -> Created<Import> {
    let url = req.archive_url.trim();
    if !["https://", "http://", "s3://"].iter().any(|scheme| url.starts_with(scheme)) {
        return Err(ApiError::bad_request(format!(
            "archive_url {url:?} must be an http(s) or s3 URL"
        )));
    }
    let installation = operable_installation(&state, &req.installation_id)?;
    store_new(&state, Import::new(new_id(), &installation.id, url, state.now()), "import")
}

// ── Database migrations ────────────────────────────────────────

/// GET /api/v1/db-migrations
pub async fn list_db_migrations(
    State(state): State<ApiState>,
    Query(page): Query<PageQuery>,
    Query(query): Query<OperationQuery>,
) -> Reply<Vec<DbMigration>> {
    list_for::<DbMigration>(&state, &page, &query, |m| m.installation_id.as_str())
}

/// GET /api/v1/db-migrations/{id}
pub async fn get_db_migration(State(state): State<ApiState>, Path(id): Path<String>) -> Reply<DbMigration> {
    Ok(ApiResponse::ok(state.fetch::<DbMigration>(&id)?))
}

/// POST /api/v1/db-migrations
///
/// The installation must use a multitenant database; the migration starts
/// once the installation is hibernating.
pub async fn create_db_migration(
    State(state): State<ApiState>,
    Json(req): Json<CreateDbMigrationRequest>,
) -> Created<DbMigration> {
    let installation = operable_installation(&state, &req.installation_id)?;
    if installation.database_type != DatabaseType::Multitenant {
        return Err(ApiError::bad_request(format!(
            "installation {} does not use a multitenant database",
            installation.id
        )));
    }
    let Some(source) = installation.database_id.clone() else {
        return Err(ApiError::bad_request(format!(
            "installation {} has no database assigned yet",
            installation.id
        )));
    };
    if source == req.destination_database_id {
        return Err(ApiError::bad_request(format!(
            "installation {} already uses database {source}",
            installation.id
        )));
    }
    state.fetch::<MultitenantDatabase>(&req.destination_database_id)?;
    let pending = state.store().list_all::<DbMigration>(|m| {
        m.installation_id == installation.id
            && !matches!(
                m.state,
                DbMigrationState::Failed | DbMigrationState::Committed | DbMigrationState::RolledBack
            )
    })?;
    if let Some(migration) = pending.first() {
        return Err(ApiError::Conflict(format!(
            "db migration {} is still open for installation {}",
            migration.id, installation.id
        )));
    }
    let migration = DbMigration::new(
        new_id(),
        &installation.id,
        &source,
        &req.destination_database_id,
        state.now(),
    );
    store_new(&state, migration, "db migration")
}

/// POST /api/v1/db-migrations/{id}/commit
pub async fn commit_db_migration(State(state): State<ApiState>, Path(id): Path<String>) -> Reply<DbMigration> {
    let (_guard, _) = state.lock_mutable::<DbMigration>(&id)?;
    let migration = commit(&state.deps, &id)?;
    Ok(ApiResponse::ok(migration))
}

/// POST /api/v1/db-migrations/{id}/rollback
pub async fn rollback_db_migration(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Reply<DbMigration> {
    let (_guard, _) = state.lock_mutable::<DbMigration>(&id)?;
    let migration = request_db_migration_rollback(&state.deps, &id)?;
    state.wake();
    Ok(ApiResponse::ok(migration))
}

// ── Multitenant databases ──────────────────────────────────────

/// GET /api/v1/databases
pub async fn list_databases(
    State(state): State<ApiState>,
    Query(page): Query<PageQuery>,
) -> Reply<Vec<MultitenantDatabase>> {
    Ok(ApiResponse::ok(
        state.store().list::<MultitenantDatabase>(&page.paging(), |_| true)?,
    ))
}

/// POST /api/v1/databases
pub async fn create_database(
    State(state): State<ApiState>,
    Json(req): Json<CreateDatabaseRequest>,
) -> Created<MultitenantDatabase> {
    if req.endpoint.trim().is_empty() {
        return Err(ApiError::bad_request("database endpoint is required"));
    }
    let max = req
        .max_installations_per_logical_database
        .unwrap_or(DEFAULT_INSTALLATIONS_PER_LOGICAL_DATABASE);
    if max == 0 {
        return Err(ApiError::bad_request(
            "max_installations_per_logical_database must be positive",
        ));
    }
    let mut database = MultitenantDatabase::new(new_id(), req.endpoint, max, state.now());
    state.store().create(&mut database)?;
    info!(database = %database.id, endpoint = %database.endpoint, "multitenant database registered");
    created(database)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_api;
    use axum::http::StatusCode;
    use shipyard_supervisor::supervisors::{BackupSupervisor, DbMigrationSupervisor};

    #[tokio::test]
    async fn restoration_needs_a_succeeded_backup() {
        let api = test_api();
        api.installation("i1", InstallationState::Stable);
        let (_, Json(resp)) = create_backup(
            State(api.state.clone()),
            Json(CreateBackupRequest {
                installation_id: "i1".into(),
            }),
        )
        .await
        .unwrap();
        let backup = resp.data.unwrap();

        let restore = || CreateRestorationRequest {
            installation_id: "i1".into(),
            backup_id: backup.id.clone(),
        };
        let err = create_restoration(State(api.state.clone()), Json(restore()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let supervisor = BackupSupervisor::new(api.state.deps.clone());
        supervisor.supervise(&backup.id).await.unwrap();
        supervisor.supervise(&backup.id).await.unwrap();
        assert_eq!(
            api.state.store().require::<Backup>(&backup.id).unwrap().state,
            OperationState::Succeeded
        );

        let (status, Json(resp)) = create_restoration(State(api.state), Json(restore())).await.unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(resp.data.unwrap().state, OperationState::Requested);
    }

    #[tokio::test]
    async fn one_backup_at_a_time() {
        let api = test_api();
        api.installation("i1", InstallationState::Stable);
        let req = || {
            Json(CreateBackupRequest {
                installation_id: "i1".into(),
            })
        };
        let (status, _) = create_backup(State(api.state.clone()), req()).await.unwrap();
        assert_eq!(status, StatusCode::CREATED);
        let err = create_backup(State(api.state), req()).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn operations_reject_deleting_installations() {
        let api = test_api();
        api.installation("i1", InstallationState::DeletionPending);
        let err = create_import(
            State(api.state),
            Json(CreateImportRequest {
                installation_id: "i1".into(),
                archive_url: "s3://bucket/archive.zip".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn import_url_is_validated() {
        let api = test_api();
        api.installation("i1", InstallationState::Stable);
        let err = create_import(
            State(api.state),
            Json(CreateImportRequest {
                installation_id: "i1".into(),
                archive_url: "file:///etc/passwd".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn db_migration_commit_flow() {
        let api = test_api();
        let mut source = MultitenantDatabase::new("db-src".into(), "src:5432".into(), 10, 0);
        source.assign("i1");
        api.state.store().create(&mut source).unwrap();
        let (_, Json(resp)) = create_database(
            State(api.state.clone()),
            Json(CreateDatabaseRequest {
                endpoint: "dst:5432".into(),
                max_installations_per_logical_database: None,
            }),
        )
        .await
        .unwrap();
        let destination = resp.data.unwrap();

        let mut installation = api.installation("i1", InstallationState::Hibernating);
        installation.database_type = DatabaseType::Multitenant;
        installation.database_id = Some("db-src".into());
        api.state.store().update(&mut installation).unwrap();

        let (_, Json(resp)) = create_db_migration(
            State(api.state.clone()),
            Json(CreateDbMigrationRequest {
                installation_id: "i1".into(),
                destination_database_id: destination.id.clone(),
            }),
        )
        .await
        .unwrap();
        let migration = resp.data.unwrap();
        assert_eq!(migration.source_database_id, "db-src");

        let err = commit_db_migration(State(api.state.clone()), Path(migration.id.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let supervisor = DbMigrationSupervisor::new(api.state.deps.clone());
        supervisor.supervise(&migration.id).await.unwrap();
        supervisor.supervise(&migration.id).await.unwrap();

        let Json(resp) = commit_db_migration(State(api.state.clone()), Path(migration.id.clone()))
            .await
            .unwrap();
        assert_eq!(resp.data.unwrap().state, DbMigrationState::Committed);
        let installation = api.state.store().require::<Installation>("i1").unwrap();
        assert_eq!(installation.database_id, Some(destination.id));
    }

    #[tokio::test]
    async fn db_migration_needs_a_multitenant_database() {
        let api = test_api();
        api.installation("i1", InstallationState::Hibernating);
        let err = create_db_migration(
            State(api.state),
            Json(CreateDbMigrationRequest {
                installation_id: "i1".into(),
                destination_database_id: "db-dst".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
