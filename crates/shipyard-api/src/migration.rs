//! Cross-cluster migration endpoints. Each one runs a single workflow step
//! and reports what it changed; repeating a step is harmless.

use axum::Json;
use axum::extract::State;
use serde::Deserialize;
use shipyard_supervisor::{CleanupScope, MigrationSummary};
use tracing::info;

use crate::ApiState;
use crate::error::ApiError;
use crate::response::{ApiResponse, Reply};

#[derive(Debug, Clone, Deserialize)]
pub struct MigrateInstallationsRequest {
    pub source_cluster_id: String,
    pub target_cluster_id: String,
    /// Migrate only this installation instead of all of the source's.
    pub installation_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwitchDnsRequest {
    pub source_cluster_id: String,
    pub target_cluster_id: String,
    pub installation_ids: Vec<String>,
    #[serde(default)]
    pub lock_installations: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CleanupRequest {
    pub cluster_id: Option<String>,
    pub cluster_installation_id: Option<String>,
}

impl CleanupRequest {
    fn scope(self) -> Result<CleanupScope, ApiError> {
        match (self.cluster_id, self.cluster_installation_id) {
            (Some(cluster), None) => Ok(CleanupScope::Cluster(cluster)),
            (None, Some(ci)) => Ok(CleanupScope::ClusterInstallation(ci)),
            _ => Err(ApiError::bad_request(
                "exactly one of cluster_id or cluster_installation_id is required",
            )),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwitchRolesRequest {
    /// Current primary, demoted to secondary.
    pub primary_cluster_id: String,
    /// Current secondary, promoted to primary.
    pub secondary_cluster_id: String,
}

/// POST /api/v1/migrations/installations
pub async fn migrate_installations(
    State(state): State<ApiState>,
    Json(req): Json<MigrateInstallationsRequest>,
) -> Reply<MigrationSummary> {
    let summary = state.migration().migrate_installations(
        &req.source_cluster_id,
        &req.target_cluster_id,
        req.installation_id.as_deref(),
    )?;
    info!(
        source = %req.source_cluster_id,
        target = %req.target_cluster_id,
        changed = summary.changed,
        "installations migrated"
    );
    state.wake();
    Ok(ApiResponse::ok(summary))
}

/// POST /api/v1/migrations/dns
pub async fn switch_dns(State(state): State<ApiState>, Json(req): Json<SwitchDnsRequest>) -> Reply<MigrationSummary> {
    if req.installation_ids.is_empty() {
        return Err(ApiError::bad_request("installation_ids must not be empty"));
    }
    let summary = state
        .migration()
        .switch_dns(
            &req.source_cluster_id,
            &req.target_cluster_id,
            &req.installation_ids,
            req.lock_installations,
        )
        .await?;
    state.wake();
    Ok(ApiResponse::ok(summary))
}

/// POST /api/v1/migrations/cleanup
pub async fn delete_inactive(
    State(state): State<ApiState>,
    Json(req): Json<CleanupRequest>,
) -> Reply<MigrationSummary> {
    let scope = req.scope()?;
    let summary = state.migration().delete_inactive_cluster_installations(&scope)?;
    state.wake();
    Ok(ApiResponse::ok(summary))
}

/// POST /api/v1/migrations/roles
pub async fn switch_roles(
    State(state): State<ApiState>,
    Json(req): Json<SwitchRolesRequest>,
) -> Reply<MigrationSummary> {
    let summary = state
        .migration()
        .switch_cluster_roles(&req.primary_cluster_id, &req.secondary_cluster_id)?;
    info!(
        primary = %req.secondary_cluster_id,
        secondary = %req.primary_cluster_id,
        "cluster roles switched"
    );
    Ok(ApiResponse::ok(summary))
}
