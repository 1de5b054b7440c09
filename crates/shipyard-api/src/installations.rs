//! Installation and cluster installation endpoints.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use shipyard_core::new_id;
use shipyard_state::{
    Affinity, ClusterInstallation, ClusterInstallationFilter, DatabaseType, DnsRecord, FilestoreType,
    Group, Installation, InstallationPatch, InstallationState, RecordMeta, validate_dns_records,
};
use tracing::info;

use crate::ApiState;
use crate::error::{ApiError, ApiResult};
use crate::response::{ApiResponse, Created, PageQuery, Reply, created};

type S = InstallationState;

fn default_size() -> String {
    "1000users".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateInstallationRequest {
    pub owner_id: String,
    pub group_id: Option<String>,
    pub version: String,
    pub image: String,
    #[serde(default = "default_size")]
    pub size: String,
    #[serde(default)]
    pub database_type: DatabaseType,
    #[serde(default)]
    pub filestore_type: FilestoreType,
    #[serde(default)]
    pub affinity: Affinity,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub dns_records: Vec<DnsRecord>,
}

/// Filters for GET /api/v1/installations.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstallationQuery {
    pub owner_id: Option<String>,
    pub group_id: Option<String>,
    pub state: Option<InstallationState>,
}

impl InstallationQuery {
    fn matches(&self, installation: &Installation) -> bool {
        self.owner_id.as_deref().is_none_or(|o| o == installation.owner_id)
            && self
                .group_id
                .as_deref()
                .is_none_or(|g| installation.group_id.as_deref() == Some(g))
            && self.state.is_none_or(|s| s == installation.state)
    }
}

/// Filters for GET /api/v1/cluster-installations.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterInstallationQuery {
    pub cluster_id: Option<String>,
    pub installation_id: Option<String>,
    pub is_active: Option<bool>,
}

impl From<ClusterInstallationQuery> for ClusterInstallationFilter {
    fn from(q: ClusterInstallationQuery) -> Self {
        ClusterInstallationFilter {
            cluster_id: q.cluster_id,
            installation_id: q.installation_id,
            is_active: q.is_active,
        }
    }
}

fn validate_size(size: &str) -> ApiResult<()> {
    shipyard_placement::size_to_request(size)
        .map(|_| ())
        .map_err(|e| ApiError::bad_request(e.to_string()))
}

/// No two live installations may claim the same domain name.
fn ensure_domains_free(state: &ApiState, records: &[DnsRecord]) -> ApiResult<()> {
    let taken = state.store().list_all::<Installation>(|i| {
        i.dns_records
            .iter()
            .any(|existing| records.iter().any(|r| r.domain_name == existing.domain_name))
    })?;
    if let Some(other) = taken.first() {
        return Err(ApiError::Conflict(format!(
            "domain name already used by installation {}",
            other.id
        )));
    }
    Ok(())
}

// ── Installations ──────────────────────────────────────────────

/// GET /api/v1/installations
pub async fn list_installations(
    State(state): State<ApiState>,
    Query(page): Query<PageQuery>,
    Query(filter): Query<InstallationQuery>,
) -> Reply<Vec<Installation>> {
    let installations = state
        .store()
        .list::<Installation>(&page.paging(), |i| filter.matches(i))?;
    Ok(ApiResponse::ok(installations))
}

/// GET /api/v1/installations/{id}
pub async fn get_installation(State(state): State<ApiState>, Path(id): Path<String>) -> Reply<Installation> {
    Ok(ApiResponse::ok(state.fetch::<Installation>(&id)?))
}

/// POST /api/v1/installations
pub async fn create_installation(
    State(state): State<ApiState>,
    Json(req): Json<CreateInstallationRequest>,
) -> Created<Installation> {
    if req.owner_id.trim().is_empty() {
        return Err(ApiError::bad_request("owner_id is required"));
    }
    if req.version.trim().is_empty() || req.image.trim().is_empty() {
        return Err(ApiError::bad_request("version and image are required"));
    }
    validate_size(&req.size)?;
    validate_dns_records(&req.dns_records).map_err(ApiError::BadRequest)?;
    ensure_domains_free(&state, &req.dns_records)?;
    let group_sequence = match &req.group_id {
        Some(group_id) => Some(state.fetch::<Group>(group_id)?.sequence),
        None => None,
    };

    let dns_records = req
        .dns_records
        .into_iter()
        .map(|r| DnsRecord {
            target: String::new(),
            ..r
        })
        .collect();
    let mut installation = Installation {
        id: new_id(),
        state: S::CreationRequested,
        owner_id: req.owner_id,
        group_id: req.group_id,
        group_sequence,
        version: req.version,
        image: req.image,
        size: req.size,
        database_type: req.database_type,
        filestore_type: req.filestore_type,
        database_id: None,
        env: req.env,
        affinity: req.affinity,
        dns_records,
        deletion_locked: false,
        deletion_pending_expiry: None,
        resume_state: None,
        last_error: None,
        failed_since: None,
        meta: RecordMeta::new(state.now()),
    };
    state.store().create(&mut installation)?;
    info!(installation = %installation.id, owner = %installation.owner_id, size = %installation.size, "installation requested");
    state.wake();
    created(installation)
}

/// PATCH /api/v1/installations/{id}
///
/// A change to the deployed configuration moves a stable installation to
/// `update-requested`; hibernating installations pick it up on wake-up.
pub async fn patch_installation(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(patch): Json<InstallationPatch>,
) -> Reply<Installation> {
    if let Some(size) = patch.size.as_set() {
        validate_size(size)?;
    }
    if patch.owner_id.as_set().is_some_and(|o| o.trim().is_empty()) {
        return Err(ApiError::bad_request("owner_id cannot be empty"));
    }
    let (_guard, mut installation) = state.lock_mutable::<Installation>(&id)?;
    let before = installation.effective_config(None);
    if !patch.apply(&mut installation) {
        return Ok(ApiResponse::ok(installation));
    }
    let redeploy = installation.effective_config(None) != before;
    match (redeploy, installation.state) {
        (true, S::Stable | S::UpdateFailed) => {
            state.deps.recorder.transition(&mut installation, S::UpdateRequested)?;
        }
        (true, S::UpdateRequested | S::Hibernating) | (false, _) => {
            state.store().update(&mut installation)?;
        }
        (true, other) => {
            return Err(ApiError::bad_request(format!(
                "installation {id} is {other}, configuration can only change when stable or hibernating"
            )));
        }
    }
    info!(installation = %id, redeploy, "installation patched");
    state.wake();
    Ok(ApiResponse::ok(installation))
}

/// POST /api/v1/installations/{id}/hibernate
pub async fn hibernate_installation(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Reply<Installation> {
    let (_guard, mut installation) = state.lock_mutable::<Installation>(&id)?;
    match installation.state {
        S::HibernationRequested | S::Hibernating => {}
        S::Stable => {
            state
                .deps
                .recorder
                .transition(&mut installation, S::HibernationRequested)?;
            state.wake();
        }
        other => {
            return Err(ApiError::bad_request(format!(
                "installation {id} is {other}, only stable installations can hibernate"
            )));
        }
    }
    Ok(ApiResponse::ok(installation))
}

/// POST /api/v1/installations/{id}/wake
pub async fn wake_installation(State(state): State<ApiState>, Path(id): Path<String>) -> Reply<Installation> {
    let (_guard, mut installation) = state.lock_mutable::<Installation>(&id)?;
    match installation.state {
        S::WakeUpRequested => {}
        S::Hibernating => {
            state.deps.recorder.transition(&mut installation, S::WakeUpRequested)?;
            state.wake();
        }
        other => {
            return Err(ApiError::bad_request(format!(
                "installation {id} is {other}, only hibernating installations can wake up"
            )));
        }
    }
    Ok(ApiResponse::ok(installation))
}

/// DELETE /api/v1/installations/{id}
///
/// Moves the installation to `deletion-pending`; the deletion sweep
/// requests the actual deletion once the grace window has passed.
pub async fn delete_installation(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Reply<Installation> {
    let (_guard, mut installation) = state.lock_mutable::<Installation>(&id)?;
    if installation.deletion_locked {
        return Err(ApiError::Forbidden(format!("installation {id} is deletion-locked")));
    }
    match installation.state {
        S::Stable | S::Hibernating => {}
        S::DeletionPending | S::DeletionRequested | S::DeletionInProgress | S::DeletionFailed | S::Deleted => {
            return Ok(ApiResponse::ok(installation));
        }
        other => {
            return Err(ApiError::bad_request(format!(
                "installation {id} is {other}, only stable or hibernating installations can be deleted"
            )));
        }
    }
    let grace = u64::try_from(state.deletion_pending_time.as_millis()).unwrap_or(u64::MAX);
    let expiry = state.now().saturating_add(grace);
    installation.deletion_pending_expiry = Some(expiry);
    installation.resume_state = Some(installation.state);
    state.deps.recorder.transition(&mut installation, S::DeletionPending)?;
    info!(installation = %id, expiry, "installation deletion pending");
    state.wake();
    Ok(ApiResponse::ok(installation))
}

/// POST /api/v1/installations/{id}/deletion/cancel
pub async fn cancel_deletion(State(state): State<ApiState>, Path(id): Path<String>) -> Reply<Installation> {
    let (_guard, mut installation) = state.lock_mutable::<Installation>(&id)?;
    if installation.state != S::DeletionPending {
        return Err(ApiError::bad_request(format!(
            "installation {id} is {}, only pending deletions can be cancelled",
            installation.state
        )));
    }
    installation.deletion_pending_expiry = None;
    let resume = installation.resume_state.take().unwrap_or(S::Stable);
    state.deps.recorder.transition(&mut installation, resume)?;
    info!(installation = %id, state = %resume, "installation deletion cancelled");
    Ok(ApiResponse::ok(installation))
}

// ── Cluster installations ──────────────────────────────────────

/// GET /api/v1/cluster-installations
pub async fn list_cluster_installations(
    State(state): State<ApiState>,
    Query(page): Query<PageQuery>,
    Query(query): Query<ClusterInstallationQuery>,
) -> Reply<Vec<ClusterInstallation>> {
    let filter = ClusterInstallationFilter::from(query);
    let cis = state
        .store()
        .list::<ClusterInstallation>(&page.paging(), |ci| filter.matches(ci))?;
    Ok(ApiResponse::ok(cis))
}

/// GET /api/v1/cluster-installations/{id}
pub async fn get_cluster_installation(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Reply<ClusterInstallation> {
    Ok(ApiResponse::ok(state.fetch::<ClusterInstallation>(&id)?))
}
