//! Cluster endpoints.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use shipyard_core::validate::parse_kubernetes_version;
use shipyard_core::{RotatorConfig, new_id};
use shipyard_state::{
    Cluster, ClusterChangeRequest, ClusterInstallation, ClusterInstallationState, ClusterMetadata,
    ClusterPatch, ClusterState, ResourceState,
};
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::response::{ApiResponse, Created, PageQuery, Reply, created};
use crate::ApiState;

fn default_provider() -> String {
    "aws".to_string()
}

fn default_true() -> bool {
    true
}

/// Cluster creation request body. Unset metadata fields take the defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateClusterRequest {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub size: Option<String>,
    pub node_instance_type: Option<String>,
    pub node_min_count: Option<u32>,
    pub node_max_count: Option<u32>,
    pub networking: Option<String>,
    pub image: Option<String>,
    pub kubernetes_version: Option<String>,
    #[serde(default = "default_true")]
    pub allow_installations: bool,
    #[serde(default)]
    pub annotations: Vec<String>,
}

impl CreateClusterRequest {
    fn metadata(&self) -> ApiResult<ClusterMetadata> {
        let mut metadata = ClusterMetadata::default();
        if let Some(v) = &self.size {
            metadata.size = v.clone();
        }
        if let Some(v) = &self.node_instance_type {
            metadata.node_instance_type = v.clone();
        }
        if let Some(v) = self.node_min_count {
            metadata.node_min_count = v;
        }
        if let Some(v) = self.node_max_count {
            metadata.node_max_count = v;
        }
        if let Some(v) = &self.networking {
            metadata.networking = v.clone();
        }
        if let Some(v) = &self.image {
            metadata.image = v.clone();
        }
        if let Some(v) = &self.kubernetes_version {
            validate_version(v)?;
            metadata.kubernetes_version = v.clone();
        }
        validate_node_counts(metadata.node_min_count, metadata.node_max_count)?;
        Ok(metadata)
    }
}

/// POST /api/v1/clusters/{id}/upgrade
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpgradeClusterRequest {
    pub kubernetes_version: Option<String>,
    pub image: Option<String>,
    pub rotator: Option<RotatorConfig>,
}

/// POST /api/v1/clusters/{id}/resize
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResizeClusterRequest {
    pub node_instance_type: Option<String>,
    pub node_min_count: Option<u32>,
    pub node_max_count: Option<u32>,
    pub rotator: Option<RotatorConfig>,
}

fn validate_version(version: &str) -> ApiResult<()> {
    parse_kubernetes_version(version)
        .map(|_| ())
        .map_err(|e| ApiError::bad_request(format!("invalid kubernetes version {version:?}: {e}")))
}

fn validate_node_counts(min: u32, max: u32) -> ApiResult<()> {
    if min == 0 || min > max {
        return Err(ApiError::bad_request(format!(
            "node counts must satisfy 0 < min <= max, got min {min} max {max}"
        )));
    }
    Ok(())
}

/// `requested` may be entered from stable, from its own failed state, or
/// again before the supervisor claimed it.
fn accepts(cluster: &Cluster, requested: ClusterState, failed: ClusterState) -> ApiResult<()> {
    if matches!(cluster.state, ClusterState::Stable) || cluster.state == requested || cluster.state == failed {
        return Ok(());
    }
    Err(ApiError::bad_request(format!(
        "cluster {} is {}, cannot move to {requested}",
        cluster.id, cluster.state
    )))
}

// ── Handlers ───────────────────────────────────────────────────

/// GET /api/v1/clusters
pub async fn list_clusters(State(state): State<ApiState>, Query(page): Query<PageQuery>) -> Reply<Vec<Cluster>> {
    let clusters = state.store().list::<Cluster>(&page.paging(), |_| true)?;
    Ok(ApiResponse::ok(clusters))
}

/// GET /api/v1/clusters/{id}
pub async fn get_cluster(State(state): State<ApiState>, Path(id): Path<String>) -> Reply<Cluster> {
    Ok(ApiResponse::ok(state.fetch::<Cluster>(&id)?))
}

/// POST /api/v1/clusters
pub async fn create_cluster(
    State(state): State<ApiState>,
    Json(req): Json<CreateClusterRequest>,
) -> Created<Cluster> {
    let metadata = req.metadata()?;
    let mut cluster = Cluster::new(new_id(), &req.provider, metadata, state.now());
    cluster.allow_installations = req.allow_installations;
    cluster.annotations = req.annotations;
    state.store().create(&mut cluster)?;
    info!(cluster = %cluster.id, provider = %cluster.provider, "cluster requested");
    state.wake();
    created(cluster)
}

/// PATCH /api/v1/clusters/{id}
pub async fn patch_cluster(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(patch): Json<ClusterPatch>,
) -> Reply<Cluster> {
    let (_guard, mut cluster) = state.lock_mutable::<Cluster>(&id)?;
    if patch.apply(&mut cluster) {
        state.store().update(&mut cluster)?;
        info!(cluster = %id, allow_installations = cluster.allow_installations, "cluster patched");
        state.wake();
    }
    Ok(ApiResponse::ok(cluster))
}

/// POST /api/v1/clusters/{id}/provision
pub async fn provision_cluster(State(state): State<ApiState>, Path(id): Path<String>) -> Reply<Cluster> {
    let (_guard, mut cluster) = state.lock_mutable::<Cluster>(&id)?;
    accepts(&cluster, ClusterState::ProvisioningRequested, ClusterState::ProvisioningFailed)?;
    request(&state, &mut cluster, ClusterState::ProvisioningRequested)?;
    Ok(ApiResponse::ok(cluster))
}

/// POST /api/v1/clusters/{id}/upgrade
pub async fn upgrade_cluster(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<UpgradeClusterRequest>,
) -> Reply<Cluster> {
    if req.kubernetes_version.is_none() && req.image.is_none() {
        return Err(ApiError::bad_request("upgrade needs a kubernetes_version or an image"));
    }
    if let Some(version) = &req.kubernetes_version {
        validate_version(version)?;
    }
    let (_guard, mut cluster) = state.lock_mutable::<Cluster>(&id)?;
    accepts(&cluster, ClusterState::UpgradeRequested, ClusterState::UpgradeFailed)?;
    cluster.change_request = Some(ClusterChangeRequest {
        kubernetes_version: req.kubernetes_version,
        image: req.image,
        rotator: req.rotator,
        ..ClusterChangeRequest::default()
    });
    request(&state, &mut cluster, ClusterState::UpgradeRequested)?;
    Ok(ApiResponse::ok(cluster))
}

/// POST /api/v1/clusters/{id}/resize
pub async fn resize_cluster(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<ResizeClusterRequest>,
) -> Reply<Cluster> {
    if req.node_instance_type.is_none() && req.node_min_count.is_none() && req.node_max_count.is_none() {
        return Err(ApiError::bad_request(
            "resize needs a node_instance_type, node_min_count or node_max_count",
        ));
    }
    let (_guard, mut cluster) = state.lock_mutable::<Cluster>(&id)?;
    accepts(&cluster, ClusterState::ResizeRequested, ClusterState::ResizeFailed)?;
    validate_node_counts(
        req.node_min_count.unwrap_or(cluster.metadata.node_min_count),
        req.node_max_count.unwrap_or(cluster.metadata.node_max_count),
    )?;
    cluster.change_request = Some(ClusterChangeRequest {
        node_instance_type: req.node_instance_type,
        node_min_count: req.node_min_count,
        node_max_count: req.node_max_count,
        rotator: req.rotator,
        ..ClusterChangeRequest::default()
    });
    request(&state, &mut cluster, ClusterState::ResizeRequested)?;
    Ok(ApiResponse::ok(cluster))
}

/// DELETE /api/v1/clusters/{id}
///
/// Refused while installations still live on the cluster.
pub async fn delete_cluster(State(state): State<ApiState>, Path(id): Path<String>) -> Reply<Cluster> {
    let (_guard, mut cluster) = state.lock_mutable::<Cluster>(&id)?;
    if matches!(
        cluster.state,
        ClusterState::DeletionRequested | ClusterState::DeletionInProgress | ClusterState::DeletionFailed
    ) {
        return Ok(ApiResponse::ok(cluster));
    }
    if !(cluster.state == ClusterState::Stable || cluster.state.is_failed()) {
        return Err(ApiError::bad_request(format!(
            "cluster {id} is {}, wait for it to settle before deleting",
            cluster.state
        )));
    }
    let live = state.store().list_all::<ClusterInstallation>(|ci| {
        ci.cluster_id == id && ci.state != ClusterInstallationState::Deleted
    })?;
    if !live.is_empty() {
        return Err(ApiError::bad_request(format!(
            "cluster {id} still hosts {} cluster installations",
            live.len()
        )));
    }
    request(&state, &mut cluster, ClusterState::DeletionRequested)?;
    Ok(ApiResponse::ok(cluster))
}

/// Transition (writing any other pending field changes with it) and wake.
fn request(state: &ApiState, cluster: &mut Cluster, to: ClusterState) -> ApiResult<()> {
    if !state.deps.recorder.transition(cluster, to)? {
        state.store().update(cluster)?;
    }
    info!(cluster = %cluster.id, state = %to, "cluster operation requested");
    state.wake();
    Ok(())
}
