//! Group endpoints. Members roll onto a changed group configuration under
//! the group supervisor's `max_rolling` limit.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use shipyard_core::new_id;
use shipyard_state::{Group, GroupPatch, Installation, InstallationState};
use tracing::info;

use crate::ApiState;
use crate::error::ApiError;
use crate::response::{ApiResponse, Created, PageQuery, Reply, created};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    pub version: Option<String>,
    pub image: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub max_rolling: Option<u32>,
}

/// GET /api/v1/groups
pub async fn list_groups(State(state): State<ApiState>, Query(page): Query<PageQuery>) -> Reply<Vec<Group>> {
    Ok(ApiResponse::ok(state.store().list::<Group>(&page.paging(), |_| true)?))
}

/// GET /api/v1/groups/{id}
pub async fn get_group(State(state): State<ApiState>, Path(id): Path<String>) -> Reply<Group> {
    Ok(ApiResponse::ok(state.fetch::<Group>(&id)?))
}

/// POST /api/v1/groups
pub async fn create_group(State(state): State<ApiState>, Json(req): Json<CreateGroupRequest>) -> Created<Group> {
    if req.name.trim().is_empty() {
        return Err(ApiError::bad_request("group name is required"));
    }
    let mut group = Group::new(new_id(), req.name, state.now());
    group.version = req.version;
    group.image = req.image;
    group.env = req.env;
    if let Some(max_rolling) = req.max_rolling {
        group.max_rolling = max_rolling;
    }
    state.store().create(&mut group)?;
    info!(group = %group.id, name = %group.name, "group created");
    created(group)
}

/// PATCH /api/v1/groups/{id}
pub async fn patch_group(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(patch): Json<GroupPatch>,
) -> Reply<Group> {
    let (_guard, mut group) = state.lock_mutable::<Group>(&id)?;
    if patch.apply(&mut group) {
        state.store().update(&mut group)?;
        info!(group = %id, sequence = group.sequence, "group patched");
        state.wake();
    }
    Ok(ApiResponse::ok(group))
}

/// PUT /api/v1/groups/{id}/installations/{installation_id}
///
/// The installation is rolled onto the group configuration by the group
/// supervisor, like any other member lagging behind the group sequence.
pub async fn join_group(
    State(state): State<ApiState>,
    Path((id, installation_id)): Path<(String, String)>,
) -> Reply<Installation> {
    state.fetch::<Group>(&id)?;
    let (_guard, mut installation) = state.lock_mutable::<Installation>(&installation_id)?;
    if installation.group_id.as_deref() == Some(id.as_str()) {
        return Ok(ApiResponse::ok(installation));
    }
    installation.group_id = Some(id.clone());
    installation.group_sequence = None;
    state.store().update(&mut installation)?;
    info!(group = %id, installation = %installation_id, "installation joined group");
    state.wake();
    Ok(ApiResponse::ok(installation))
}

/// DELETE /api/v1/groups/{id}/installations/{installation_id}
pub async fn leave_group(
    State(state): State<ApiState>,
    Path((id, installation_id)): Path<(String, String)>,
) -> Reply<Installation> {
    let (_guard, mut installation) = state.lock_mutable::<Installation>(&installation_id)?;
    if installation.group_id.as_deref() != Some(id.as_str()) {
        return Err(ApiError::bad_request(format!(
            "installation {installation_id} is not a member of group {id}"
        )));
    }
    installation.group_id = None;
    installation.group_sequence = None;
    if matches!(installation.state, InstallationState::Stable | InstallationState::UpdateFailed) {
        state
            .deps
            .recorder
            .transition(&mut installation, InstallationState::UpdateRequested)?;
    } else {
        state.store().update(&mut installation)?;
    }
    info!(group = %id, installation = %installation_id, "installation left group");
    state.wake();
    Ok(ApiResponse::ok(installation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_api;
    use axum::http::StatusCode;
    use shipyard_supervisor::supervisors::GroupSupervisor;

    async fn new_group(state: &ApiState, max_rolling: u32) -> Group {
        let req = CreateGroupRequest {
            name: "blue".into(),
            version: Some("9.1.0".into()),
            image: None,
            env: BTreeMap::new(),
            max_rolling: Some(max_rolling),
        };
        let (_, Json(resp)) = create_group(State(state.clone()), Json(req)).await.unwrap();
        resp.data.unwrap()
    }

    #[tokio::test]
    async fn joined_members_roll_one_at_a_time() {
        let api = test_api();
        let group = new_group(&api.state, 1).await;
        for id in ["i1", "i2"] {
            api.installation(id, InstallationState::Stable);
            let Json(resp) = join_group(State(api.state.clone()), Path((group.id.clone(), id.to_string())))
                .await
                .unwrap();
            assert_eq!(resp.data.unwrap().group_id.as_deref(), Some(group.id.as_str()));
        }

        let supervisor = GroupSupervisor::new(api.state.deps.clone());
        assert_eq!(supervisor.roll_out(&group).unwrap(), 1);
        let updating = api
            .state
            .store()
            .list_all::<Installation>(|i| i.state == InstallationState::UpdateRequested)
            .unwrap();
        assert_eq!(updating.len(), 1);
    }

    #[tokio::test]
    async fn patch_bumps_sequence_only_for_config() {
        let api = test_api();
        let group = new_group(&api.state, 1).await;
        let patch: GroupPatch = serde_json::from_str(r#"{"max_rolling": 4}"#).unwrap();
        let Json(resp) = patch_group(State(api.state.clone()), Path(group.id.clone()), Json(patch))
            .await
            .unwrap();
        assert_eq!(resp.data.unwrap().sequence, 1);

        let patch: GroupPatch = serde_json::from_str(r#"{"image": "tenant/app-v2"}"#).unwrap();
        let Json(resp) = patch_group(State(api.state), Path(group.id), Json(patch)).await.unwrap();
        assert_eq!(resp.data.unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn leaving_requests_an_update() {
        let api = test_api();
        let group = new_group(&api.state, 1).await;
        api.installation("i1", InstallationState::Stable);

        let err = leave_group(State(api.state.clone()), Path((group.id.clone(), "i1".into())))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let Json(resp) = join_group(State(api.state.clone()), Path((group.id.clone(), "i1".into())))
            .await
            .unwrap();
        assert_eq!(resp.data.unwrap().group_id.as_deref(), Some(group.id.as_str()));
        let Json(resp) = leave_group(State(api.state), Path((group.id, "i1".into()))).await.unwrap();
        let installation = resp.data.unwrap();
        assert!(installation.group_id.is_none());
        assert_eq!(installation.state, InstallationState::UpdateRequested);
    }
}
