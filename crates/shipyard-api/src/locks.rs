//! API security locks and installation deletion locks.
//!
//! Both are idempotent toggles. Unlocking wakes the scheduler so that
//! supervisors pick the record up again without waiting for a tick.

use axum::extract::{Path, State};
use shipyard_state::{Installation, Record};
use tracing::info;

use crate::ApiState;
use crate::response::{ApiResponse, Reply};

/// POST /api/v1/<resource>/{id}/api-lock
pub async fn lock_api<R: Record>(State(state): State<ApiState>, Path(id): Path<String>) -> Reply<R> {
    set_api_lock::<R>(&state, &id, true)
}

/// DELETE /api/v1/<resource>/{id}/api-lock
pub async fn unlock_api<R: Record>(State(state): State<ApiState>, Path(id): Path<String>) -> Reply<R> {
    set_api_lock::<R>(&state, &id, false)
}

fn set_api_lock<R: Record>(state: &ApiState, id: &str, locked: bool) -> Reply<R> {
    state.fetch::<R>(id)?;
    if state.store().set_api_lock::<R>(id, locked)? {
        info!(kind = %R::KIND, %id, locked, "api lock changed");
        if !locked {
            state.wake();
        }
    }
    Ok(ApiResponse::ok(state.fetch::<R>(id)?))
}

/// POST /api/v1/installations/{id}/deletion-lock
pub async fn lock_deletion(State(state): State<ApiState>, Path(id): Path<String>) -> Reply<Installation> {
    set_deletion_lock(&state, &id, true)
}

/// DELETE /api/v1/installations/{id}/deletion-lock
pub async fn unlock_deletion(State(state): State<ApiState>, Path(id): Path<String>) -> Reply<Installation> {
    set_deletion_lock(&state, &id, false)
}

fn set_deletion_lock(state: &ApiState, id: &str, locked: bool) -> Reply<Installation> {
    state.fetch::<Installation>(id)?;
    if state.store().set_deletion_lock(id, locked)? {
        info!(installation = %id, locked, "deletion lock changed");
        if !locked {
            state.wake();
        }
    }
    Ok(ApiResponse::ok(state.fetch::<Installation>(id)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_api;
    use axum::Json;
    use shipyard_state::{Cluster, ClusterMetadata};

    #[tokio::test]
    async fn api_lock_is_idempotent() {
        let api = test_api();
        let mut cluster = Cluster::new("c1".into(), "aws", ClusterMetadata::default(), 0);
        api.state.store().create(&mut cluster).unwrap();

        let Json(first) = lock_api::<Cluster>(State(api.state.clone()), Path("c1".into())).await.unwrap();
        assert!(first.data.unwrap().meta.api_locked);
        let Json(second) = lock_api::<Cluster>(State(api.state.clone()), Path("c1".into())).await.unwrap();
        assert!(second.data.unwrap().meta.api_locked);

        let Json(unlocked) = unlock_api::<Cluster>(State(api.state.clone()), Path("c1".into())).await.unwrap();
        assert!(!unlocked.data.unwrap().meta.api_locked);
    }

    #[tokio::test]
    async fn missing_record_is_404() {
        let api = test_api();
        let err = lock_deletion(State(api.state), Path("nope".into())).await.unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::NOT_FOUND);
    }
}
