//! API error type and its HTTP mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use shipyard_state::StateError;
use shipyard_supervisor::{MigrationError, SupervisorError};
use tracing::warn;

use crate::response::ApiResponse;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Malformed request or a resource in the wrong state for it.
    #[error("{0}")]
    BadRequest(String),

    /// API-locked resource, or deletion of a deletion-locked installation.
    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    /// Version conflict or a reconciliation lock held by someone else.
    #[error("{0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn not_found(kind: &str, id: &str) -> Self {
        Self::NotFound(format!("{kind} {id} not found"))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "request failed");
        }
        (status, Json(ApiResponse::<()>::failure(self.to_string()))).into_response()
    }
}

impl From<StateError> for ApiError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotFound(_) => ApiError::NotFound(e.to_string()),
            StateError::AlreadyExists(_) | StateError::Conflict { .. } => ApiError::Conflict(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<SupervisorError> for ApiError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::State(inner) => inner.into(),
            SupervisorError::Precondition(msg) => ApiError::BadRequest(msg),
            SupervisorError::Placement(inner) => ApiError::BadRequest(inner.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<MigrationError> for ApiError {
    fn from(e: MigrationError) -> Self {
        match e {
            MigrationError::State(inner) => inner.into(),
            MigrationError::Supervisor(inner) => inner.into(),
            MigrationError::ClusterNotFound(_)
            | MigrationError::ClusterInstallationNotFound(_)
            | MigrationError::InstallationNotFound(_) => ApiError::NotFound(e.to_string()),
            MigrationError::Locked(_) => ApiError::Conflict(e.to_string()),
            MigrationError::TargetClosed(_)
            | MigrationError::SameCluster(_)
            | MigrationError::TargetNotReady { .. }
            | MigrationError::NotOnSource { .. }
            | MigrationError::StillActive(_) => ApiError::BadRequest(e.to_string()),
            MigrationError::Provisioner(_) => ApiError::Internal(e.to_string()),
        }
    }
}
