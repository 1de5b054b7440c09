//! Response envelope shared by every endpoint.

use axum::Json;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use shipyard_state::Paging;

use crate::error::ApiResult;

/// `{success, data, error}` wrapper for consistent API format.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }

    pub fn failure(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Handler result carrying `T` in the envelope.
pub type Reply<T> = ApiResult<Json<ApiResponse<T>>>;

/// Handler result for endpoints that create a record.
pub type Created<T> = ApiResult<(StatusCode, Json<ApiResponse<T>>)>;

pub fn created<T: Serialize>(data: T) -> Created<T> {
    Ok((StatusCode::CREATED, ApiResponse::ok(data)))
}

/// `?page=&per_page=&include_deleted=` on list endpoints.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    pub include_deleted: Option<bool>,
}

impl PageQuery {
    pub fn paging(&self) -> Paging {
        let mut paging = match self.per_page {
            Some(per_page) => Paging::page(self.page.unwrap_or(0), per_page.max(1)),
            None => Paging::all(),
        };
        if self.include_deleted.unwrap_or(false) {
            paging = paging.with_deleted();
        }
        paging
    }
}
