//! State change event log and webhook subscriptions.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use shipyard_core::new_id;
use shipyard_state::{ResourceKind, StateChangeEvent, Subscription};
use tracing::info;

use crate::ApiState;
use crate::error::ApiError;
use crate::response::{ApiResponse, Created, PageQuery, Reply, created};

const DEFAULT_EVENT_LIMIT: usize = 100;
const MAX_EVENT_LIMIT: usize = 1000;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventQuery {
    /// Only events with a sequence greater than this.
    #[serde(default)]
    pub after: u64,
    pub limit: Option<usize>,
    pub resource_type: Option<ResourceKind>,
    pub resource_id: Option<String>,
}

impl EventQuery {
    fn matches(&self, event: &StateChangeEvent) -> bool {
        self.resource_type.is_none_or(|kind| kind == event.resource_type)
            && self
                .resource_id
                .as_deref()
                .is_none_or(|id| id == event.resource_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub url: String,
    pub owner_id: Option<String>,
    pub resource_type: Option<ResourceKind>,
}

/// GET /api/v1/events
pub async fn list_events(
    State(state): State<ApiState>,
    Query(query): Query<EventQuery>,
) -> Reply<Vec<StateChangeEvent>> {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT).clamp(1, MAX_EVENT_LIMIT);
    let events = state
        .store()
        .list_events(query.after, limit, |event| query.matches(event))?;
    Ok(ApiResponse::ok(events))
}

/// GET /api/v1/subscriptions
pub async fn list_subscriptions(
    State(state): State<ApiState>,
    Query(page): Query<PageQuery>,
) -> Reply<Vec<Subscription>> {
    Ok(ApiResponse::ok(state.store().list::<Subscription>(&page.paging(), |_| true)?))
}

/// GET /api/v1/subscriptions/{id}
pub async fn get_subscription(State(state): State<ApiState>, Path(id): Path<String>) -> Reply<Subscription> {
    Ok(ApiResponse::ok(state.fetch::<Subscription>(&id)?))
}

/// POST /api/v1/subscriptions
///
/// Deliveries start with the next event recorded; history is available from
/// `GET /events`.
pub async fn create_subscription(
    State(state): State<ApiState>,
    Json(req): Json<CreateSubscriptionRequest>,
) -> Created<Subscription> {
    let url = req.url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ApiError::bad_request(format!("subscription url {url:?} must be http(s)")));
    }
    let mut subscription = Subscription::new(new_id(), url.to_string(), state.now());
    subscription.owner_id = req.owner_id;
    subscription.resource_type = req.resource_type;
    subscription.last_delivered_sequence = state.store().last_event_sequence()?;
    state.store().create(&mut subscription)?;
    info!(subscription = %subscription.id, url = %subscription.url, "subscription created");
    state.wake();
    created(subscription)
}

/// DELETE /api/v1/subscriptions/{id}
pub async fn delete_subscription(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Reply<Subscription> {
    let (_guard, _) = state.lock_mutable::<Subscription>(&id)?;
    state.store().soft_delete::<Subscription>(&id, state.now())?;
    info!(subscription = %id, "subscription deleted");
    let subscription = state.store().require::<Subscription>(&id)?;
    Ok(ApiResponse::ok(subscription))
}
