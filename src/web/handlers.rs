//! HTTP request handlers.

use super::AppState;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Deserialize;

const DEFAULT_EVENT_LIMIT: u32 = 50;
const MAX_EVENT_LIMIT: u32 = 500;

// ============================================================================
// API: State
// ============================================================================

pub async fn handle_get_state(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.get_state() {
        Ok(values) => Json(values).into_response(),
        Err(e) => {
            tracing::error!("Store: Failed to read state: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

// ============================================================================
// API: Events
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<u32>,
}

impl EventsQuery {
    fn limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_EVENT_LIMIT)
            .clamp(1, MAX_EVENT_LIMIT)
    }
}

pub async fn handle_get_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    match state.store.recent_events(query.limit()) {
        Ok(events) => Json(events).into_response(),
        Err(e) => {
            tracing::error!("Store: Failed to read events: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

// ============================================================================
// Liveness
// ============================================================================

pub async fn handle_healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
