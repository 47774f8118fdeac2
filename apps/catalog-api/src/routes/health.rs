use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use crate::listener::supervisor::ListenerPhase;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    /// Open realtime connections.
    pub connections: usize,
    pub listener: ListenerPhase,
    /// Notification channel the listener subscribes to.
    pub notify_channel: String,
    /// Query connections currently held by the pool.
    pub db_pool_size: usize,
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse),
    ),
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let listener = *state.listener_phase.borrow();
    Json(HealthResponse {
        status: "ok".to_string(),
        connections: state.connections.count(),
        listener,
        notify_channel: state.config.notify_channel.clone(),
        db_pool_size: state.db.status().size,
    })
}
