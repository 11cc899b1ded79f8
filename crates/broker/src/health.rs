//! Health and readiness endpoints, published on their own listener.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};

use crate::state::BrokerState;

pub fn router(state: Arc<BrokerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(state)
}

/// The broker is healthy whenever it is running; connector availability is
/// informational.
async fn health(State(state): State<Arc<BrokerState>>) -> impl IntoResponse {
    let models = state.router.models();
    Json(serde_json::json!({
        "status": "healthy",
        "connectors_connected": state.registry.count(),
        "models": models,
        "model_count": models.len(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

/// Ready once at least one connector is serving.
async fn ready(State(state): State<Arc<BrokerState>>) -> impl IntoResponse {
    let connected = state.registry.count();
    let status = if connected > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "ready": connected > 0,
            "connectors_connected": connected,
        })),
    )
}
