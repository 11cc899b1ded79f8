//! Connector health endpoint.

use std::{net::SocketAddr, sync::Arc};

use {
    axum::{Json, Router, extract::State, response::IntoResponse, routing::get},
    tokio::sync::watch,
    tracing::info,
};

use crate::{client::ConnectionState, error::Result, upstream::LlmClient};

#[derive(Clone)]
struct HealthState {
    relay_state: watch::Receiver<ConnectionState>,
    upstream: Arc<LlmClient>,
}

pub fn router(relay_state: watch::Receiver<ConnectionState>, upstream: Arc<LlmClient>) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(HealthState {
            relay_state,
            upstream,
        })
}

/// Serve the health endpoint until the process exits.
pub async fn serve(
    addr: SocketAddr,
    relay_state: watch::Receiver<ConnectionState>,
    upstream: Arc<LlmClient>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "health endpoint listening");
    axum::serve(listener, router(relay_state, upstream))
        .await
        .map_err(crate::error::Error::Io)?;
    Ok(())
}

async fn health(State(state): State<HealthState>) -> impl IntoResponse {
    let relay_connected = *state.relay_state.borrow() == ConnectionState::Authenticated;
    let llm_reachable = state.upstream.check_health().await;
    Json(serde_json::json!({
        "status": "healthy",
        "relay_connected": relay_connected,
        "llm_reachable": llm_reachable,
    }))
}
