/// API request handlers

use super::responses::*;
use axum::{extract::State, Json};
use std::sync::Arc;
use tracing::debug;
use veilnet_common::Timestamp;
use veilnet_core::RelayNode;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub node: Arc<RelayNode>,
    pub started: Timestamp,
}

/// Handler for GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Handler for GET /api/status
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    debug!("API: GET /api/status");

    let stats = state.node.stats();
    Json(StatusResponse {
        agent: stats.agent,
        version: env!("CARGO_PKG_VERSION").to_string(),
        connections: stats.connections,
        hops: stats.hops,
        uptime_secs: state.started.elapsed().as_secs(),
    })
}
