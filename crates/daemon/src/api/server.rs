/// API server implementation

use super::handlers::{get_status, health_check, AppState};
use anyhow::Result;
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;
use veilnet_common::Timestamp;
use veilnet_core::RelayNode;

pub struct ApiServer {
    listen_addr: SocketAddr,
    node: Arc<RelayNode>,
}

impl ApiServer {
    pub fn new(listen_addr: SocketAddr, node: Arc<RelayNode>) -> Self {
        Self { listen_addr, node }
    }

    pub async fn start(self) -> Result<()> {
        let state = AppState {
            node: self.node,
            started: Timestamp::now(),
        };

        let app = Router::new()
            .route("/health", get(health_check))
            .route("/api/status", get(get_status))
            // allow browser tooling to poll the API
            .layer(CorsLayer::permissive())
            .with_state(state);

        info!("API server starting on {}", self.listen_addr);
        let listener = tokio::net::TcpListener::bind(self.listen_addr).await?;
        axum::serve(listener, app)
            .await
            .map_err(|e| anyhow::anyhow!("API server error: {}", e))?;

        Ok(())
    }
}
