//! HTTP server for health, readiness, and metrics endpoints

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::buffer::SharedBuffer;
use crate::connection::ConnectionStats;
use crate::metrics::encode_metrics;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub accepted: usize,
    pub active: usize,
    pub max_connections: usize,
    /// Entries held by the shared buffer
    pub buffered: usize,
}

/// Shared state for health endpoints
#[derive(Clone)]
pub struct ServerState {
    pub stats: ConnectionStats,
    pub buffer: Arc<SharedBuffer>,
}

impl ServerState {
    pub fn new(stats: ConnectionStats, buffer: Arc<SharedBuffer>) -> Self {
        Self { stats, buffer }
    }

    fn response(&self, status: &str) -> HealthResponse {
        HealthResponse {
            status: status.to_string(),
            accepted: self.stats.accepted(),
            active: self.stats.active(),
            max_connections: self.stats.max_connections(),
            buffered: self.buffer.len(),
        }
    }
}

/// Health endpoint - always returns 200 if server is running
async fn health(State(state): State<ServerState>) -> Json<HealthResponse> {
    Json(state.response("ok"))
}

/// Ready endpoint - returns 200 only while the connection budget is not exhausted
async fn ready(State(state): State<ServerState>) -> (StatusCode, Json<HealthResponse>) {
    if state.stats.is_accepting() {
        (StatusCode::OK, Json(state.response("ready")))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(state.response("not_accepting")),
        )
    }
}

/// Prometheus text exposition
async fn metrics() -> impl IntoResponse {
    match encode_metrics() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Create the health server router
pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Run the health server
pub async fn run_server(addr: SocketAddr, state: ServerState) -> std::io::Result<()> {
    let app = create_router(state);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}
