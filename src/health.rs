//! HTTP health endpoint.
//!
//! Serves `GET /health` on its own listener so load balancers can probe the
//! process without speaking the WebSocket protocol. Available with the
//! `health-http` feature (enabled by default).

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::info;

use crate::hub::HealthReport;
use crate::server::ServerHandle;

/// Router exposing `GET /health`.
pub fn router(handle: ServerHandle) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(handle)
}

/// Serve the health router until the listener fails.
///
/// # Errors
///
/// Returns an I/O error if the server stops accepting connections.
pub async fn serve(listener: TcpListener, handle: ServerHandle) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "serving /health");
    }
    axum::serve(listener, router(handle)).await
}

async fn health(
    State(handle): State<ServerHandle>,
) -> Result<Json<HealthReport>, (StatusCode, String)> {
    handle
        .health()
        .await
        .map(Json)
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
}
