//! HTTP status endpoints for operators.

use axum::{Json, Router, extract::State, response::IntoResponse, routing::get};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::dispatch::DispatcherStats;

/// Build the Axum router exposing `/health` and `/status`.
pub fn status_routes(stats: watch::Receiver<DispatcherStats>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(stats)
}

/// Bind `0.0.0.0:<port>` and serve the status routes until the process exits.
pub async fn serve_status(
    port: u16,
    stats: watch::Receiver<DispatcherStats>,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "Status server started");
    axum::serve(listener, status_routes(stats)).await
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "scripter-dispatcher"
    }))
}

async fn status(State(stats): State<watch::Receiver<DispatcherStats>>) -> impl IntoResponse {
    let snapshot = stats.borrow().clone();
    Json(snapshot)
}
