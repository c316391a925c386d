//! HTTP surface over the orchestrator's read-only state.

use axum::extract::State as AxumState;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

use crate::error::Result;
use crate::pipeline::Pipeline;

/// Build the router for `/health`, `/state`, and `/diagnostics`.
pub fn router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/state", get(state))
        .route("/diagnostics", get(diagnostics))
        .with_state(pipeline)
}

/// Serve the HTTP surface until the listener fails.
///
/// # Errors
///
/// Returns an error if the port cannot be bound.
pub async fn serve(pipeline: Arc<Pipeline>, port: u16) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "HTTP surface listening");
    axum::serve(listener, router(pipeline)).await?;
    Ok(())
}

async fn health(AxumState(pipeline): AxumState<Arc<Pipeline>>) -> Json<Value> {
    Json(json!({"status": "ok", "state": pipeline.state().name()}))
}

async fn state(AxumState(pipeline): AxumState<Arc<Pipeline>>) -> Json<Value> {
    Json(json!({"state": pipeline.state().name()}))
}

async fn diagnostics(AxumState(pipeline): AxumState<Arc<Pipeline>>) -> Json<Value> {
    Json(pipeline.diagnostics())
}
