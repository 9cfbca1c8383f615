//! Side-channel liveness endpoint (§10.5 ambient, carried from the teacher).
//!
//! Not part of the core per spec §1 scope; reports process liveness plus the
//! in-process count of currently-served SMTP sessions so an operator can see
//! the relay is actually doing something, not just that the port is open.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use log::{error, info};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

struct HealthState {
    active_sessions: Arc<AtomicUsize>,
}

async fn health_check_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let active = state.active_sessions.load(Ordering::SeqCst);
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "active_sessions": active })),
    )
}

/// Runs the health check HTTP server until `shutdown` fires.
///
/// Binds to the address specified in the config and serves `/health`.
pub async fn run_health_server(
    config: Config,
    active_sessions: Arc<AtomicUsize>,
    shutdown: CancellationToken,
) -> Result<()> {
    let state = Arc::new(HealthState { active_sessions });
    let app = Router::new()
        .route("/health", get(health_check_handler))
        .with_state(state);

    let addr_str = format!(
        "{}:{}",
        config.health_check_bind_address, config.health_check_port
    );

    let listener = TcpListener::bind(&addr_str).await.map_err(|e| {
        error!("Failed to bind health check server to {}: {}", addr_str, e);
        anyhow::anyhow!("Failed to bind health check server: {}", e)
    })?;

    info!("Health check server listening on {}", addr_str);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| {
            error!("Health check server error: {}", e);
            anyhow::anyhow!("Health check server failed: {}", e)
        })?;

    info!("Health check server stopped");
    Ok(())
}
