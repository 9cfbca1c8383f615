//! Orchestrates the relay's startup and component lifecycle.
//!
//! This library crate loads configuration and concurrently runs the primary
//! services (the SMTP relay and the health-check side channel). A single
//! `CancellationToken` carries the shutdown signal (§5): on SIGINT/Ctrl-C it
//! stops the SMTP accept loop, drains in-flight sessions, stops the token
//! cache sweeper, and shuts the health server down gracefully.

pub mod auth;
pub mod config;
pub mod graph;
pub mod health;
pub mod http_retry;
pub mod mime_normalizer;
pub mod smtp;

use anyhow::Result;
use log::{error, info};
use tokio::select;
use tokio_util::sync::CancellationToken;

/// Runs the relay. Returns only on fatal configuration failure, or if one of
/// the two server tasks ends unexpectedly (error, panic, or early clean exit).
pub async fn run() -> Result<()> {
    info!(
        "Starting {} v{} SMTP-to-Graph relay",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let config = match config::Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    let shutdown = CancellationToken::new();

    let listener = smtp::Listener::new(config.clone());
    let active_sessions = listener.active_sessions();

    let smtp_shutdown = shutdown.clone();
    let mut smtp_handle = tokio::spawn(async move { listener.run(smtp_shutdown).await });

    let health_config = config.clone();
    let health_shutdown = shutdown.clone();
    let mut health_handle =
        tokio::spawn(async move { health::run_health_server(health_config, active_sessions, health_shutdown).await });

    select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received; draining in-flight sessions");
            shutdown.cancel();
        }
        res = &mut smtp_handle => {
            error!("SMTP server task terminated unexpectedly");
            shutdown.cancel();
            health_handle.abort();
            return flatten(res, "SMTP server");
        }
        res = &mut health_handle => {
            error!("health check server task terminated unexpectedly");
            shutdown.cancel();
            smtp_handle.abort();
            return flatten(res, "health check server");
        }
    }

    let smtp_result = flatten(smtp_handle.await, "SMTP server");
    let health_result = flatten(health_handle.await, "health check server");
    smtp_result.and(health_result)
}

/// Collapses a `JoinHandle`'s nested `Result<Result<(), anyhow::Error>, JoinError>`
/// into a single `anyhow::Result`, labeling panics/cancellations with `task_name`.
fn flatten(res: Result<Result<()>, tokio::task::JoinError>, task_name: &str) -> Result<()> {
    match res {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(join_error) if join_error.is_cancelled() => Ok(()),
        Err(join_error) => Err(anyhow::anyhow!("{task_name} task failed: {join_error}")),
    }
}
