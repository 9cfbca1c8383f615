//! Accepts SMTP connections, enforces a concurrency ceiling, and hands each
//! socket to a `Session`. Coordinates graceful drain on shutdown.

mod session;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::auth::{self, TokenCache};
use crate::config::Config;
use crate::graph::Submitter;

pub use session::Session;

/// How long the accept loop blocks per iteration before re-checking the
/// shutdown signal (§4.1).
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// How long the Listener waits for in-flight sessions to drain on shutdown.
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

/// Binds the configured address and runs the accept loop until `shutdown`
/// fires, then drains in-flight sessions.
pub struct Listener {
    config: Arc<Config>,
    token_cache: Arc<TokenCache>,
    submitter: Arc<Submitter>,
    semaphore: Arc<Semaphore>,
    active_sessions: Arc<AtomicUsize>,
}

impl Listener {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let token_cache = Arc::new(TokenCache::new(
            config.oauth2.clone(),
            config.token_endpoint_base.clone(),
        ));
        let submitter = Arc::new(Submitter::new(
            config.graph_api_base.clone(),
            config.retry.clone(),
        ));
        let semaphore = Arc::new(Semaphore::new(config.max_connections));

        Self {
            config,
            token_cache,
            submitter,
            semaphore,
            active_sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The number of sessions currently being served, exposed for the
    /// health-check server's liveness report.
    pub fn active_sessions(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.active_sessions)
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        info!("SMTP relay listening on {}", self.config.listen_addr);

        let tracker = TaskTracker::new();
        let sweeper_shutdown = shutdown.clone();
        let sweeper_cache = Arc::clone(&self.token_cache);
        tracker.spawn(auth::run_sweeper(sweeper_cache, sweeper_shutdown));

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let accept_result =
                tokio::time::timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await;

            let (stream, peer) = match accept_result {
                Err(_) => continue, // poll timeout; loop back to check shutdown
                Ok(Err(e)) => {
                    error!("error accepting connection: {e}");
                    continue;
                }
                Ok(Ok(pair)) => pair,
            };

            let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("connection limit reached; rejecting {peer}");
                    let mut stream = stream;
                    let _ = reject_too_many_connections(&mut stream).await;
                    continue;
                }
            };

            info!("new connection from {peer}");
            let config = Arc::clone(&self.config);
            let token_cache = Arc::clone(&self.token_cache);
            let submitter = Arc::clone(&self.submitter);
            let session_shutdown = shutdown.clone();
            let active_sessions = Arc::clone(&self.active_sessions);

            active_sessions.fetch_add(1, Ordering::SeqCst);
            tracker.spawn(async move {
                // `permit` is held for the session's lifetime; dropping it
                // (on any exit path, including a panic unwound by the task
                // boundary) releases the semaphore slot.
                let _permit = permit;
                let session = Session::new(stream, config, token_cache, submitter, session_shutdown);
                if let Err(e) = session.run().await {
                    error!("session with {peer} ended with error: {e:#}");
                }
                active_sessions.fetch_sub(1, Ordering::SeqCst);
                info!("connection from {peer} closed");
            });
        }

        drop(listener);
        tracker.close();
        info!("accept loop stopped; draining in-flight sessions (up to {DRAIN_DEADLINE:?})");

        if tokio::time::timeout(DRAIN_DEADLINE, tracker.wait()).await.is_err() {
            warn!("drain deadline exceeded; abandoning remaining sessions");
        }

        Ok(())
    }
}

async fn reject_too_many_connections(stream: &mut tokio::net::TcpStream) -> Result<()> {
    use tokio::io::AsyncWriteExt;
    stream
        .write_all(b"421 4.7.0 Too many connections, try again later\r\n")
        .await?;
    Ok(())
}
