//! Pooled HTTPS client wrapped in an exponential-backoff-with-jitter retry
//! loop over a fixed set of transient status codes.
//!
//! Built on the same pooled-client shape (hyper + hyper-rustls + hyper-util)
//! used elsewhere in this crate, with the retry/backoff loop factored out so
//! both the token endpoint and the Graph endpoint can share the policy.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;


/// HTTP statuses considered transient and worth retrying.
const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Per-attempt send deadline (§4.5: "60-second timeout per attempt").
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);

type HttpsConn = hyper_rustls::HttpsConnector<HttpConnector>;
type PooledClient = Client<HttpsConn, Full<Bytes>>;

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("cancelled")]
    Cancelled,
}

/// The outcome of a completed attempt sequence: the final response's status
/// and fully-buffered body, whether that response was itself a 2xx or a
/// non-retryable error. The caller decides what a given status means.
pub struct ExecutedResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

/// Wraps a pooled `hyper-util` legacy client and replays a request builder
/// across attempts, applying the backoff policy between them.
pub struct RetryExecutor {
    client: PooledClient,
    policy: RetryConfig,
}

impl RetryExecutor {
    pub fn new(policy: RetryConfig) -> Self {
        // `https_or_http` rather than `https_only`: production always talks to
        // the hardcoded https:// Microsoft endpoints (enforced by the fixed
        // base URLs in `Config`), but the test suite points this same executor
        // at a loopback plain-HTTP stand-in server (§10.4).
        let https = HttpsConnectorBuilder::new()
            .with_native_roots()
            .expect("failed to load native root certificates for hyper-rustls")
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(https);
        Self { client, policy }
    }

    /// Runs `build_request` up to `policy.max_attempts` times. `build_request`
    /// must be reusable across calls (the body it sets must come from an
    /// immutable, already-owned buffer so retries are always safe to replay).
    ///
    /// Network/transport errors and responses with a retryable status trigger
    /// another attempt after a backoff delay; anything else (success, or a
    /// non-retryable error status) is returned immediately.
    pub async fn execute<F>(
        &self,
        cancel: &CancellationToken,
        mut build_request: F,
    ) -> Result<ExecutedResponse, RetryError>
    where
        F: FnMut() -> Request<Full<Bytes>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let request = build_request();

            // The 60s deadline bounds the whole attempt — sending the
            // request AND draining the response body — not just the
            // headers phase, so a slow-trickling body can't hang past it.
            let attempt_result: Result<(StatusCode, Bytes), RetryError> = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                res = tokio::time::timeout(ATTEMPT_TIMEOUT, send_and_collect(&self.client, request)) => {
                    match res {
                        Ok(Ok(pair)) => Ok(pair),
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(RetryError::Timeout),
                    }
                }
            };

            match attempt_result {
                Ok((status, body)) => {
                    if status.is_success() || !is_retryable(status) || attempt >= self.policy.max_attempts {
                        return Ok(ExecutedResponse { status, body });
                    }

                    log::debug!(
                        "attempt {}/{} got retryable status {}; backing off",
                        attempt,
                        self.policy.max_attempts,
                        status
                    );
                    self.wait_before_retry(cancel, attempt).await?;
                }
                Err(e) => {
                    if attempt >= self.policy.max_attempts {
                        return Err(e);
                    }
                    log::debug!(
                        "attempt {}/{} failed ({}); backing off",
                        attempt,
                        self.policy.max_attempts,
                        e
                    );
                    self.wait_before_retry(cancel, attempt).await?;
                }
            }
        }
    }

    async fn wait_before_retry(
        &self,
        cancel: &CancellationToken,
        attempt: u32,
    ) -> Result<(), RetryError> {
        let delay = backoff_delay(self.policy.initial_backoff, self.policy.max_backoff, attempt);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

/// `min(initial * 2^(attempt-1), max) + uniform_jitter_in_[0, delay/4)`.
fn backoff_delay(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    let scaled = initial.checked_mul(1u32 << exp).unwrap_or(max);
    let base = scaled.min(max);
    let jitter_ceiling_ms = (base.as_millis() / 4) as u64;
    let jitter_ms = if jitter_ceiling_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..jitter_ceiling_ms)
    };
    base + Duration::from_millis(jitter_ms)
}

fn is_retryable(status: StatusCode) -> bool {
    RETRYABLE_STATUSES.contains(&status.as_u16())
}

/// Sends `request` and fully drains its response body. Left un-timed here;
/// the caller wraps the whole call in `ATTEMPT_TIMEOUT`.
async fn send_and_collect(
    client: &PooledClient,
    request: Request<Full<Bytes>>,
) -> Result<(StatusCode, Bytes), RetryError> {
    let response: Response<Incoming> = client
        .request(request)
        .await
        .map_err(|e| RetryError::Network(e.to_string()))?;
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| RetryError::Network(e.to_string()))?
        .to_bytes();
    Ok((status, body))
}
