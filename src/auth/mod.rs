//! Per-user OAuth2 access-token cache with expiry-aware refresh and
//! single-flight coalescing of concurrent fetches for the same login.
//!
//! The upstream call is a single unretried ROPC POST (§7: "Token endpoint
//! calls are NOT retried"), so this module talks to the pooled HTTPS client
//! directly rather than through `http_retry::RetryExecutor`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};

use crate::config::OAuth2Config;


/// Safety margin subtracted from the service-reported lifetime.
const EXPIRY_SAFETY_MARGIN: Duration = Duration::from_secs(60);
/// Floor on the computed expiry, regardless of what the server reported.
const EXPIRY_FLOOR: Duration = Duration::from_secs(30);
/// Deadline for a single token-endpoint POST.
const TOKEN_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'%');

#[derive(Debug, Clone, Error)]
pub enum TokenError {
    #[error("token request failed: {0}")]
    Request(String),
    #[error("authorization server rejected the request")]
    OAuthRejected,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_valid(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: u64,
    #[serde(default)]
    error: String,
    #[serde(default)]
    #[allow(dead_code)]
    error_description: String,
}

type HttpsConn = hyper_rustls::HttpsConnector<HttpConnector>;
type TokenHttpClient = Client<HttpsConn, Full<Bytes>>;

/// Keyed cache of OAuth2 access tokens, safe for concurrent `get` calls.
pub struct TokenCache {
    oauth2: OAuth2Config,
    token_endpoint_base: String,
    client: TokenHttpClient,
    cache: Mutex<HashMap<String, CachedToken>>,
    inflight: Mutex<HashMap<String, Arc<OnceCell<Result<String, TokenError>>>>>,
}

impl TokenCache {
    pub fn new(oauth2: OAuth2Config, token_endpoint_base: String) -> Self {
        let https = HttpsConnectorBuilder::new()
            .with_native_roots()
            .expect("failed to load native root certificates for hyper-rustls")
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(https);

        Self {
            oauth2,
            token_endpoint_base,
            client,
            cache: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a valid access token for `login_id`, fetching (and caching) a
    /// fresh one if necessary. Concurrent calls for the same `login_id`
    /// coalesce onto a single upstream request.
    pub async fn get(&self, login_id: &str, secret: &str) -> Result<String, TokenError> {
        if let Some(token) = self.cached_valid(login_id).await {
            return Ok(token);
        }

        let cell = {
            let mut inflight = self.inflight.lock().await;
            Arc::clone(
                inflight
                    .entry(login_id.to_string())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };

        let result = cell
            .get_or_init(|| async {
                // Re-check: another caller may have populated the cache while
                // we were waiting to enter this region.
                if let Some(token) = self.cached_valid(login_id).await {
                    return Ok(token);
                }
                self.fetch_and_cache(login_id, secret).await
            })
            .await
            .clone();

        // The entry is short-lived: drop it once this fetch has resolved so a
        // later cold call starts a fresh single-flight region.
        let mut inflight = self.inflight.lock().await;
        if let Some(existing) = inflight.get(login_id) {
            if Arc::ptr_eq(existing, &cell) {
                inflight.remove(login_id);
            }
        }

        result
    }

    async fn cached_valid(&self, login_id: &str) -> Option<String> {
        let cache = self.cache.lock().await;
        cache
            .get(login_id)
            .filter(|t| t.is_valid())
            .map(|t| t.access_token.clone())
    }

    async fn fetch_and_cache(&self, login_id: &str, secret: &str) -> Result<String, TokenError> {
        let form = serde_urlencoded::to_string([
            ("grant_type", "password"),
            ("client_id", self.oauth2.client_id.as_str()),
            ("client_secret", self.oauth2.client_secret.as_str()),
            ("username", login_id),
            ("password", secret),
            ("scope", self.oauth2.scopes.as_str()),
        ])
        .map_err(|e| TokenError::Request(e.to_string()))?;

        let tenant_segment = utf8_percent_encode(&self.oauth2.tenant_id, PATH_SEGMENT);
        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.token_endpoint_base, tenant_segment
        );

        let request = Request::builder()
            .method("POST")
            .uri(&url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(Full::new(Bytes::from(form)))
            .map_err(|e| TokenError::Request(e.to_string()))?;

        let response = tokio::time::timeout(TOKEN_FETCH_TIMEOUT, self.client.request(request))
            .await
            .map_err(|_| TokenError::Request("timed out".to_string()))?
            .map_err(|e| TokenError::Request(e.to_string()))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| TokenError::Request(e.to_string()))?
            .to_bytes();

        // The body itself is never surfaced in the returned error or logged:
        // it may carry the client secret or other sensitive detail.
        let parsed: TokenResponse = serde_json::from_slice(&body)
            .map_err(|_| TokenError::Request(format!("malformed token response (status {status})")))?;

        if !parsed.error.is_empty() || parsed.access_token.is_empty() {
            log::warn!("token request for {login_id} was rejected by the authorization server");
            return Err(TokenError::OAuthRejected);
        }

        let lifetime = Duration::from_secs(parsed.expires_in);
        let margin = lifetime
            .checked_sub(EXPIRY_SAFETY_MARGIN)
            .unwrap_or(Duration::ZERO)
            .max(EXPIRY_FLOOR);
        let expires_at = Instant::now() + margin;

        let mut cache = self.cache.lock().await;
        cache.insert(
            login_id.to_string(),
            CachedToken {
                access_token: parsed.access_token.clone(),
                expires_at,
            },
        );

        Ok(parsed.access_token)
    }

    /// Deletes any cache entry whose expiry has already passed. Called
    /// periodically by the background sweeper.
    pub async fn sweep_expired(&self) {
        let mut cache = self.cache.lock().await;
        let before = cache.len();
        cache.retain(|_, token| token.is_valid());
        let removed = before - cache.len();
        if removed > 0 {
            log::debug!("token cache sweep removed {removed} expired entr{}", if removed == 1 { "y" } else { "ies" });
        }
    }
}

/// Runs `TokenCache::sweep_expired` on a fixed interval until `shutdown` fires.
pub async fn run_sweeper(cache: Arc<TokenCache>, shutdown: tokio_util::sync::CancellationToken) {
    const SWEEP_INTERVAL: Duration = Duration::from_secs(300);
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.tick().await; // first tick fires immediately; skip it.
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                log::info!("token cache sweeper stopping");
                return;
            }
            _ = ticker.tick() => {
                cache.sweep_expired().await;
            }
        }
    }
}
