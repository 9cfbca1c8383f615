//! Manages application configuration loaded from environment variables.
//!
//! This module defines the `Config` struct which holds all runtime settings
//! and provides the `from_env` function to populate this struct. It supports
//! loading variables from a `.env` file via the `dotenv` crate and provides
//! default values for optional settings.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Default base URL for the Azure AD v2 token endpoint. Overridable only for
/// tests, never by configuration, since production must always talk to the
/// real tenant.
pub const DEFAULT_TOKEN_ENDPOINT_BASE: &str = "https://login.microsoftonline.com";
/// Default base URL for the Microsoft Graph API.
pub const DEFAULT_GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";

const DEFAULT_MAX_MESSAGE_SIZE: usize = 26_214_400;
const DEFAULT_MAX_CONNECTIONS: usize = 100;
const DEFAULT_CONNECTION_TIMEOUT_SECONDS: u64 = 300;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 500;
const RETRY_MAX_BACKOFF: Duration = Duration::from_secs(10);

/// ROPC (Resource Owner Password Credentials) application registration used
/// to exchange a client's SMTP username/password for a Graph access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuth2Config {
    pub client_id: String,
    pub client_secret: String,
    pub tenant_id: String,
    /// Space-separated OAuth2 scope list sent as the `scope` form field.
    pub scopes: String,
}

/// Immutable retry policy applied to the Graph submission call only (the
/// token endpoint is never retried, per spec).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Holds the application's runtime configuration settings.
///
/// These settings are typically loaded from environment variables via `from_env`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// TCP address the SMTP relay listens on. (Optional: `MAIL_RELAY_LISTEN_ADDR`, Default: "127.0.0.1:2526")
    pub listen_addr: String,

    /// ROPC credentials used to mint Graph access tokens on behalf of authenticated clients.
    pub oauth2: OAuth2Config,

    /// Credentials substituted when a client's AUTH payload decodes to an empty
    /// username or password. (Optional: `MAIL_RELAY_FALLBACK_USER` / `MAIL_RELAY_FALLBACK_PASS`)
    pub fallback_user: Option<String>,
    pub fallback_pass: Option<String>,

    /// When true AND fallback credentials are configured, a session may skip
    /// AUTH entirely and submit using the fallback identity.
    /// (Optional: `MAIL_RELAY_ALLOW_ANONYMOUS`, Default: false)
    pub allow_anonymous: bool,

    /// Forwarded verbatim as `saveToSentItems` in the Graph envelope.
    /// (Optional: `MAIL_RELAY_SAVE_TO_SENT`, Default: false)
    pub save_to_sent: bool,

    /// Maximum DATA payload size in bytes. (Optional: `MAIL_RELAY_MAX_MESSAGE_SIZE`, Default: 26214400)
    pub max_message_size: usize,

    /// Maximum concurrently live SMTP sessions. (Optional: `MAIL_RELAY_MAX_CONNECTIONS`, Default: 100)
    pub max_connections: usize,

    /// Per-command read deadline, renewed on each line. (Optional: `MAIL_RELAY_CONNECTION_TIMEOUT_SECONDS`, Default: 300)
    pub connection_timeout_seconds: u64,

    /// When true, a per-attachment decode failure fails the whole message.
    /// (Optional: `MAIL_RELAY_STRICT_ATTACHMENTS`, Default: false)
    pub strict_attachments: bool,

    /// Graph submission retry policy.
    pub retry: RetryConfig,

    /// Health check HTTP server bind address. (Optional: `MAIL_RELAY_HEALTH_BIND_ADDRESS`, Default: "127.0.0.1")
    pub health_check_bind_address: String,
    /// Health check HTTP server port. (Optional: `MAIL_RELAY_HEALTH_PORT`, Default: 8080)
    pub health_check_port: u16,

    /// Base URL for the OAuth2 token endpoint. Always the real Azure AD
    /// endpoint in production; overridden only by tests.
    pub token_endpoint_base: String,
    /// Base URL for the Microsoft Graph API. Always the real endpoint in
    /// production; overridden only by tests.
    pub graph_api_base: String,
}

impl Config {
    /// Loads configuration settings from environment variables.
    ///
    /// Reads variables prefixed with `MAIL_RELAY_`. Supports loading from a `.env` file
    /// if present. Provides default values for optional settings.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if a required variable is missing, or if any numeric
    /// variable is set but fails to parse.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv::dotenv();

        let client_id = require_env("MAIL_RELAY_OAUTH_CLIENT_ID")?;
        let client_secret = require_env("MAIL_RELAY_OAUTH_CLIENT_SECRET")?;
        let tenant_id = require_env("MAIL_RELAY_OAUTH_TENANT_ID")?;
        let scopes = env::var("MAIL_RELAY_OAUTH_SCOPES")
            .unwrap_or_else(|_| "https://graph.microsoft.com/.default offline_access".to_string());

        let oauth2 = OAuth2Config {
            client_id,
            client_secret,
            tenant_id,
            scopes,
        };

        let listen_addr =
            env::var("MAIL_RELAY_LISTEN_ADDR").unwrap_or_else(|_| "127.0.0.1:2526".to_string());

        let fallback_user = env::var("MAIL_RELAY_FALLBACK_USER").ok();
        let fallback_pass = env::var("MAIL_RELAY_FALLBACK_PASS").ok();

        let allow_anonymous = parse_bool_env("MAIL_RELAY_ALLOW_ANONYMOUS", false)?;
        let save_to_sent = parse_bool_env("MAIL_RELAY_SAVE_TO_SENT", false)?;
        let strict_attachments = parse_bool_env("MAIL_RELAY_STRICT_ATTACHMENTS", false)?;

        let max_message_size = parse_env("MAIL_RELAY_MAX_MESSAGE_SIZE", DEFAULT_MAX_MESSAGE_SIZE)?;
        let max_connections = parse_env("MAIL_RELAY_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?;
        let connection_timeout_seconds = parse_env(
            "MAIL_RELAY_CONNECTION_TIMEOUT_SECONDS",
            DEFAULT_CONNECTION_TIMEOUT_SECONDS,
        )?;

        // Parsed as a signed type first: a negative value must be normalized
        // to the default rather than failing `u32::from_str` and propagating
        // as a hard config error.
        let retry_attempts_raw: i64 =
            parse_env("MAIL_RELAY_RETRY_ATTEMPTS", DEFAULT_RETRY_ATTEMPTS as i64)?;
        let retry_attempts: u32 = if retry_attempts_raw <= 0 {
            log::warn!(
                "MAIL_RELAY_RETRY_ATTEMPTS was 0 or negative; normalizing to {}",
                DEFAULT_RETRY_ATTEMPTS
            );
            DEFAULT_RETRY_ATTEMPTS
        } else {
            retry_attempts_raw as u32
        };
        let retry_initial_delay_ms: u64 = parse_env(
            "MAIL_RELAY_RETRY_INITIAL_DELAY_MS",
            DEFAULT_RETRY_INITIAL_DELAY_MS,
        )?;

        let retry = RetryConfig {
            max_attempts: retry_attempts,
            initial_backoff: Duration::from_millis(retry_initial_delay_ms),
            max_backoff: RETRY_MAX_BACKOFF,
        };

        let health_check_bind_address = env::var("MAIL_RELAY_HEALTH_BIND_ADDRESS")
            .unwrap_or_else(|_| "127.0.0.1".to_string());
        let health_check_port: u16 = parse_env("MAIL_RELAY_HEALTH_PORT", 8080u16)?;

        let config = Config {
            listen_addr,
            oauth2,
            fallback_user,
            fallback_pass,
            allow_anonymous,
            save_to_sent,
            max_message_size,
            max_connections,
            connection_timeout_seconds,
            strict_attachments,
            retry,
            health_check_bind_address,
            health_check_port,
            token_endpoint_base: DEFAULT_TOKEN_ENDPOINT_BASE.to_string(),
            graph_api_base: DEFAULT_GRAPH_API_BASE.to_string(),
        };

        log::info!(
            "Config: listen_addr={}, max_connections={}, max_message_size={}, retry_attempts={}",
            config.listen_addr,
            config.max_connections,
            config.max_message_size,
            config.retry.max_attempts,
        );

        Ok(config)
    }
}

fn require_env(key: &str) -> Result<String> {
    env::var(key).map_err(|e| {
        let err_msg = format!("{key} environment variable must be set");
        log::error!("{err_msg}: {e}");
        anyhow!(e).context(err_msg)
    })
}

fn parse_bool_env(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(val) => val
            .parse::<bool>()
            .map_err(|e| anyhow!("{key} ('{val}') must be a valid bool: {e}")),
        Err(_) => Ok(default),
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow!("{key} ('{val}') failed to parse: {e}")),
        Err(_) => Ok(default),
    }
}
