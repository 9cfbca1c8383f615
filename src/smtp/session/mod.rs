//! The per-connection SMTP state machine (§4.2): parses commands, enforces
//! ordering and authentication, applies size and recipient limits, and
//! orchestrates the token cache and Graph submitter for each accepted
//! message.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::Result;
use base64::alphabet;
use base64::engine::{general_purpose::GeneralPurposeConfig, DecodePaddingMode, GeneralPurpose};
use base64::Engine as _;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::auth::TokenCache;
use crate::config::Config;
use crate::graph::Submitter;
use crate::mime_normalizer;


/// Command lines longer than this are rejected with `500 5.5.1`.
const MAX_COMMAND_LINE: usize = 512;
/// Hard ceiling on recipients per envelope.
const MAX_RECIPIENTS: usize = 500;
/// Fixed per-command read deadline (§4.2), also covering DATA line reads.
/// Unlike `connection_timeout_seconds`, this is not configurable.
const COMMAND_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Accepts both padded and unpadded base64, per §4.2's AUTH LOGIN/PLAIN rules.
static FLEXIBLE_BASE64: LazyLock<GeneralPurpose> = LazyLock::new(|| {
    GeneralPurpose::new(
        &alphabet::STANDARD,
        GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
    )
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthState {
    Greeted,
    Announced,
    Authed,
}

enum ReadOutcome {
    Line(String),
    Eof,
    TooLong,
    TimedOut,
}

/// Owns one accepted connection end to end. Constructed by the `Listener`
/// for each accepted socket and run to completion (or fatal I/O error) on
/// its own task.
pub struct Session {
    reader: BufReader<ReadHalf<TcpStream>>,
    writer: WriteHalf<TcpStream>,
    config: Arc<Config>,
    token_cache: Arc<TokenCache>,
    submitter: Arc<Submitter>,
    shutdown: CancellationToken,
    state: AuthState,
    login_id: String,
    secret: String,
    mail_from: Option<String>,
    rcpt_to: Vec<String>,
}

impl Session {
    pub fn new(
        stream: TcpStream,
        config: Arc<Config>,
        token_cache: Arc<TokenCache>,
        submitter: Arc<Submitter>,
        shutdown: CancellationToken,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            config,
            token_cache,
            submitter,
            shutdown,
            state: AuthState::Greeted,
            login_id: String::new(),
            secret: String::new(),
            mail_from: None,
            rcpt_to: Vec::new(),
        }
    }

    /// Drives the session to completion. Returns `Ok(())` on a clean QUIT,
    /// peer disconnect, or command timeout; only a write-side I/O failure on
    /// the socket itself is propagated as an error.
    pub async fn run(mut self) -> Result<()> {
        self.write_line("220 SMTP Relay Ready").await?;

        loop {
            match self.read_line(Some(MAX_COMMAND_LINE)).await? {
                ReadOutcome::Eof => {
                    log::debug!("connection closed by peer");
                    break;
                }
                ReadOutcome::TimedOut => {
                    log::debug!("command read timed out; closing connection");
                    break;
                }
                ReadOutcome::TooLong => {
                    self.write_line("500 5.5.1 Line too long").await?;
                }
                ReadOutcome::Line(line) => {
                    if line.is_empty() {
                        continue;
                    }
                    // §6: `connection_timeout_seconds` is a second, outer
                    // deadline bounding the whole command (which, for AUTH
                    // and DATA, spans multiple individual reads), renewed
                    // fresh for every command — independent of the fixed
                    // 60s deadline each individual read is subject to.
                    match tokio::time::timeout(self.connection_timeout(), self.dispatch(&line)).await {
                        Err(_) => {
                            log::debug!("command exceeded connection_timeout_seconds; closing connection");
                            break;
                        }
                        Ok(result) => {
                            if result? {
                                break;
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Processes one command line. Returns `Ok(true)` when the connection
    /// should close (QUIT, or an unrecoverable AUTH failure).
    async fn dispatch(&mut self, line: &str) -> Result<bool> {
        let upper = line.to_ascii_uppercase();
        let command = upper.split_whitespace().next().unwrap_or("");

        match command {
            "QUIT" => {
                self.write_line("221 2.0.0 Bye").await?;
                return Ok(true);
            }
            "NOOP" => {
                self.write_line("250 2.0.0 Ok").await?;
                return Ok(false);
            }
            "RSET" => {
                self.mail_from = None;
                self.rcpt_to.clear();
                self.write_line("250 2.0.0 Ok").await?;
                return Ok(false);
            }
            "EHLO" | "HELO" => {
                self.handle_helo(command == "EHLO").await?;
                return Ok(false);
            }
            "AUTH" => return self.handle_auth(line).await,
            "MAIL" => {
                if !self.ensure_authenticated_or_anonymous() {
                    self.write_line("530 5.7.0 Authentication required").await?;
                    return Ok(false);
                }
                self.handle_mail_from(line).await?;
                return Ok(false);
            }
            "RCPT" => {
                if !self.ensure_authenticated_or_anonymous() {
                    self.write_line("530 5.7.0 Authentication required").await?;
                    return Ok(false);
                }
                self.handle_rcpt_to(line).await?;
                return Ok(false);
            }
            "DATA" => {
                if !self.ensure_authenticated_or_anonymous() {
                    self.write_line("530 5.7.0 Authentication required").await?;
                    return Ok(false);
                }
                self.handle_data().await?;
                return Ok(false);
            }
            _ => {}
        }

        if self.state != AuthState::Authed {
            self.write_line("530 5.7.0 Authentication required").await?;
        } else {
            self.write_line("502 5.5.2 Command not recognized").await?;
        }
        Ok(false)
    }

    /// When `allow_anonymous` is configured with fallback credentials, an
    /// un-authenticated session may proceed straight into the envelope
    /// phase using the fallback identity (§9 Open Questions).
    fn ensure_authenticated_or_anonymous(&mut self) -> bool {
        if self.state == AuthState::Authed {
            return true;
        }
        if self.config.allow_anonymous {
            if let (Some(user), Some(pass)) = (&self.config.fallback_user, &self.config.fallback_pass) {
                log::info!("accepting anonymous submission via fallback identity");
                self.login_id = user.clone();
                self.secret = pass.clone();
                self.state = AuthState::Authed;
                return true;
            }
        }
        false
    }

    async fn handle_helo(&mut self, is_ehlo: bool) -> Result<()> {
        if is_ehlo {
            self.write_line("250-SMTP Relay").await?;
            self.write_line("250 AUTH LOGIN PLAIN").await?;
        } else {
            self.write_line("250 SMTP Relay").await?;
        }
        if self.state == AuthState::Greeted {
            self.state = AuthState::Announced;
        }
        Ok(())
    }

    async fn handle_auth(&mut self, line: &str) -> Result<bool> {
        let mut parts = line.split_whitespace();
        parts.next(); // "AUTH"
        let mechanism = parts.next().map(|m| m.to_ascii_uppercase());
        let initial = parts.next();

        match mechanism.as_deref() {
            Some("LOGIN") => self.handle_auth_login(initial).await,
            Some("PLAIN") => self.handle_auth_plain(initial).await,
            _ => {
                self.write_line("504 5.5.4 Unrecognized authentication mechanism")
                    .await?;
                Ok(false)
            }
        }
    }

    async fn handle_auth_login(&mut self, initial_username: Option<&str>) -> Result<bool> {
        let username_b64 = match initial_username {
            Some(u) => u.to_string(),
            None => {
                self.write_line("334 VXNlcm5hbWU6").await?;
                match self.read_line(None).await? {
                    ReadOutcome::Line(l) => l,
                    _ => return Ok(true),
                }
            }
        };

        self.write_line("334 UGFzc3dvcmQ6").await?;
        let password_b64 = match self.read_line(None).await? {
            ReadOutcome::Line(l) => l,
            _ => return Ok(true),
        };

        let username = decode_b64_lossy(&username_b64);
        let password = decode_b64_lossy(&password_b64);
        self.finish_auth(username, password).await
    }

    async fn handle_auth_plain(&mut self, initial_payload: Option<&str>) -> Result<bool> {
        let payload_b64 = match initial_payload {
            Some(p) => p.to_string(),
            None => {
                self.write_line("334 ").await?;
                match self.read_line(None).await? {
                    ReadOutcome::Line(l) => l,
                    _ => return Ok(true),
                }
            }
        };

        let (username, password) = match FLEXIBLE_BASE64.decode(payload_b64.as_bytes()) {
            Ok(bytes) => parse_plain_payload(&bytes),
            Err(_) => (String::new(), String::new()),
        };
        self.finish_auth(username, password).await
    }

    async fn finish_auth(&mut self, mut username: String, mut password: String) -> Result<bool> {
        if username.is_empty() || password.is_empty() {
            match (&self.config.fallback_user, &self.config.fallback_pass) {
                (Some(u), Some(p)) => {
                    log::warn!(
                        "AUTH payload had empty username/password; substituting fallback identity (per-user auditing bypassed)"
                    );
                    username = u.clone();
                    password = p.clone();
                }
                _ => {
                    self.write_line("535 5.7.8 Authentication credentials invalid")
                        .await?;
                    return Ok(true);
                }
            }
        }

        match self.token_cache.get(&username, &password).await {
            Ok(_token) => {
                self.login_id = username;
                self.secret = password;
                self.state = AuthState::Authed;
                self.write_line("235 2.7.0 Authentication successful").await?;
                Ok(false)
            }
            Err(_) => {
                self.write_line("535 5.7.8 Authentication failed").await?;
                Ok(true)
            }
        }
    }

    async fn handle_mail_from(&mut self, line: &str) -> Result<()> {
        if self.mail_from.is_some() {
            self.write_line("502 5.5.2 Command out of sequence").await?;
            return Ok(());
        }

        let addr = extract_address(line);
        match addr {
            Some(a) if is_valid_address(&a) => {
                self.mail_from = Some(a);
                self.rcpt_to.clear();
                self.write_line("250 2.0.0 Ok").await?;
            }
            _ => {
                self.write_line("501 5.1.7 Invalid address").await?;
            }
        }
        Ok(())
    }

    async fn handle_rcpt_to(&mut self, line: &str) -> Result<()> {
        if self.mail_from.is_none() {
            self.write_line("502 5.5.2 Command out of sequence").await?;
            return Ok(());
        }
        if self.rcpt_to.len() >= MAX_RECIPIENTS {
            self.write_line("452 4.5.3 Too many recipients").await?;
            return Ok(());
        }

        let addr = extract_address(line);
        match addr {
            Some(a) if is_valid_address(&a) => {
                self.rcpt_to.push(a);
                self.write_line("250 2.0.0 Ok").await?;
            }
            _ => {
                self.write_line("553 5.1.3 Invalid address").await?;
            }
        }
        Ok(())
    }

    async fn handle_data(&mut self) -> Result<()> {
        if self.rcpt_to.is_empty() {
            self.write_line("503 5.5.1 No recipients specified").await?;
            return Ok(());
        }

        self.write_line("354 End data with <CR><LF>.<CR><LF>").await?;

        let mut buffer: Vec<u8> = Vec::new();
        let mut byte_count: usize = 0;
        let mut too_large = false;

        loop {
            match self.read_line(None).await? {
                ReadOutcome::Line(line) => {
                    if line == "." {
                        break;
                    }
                    // RFC 5321 §4.5.2 dot-stuffing: a leading '.' is stripped.
                    let content = line.strip_prefix('.').unwrap_or(&line);
                    if !too_large {
                        byte_count += content.len() + 2;
                        if byte_count > self.config.max_message_size {
                            too_large = true;
                        } else {
                            buffer.extend_from_slice(content.as_bytes());
                            buffer.extend_from_slice(b"\r\n");
                        }
                    }
                }
                ReadOutcome::TooLong => unreachable!("DATA reads are not length-capped"),
                ReadOutcome::Eof | ReadOutcome::TimedOut => {
                    anyhow::bail!("connection lost mid-DATA");
                }
            }
        }

        if too_large {
            self.mail_from = None;
            self.rcpt_to.clear();
            self.write_line(&format!(
                "552 5.3.4 Message too large (max {} bytes)",
                self.config.max_message_size
            ))
            .await?;
            return Ok(());
        }

        self.finish_data(&buffer).await
    }

    async fn finish_data(&mut self, buffer: &[u8]) -> Result<()> {
        let outcome = mime_normalizer::normalize(buffer, self.config.strict_attachments);
        let reply = match outcome {
            Err(e) => {
                log::warn!("message normalization failed: {e}");
                "550 5.6.0 Message parsing failed".to_string()
            }
            Ok(normalized) => match self.token_cache.get(&self.login_id, &self.secret).await {
                Err(e) => {
                    log::warn!("token acquisition failed during DATA submission: {e}");
                    "451 4.7.0 Temporary authentication failure".to_string()
                }
                Ok(token) => {
                    let mail_from = self.mail_from.clone().unwrap_or_default();
                    match self
                        .submitter
                        .submit(
                            &self.shutdown,
                            &token,
                            &mail_from,
                            &self.rcpt_to,
                            &normalized,
                            self.config.save_to_sent,
                        )
                        .await
                    {
                        Ok(()) => "250 2.0.0 Ok: queued as graphapi".to_string(),
                        Err(_) => "550 5.7.0 Delivery failed".to_string(),
                    }
                }
            },
        };

        self.mail_from = None;
        self.rcpt_to.clear();
        self.write_line(&reply).await
    }

    /// The outer per-command deadline (§6 `connection_timeout_seconds`),
    /// renewed for every command dispatched.
    fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.config.connection_timeout_seconds)
    }

    async fn read_line(&mut self, cap: Option<usize>) -> Result<ReadOutcome> {
        let mut buf = Vec::new();
        let read = tokio::time::timeout(COMMAND_READ_TIMEOUT, self.reader.read_until(b'\n', &mut buf)).await;
        match read {
            Err(_) => Ok(ReadOutcome::TimedOut),
            Ok(Ok(0)) => Ok(ReadOutcome::Eof),
            Ok(Ok(_)) => {
                let text = String::from_utf8_lossy(&buf);
                let trimmed = text.trim_end_matches(['\r', '\n']).to_string();
                if let Some(max) = cap {
                    if trimmed.len() > max {
                        return Ok(ReadOutcome::TooLong);
                    }
                }
                Ok(ReadOutcome::Line(trimmed))
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}

fn decode_b64_lossy(value: &str) -> String {
    FLEXIBLE_BASE64
        .decode(value.as_bytes())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

fn parse_plain_payload(bytes: &[u8]) -> (String, String) {
    let parts: Vec<&[u8]> = bytes.splitn(3, |&b| b == 0).collect();
    if parts.len() == 3 {
        (
            String::from_utf8_lossy(parts[1]).into_owned(),
            String::from_utf8_lossy(parts[2]).into_owned(),
        )
    } else {
        (String::new(), String::new())
    }
}

/// Prefers text between `<` and `>`; otherwise takes the text after the
/// first `:`, trims it, and strips any trailing SMTP parameter token
/// (e.g. `SIZE=12345`).
fn extract_address(line: &str) -> Option<String> {
    if let (Some(start), Some(end)) = (line.find('<'), line.find('>')) {
        if start < end {
            return Some(line[start + 1..end].to_string());
        }
    }

    let after_colon = line.splitn(2, ':').nth(1)?;
    let token = after_colon.trim_start().split_whitespace().next()?;
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

fn is_valid_address(addr: &str) -> bool {
    if addr.is_empty() || addr.len() > 254 {
        return false;
    }
    if addr.matches('@').count() != 1 {
        return false;
    }
    let mut split = addr.splitn(2, '@');
    let local = split.next().unwrap_or("");
    let domain = split.next().unwrap_or("");
    if local.is_empty() || local.len() > 64 {
        return false;
    }
    if domain.is_empty() || domain.len() > 253 || !domain.contains('.') {
        return false;
    }
    true
}
