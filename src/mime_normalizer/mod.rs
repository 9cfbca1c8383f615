//! Reconstructs a canonical (subject, body, is_html, attachments) tuple from an
//! arbitrary RFC 5322 byte stream, regardless of MIME shape.
//!
//! Mirrors the spirit of mail-laser's old `email_parser` module but walks the
//! actual MIME tree via `mailparse` instead of sniffing HTML tags by line, so
//! that attachments and inline `cid:` parts survive the trip to Graph.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use thiserror::Error;


/// Hard cap on the number of MIME parts walked across the whole tree.
/// Protects against pathological or adversarial multipart nesting.
const MAX_PARTS: usize = 100;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("failed to parse message: {0}")]
    Parse(#[from] mailparse::MailParseError),
    #[error("attachment decode failed: {0}")]
    AttachmentDecode(String),
}

/// A single MIME attachment, in the depth-first encounter order of the
/// original MIME tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    /// Standard (non-URL-safe) base64-encoded content, regardless of the
    /// original transfer encoding.
    pub content_base64: String,
    pub is_inline: bool,
    /// `Content-Id` with surrounding angle brackets stripped, present only
    /// for inline parts referenced via `cid:` in an HTML body.
    pub content_id: Option<String>,
}

/// The canonical shape produced by normalization and consumed once by the
/// Graph submitter.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NormalizedMessage {
    pub subject: String,
    pub body: String,
    pub is_html: bool,
    pub attachments: Vec<Attachment>,
}

struct WalkState {
    count: usize,
    stopped: bool,
    body: Option<String>,
    is_html: bool,
    attachments: Vec<Attachment>,
    strict_attachments: bool,
    error: Option<NormalizeError>,
}

/// Parses a raw RFC 5322 message and reduces it to a `NormalizedMessage`.
///
/// Tolerates malformed messages from legacy clients: multipart walking stops
/// cleanly (rather than erroring or hanging) on a part-count overrun or an
/// unexpected mid-walk condition. The only way this returns `Err` is a
/// top-level parse failure, or a per-attachment decode failure while
/// `strict_attachments` is enabled.
pub fn normalize(raw: &[u8], strict_attachments: bool) -> Result<NormalizedMessage, NormalizeError> {
    let parsed = mailparse::parse_mail(raw)?;
    let subject = parsed.headers.get_first_value("Subject").unwrap_or_default();

    let mut state = WalkState {
        count: 0,
        stopped: false,
        body: None,
        is_html: false,
        attachments: Vec::new(),
        strict_attachments,
        error: None,
    };

    walk(&parsed, &mut state);

    if let Some(err) = state.error {
        return Err(err);
    }

    Ok(NormalizedMessage {
        subject,
        body: state.body.unwrap_or_default(),
        is_html: state.is_html,
        attachments: state.attachments,
    })
}

fn walk(part: &ParsedMail, state: &mut WalkState) {
    if state.stopped {
        return;
    }

    state.count += 1;
    if state.count > MAX_PARTS {
        log::warn!(
            "MIME part cap ({}) exceeded while normalizing message; stopping walk",
            MAX_PARTS
        );
        state.stopped = true;
        return;
    }

    let mimetype = part.ctype.mimetype.to_lowercase();
    if mimetype.starts_with("multipart/") {
        for sub in &part.subparts {
            walk(sub, state);
            if state.stopped {
                return;
            }
        }
        return;
    }

    classify_leaf(part, &mimetype, state);
}

fn classify_leaf(part: &ParsedMail, mimetype: &str, state: &mut WalkState) {
    let disposition = part.get_content_disposition();
    let content_id = part
        .headers
        .get_first_value("Content-Id")
        .as_deref()
        .map(strip_angle_brackets);

    let is_attachment = matches!(disposition.disposition, DispositionType::Attachment);
    let is_inline_attachment =
        matches!(disposition.disposition, DispositionType::Inline) && content_id.is_some();

    if is_attachment || is_inline_attachment {
        handle_attachment(part, mimetype, &disposition.params, content_id, is_inline_attachment, state);
        return;
    }

    match part.get_body_raw() {
        Ok(raw) => {
            let text = String::from_utf8_lossy(&raw).into_owned();
            if mimetype == "text/html" {
                state.body = Some(text);
                state.is_html = true;
            } else if !state.is_html {
                // Last-plain-text-wins, but never clobber an HTML body that
                // was already encountered (HTML wins within
                // multipart/alternative regardless of sibling order).
                state.body = Some(text);
            }
        }
        Err(e) => {
            log::warn!("failed to decode body part ({mimetype}): {e}");
        }
    }
}

fn handle_attachment(
    part: &ParsedMail,
    mimetype: &str,
    disposition_params: &std::collections::HashMap<String, String>,
    content_id: Option<String>,
    is_inline: bool,
    state: &mut WalkState,
) {
    let filename = disposition_params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned())
        .unwrap_or_default();

    // `part.ctype.mimetype` is always populated (mailparse defaults a missing
    // `Content-Type` header to "text/plain"), so the spec's "default to
    // application/octet-stream" only applies when the header itself is
    // absent, not when the defaulted mimetype happens to be empty.
    let content_type = if part.headers.get_first_value("Content-Type").is_none() {
        "application/octet-stream".to_string()
    } else {
        mimetype.to_string()
    };

    let raw = match part.get_body_raw() {
        Ok(raw) => raw,
        Err(e) => {
            if state.strict_attachments {
                state.error = Some(NormalizeError::AttachmentDecode(e.to_string()));
                state.stopped = true;
            } else {
                log::warn!("skipping attachment {filename:?} due to decode error: {e}");
            }
            return;
        }
    };

    if filename.is_empty() || raw.is_empty() {
        log::warn!("dropping attachment with empty filename or content (filename={filename:?})");
        return;
    }

    state.attachments.push(Attachment {
        filename,
        content_type,
        content_base64: BASE64.encode(&raw),
        is_inline,
        content_id,
    });
}

fn strip_angle_brackets(value: &str) -> String {
    value.trim().trim_start_matches('<').trim_end_matches('>').to_string()
}
