//! Composes the Microsoft Graph `sendMail` JSON envelope and drives it
//! through the `http_retry::RetryExecutor`.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Method, Request};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::http_retry::{RetryError, RetryExecutor};
use crate::mime_normalizer::NormalizedMessage;


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

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("delivery failed")]
    Delivery,
}

#[derive(Serialize)]
struct SendMailEnvelope<'a> {
    message: Message<'a>,
    #[serde(rename = "saveToSentItems")]
    save_to_sent_items: bool,
}

#[derive(Serialize)]
struct Message<'a> {
    subject: &'a str,
    body: Body<'a>,
    #[serde(rename = "toRecipients")]
    to_recipients: Vec<Recipient<'a>>,
    from: Recipient<'a>,
    attachments: Vec<GraphAttachment<'a>>,
}

#[derive(Serialize)]
struct Body<'a> {
    #[serde(rename = "contentType")]
    content_type: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct Recipient<'a> {
    #[serde(rename = "emailAddress")]
    email_address: EmailAddress<'a>,
}

#[derive(Serialize)]
struct EmailAddress<'a> {
    address: &'a str,
}

#[derive(Serialize)]
struct GraphAttachment<'a> {
    #[serde(rename = "@odata.type")]
    odata_type: &'static str,
    name: &'a str,
    #[serde(rename = "contentType")]
    content_type: &'a str,
    #[serde(rename = "contentBytes")]
    content_bytes: &'a str,
    #[serde(rename = "isInline", skip_serializing_if = "Option::is_none")]
    is_inline: Option<bool>,
    #[serde(rename = "contentId", skip_serializing_if = "Option::is_none")]
    content_id: Option<&'a str>,
}

fn build_envelope<'a>(
    mail_from: &'a str,
    rcpt_to: &'a [String],
    msg: &'a NormalizedMessage,
    save_to_sent: bool,
) -> SendMailEnvelope<'a> {
    let content_type = if msg.is_html { "html" } else { "text" };
    let to_recipients = rcpt_to
        .iter()
        .map(|r| Recipient {
            email_address: EmailAddress { address: r },
        })
        .collect();
    let attachments = msg
        .attachments
        .iter()
        .map(|a| GraphAttachment {
            odata_type: "#microsoft.graph.fileAttachment",
            name: &a.filename,
            content_type: &a.content_type,
            content_bytes: &a.content_base64,
            is_inline: if a.is_inline { Some(true) } else { None },
            content_id: a.content_id.as_deref(),
        })
        .collect();

    SendMailEnvelope {
        message: Message {
            subject: &msg.subject,
            body: Body {
                content_type,
                content: &msg.body,
            },
            to_recipients,
            from: Recipient {
                email_address: EmailAddress { address: mail_from },
            },
            attachments,
        },
        save_to_sent_items: save_to_sent,
    }
}

/// Builds and submits the Graph `sendMail` request for one normalized
/// message, driving retries through `RetryExecutor`.
pub struct Submitter {
    executor: RetryExecutor,
    graph_api_base: String,
}

impl Submitter {
    pub fn new(graph_api_base: String, retry: RetryConfig) -> Self {
        Self {
            executor: RetryExecutor::new(retry),
            graph_api_base,
        }
    }

    pub async fn submit(
        &self,
        cancel: &CancellationToken,
        token: &str,
        mail_from: &str,
        rcpt_to: &[String],
        msg: &NormalizedMessage,
        save_to_sent: bool,
    ) -> Result<(), GraphError> {
        let envelope = build_envelope(mail_from, rcpt_to, msg, save_to_sent);
        let body_bytes = Bytes::from(serde_json::to_vec(&envelope).map_err(|e| {
            log::error!("failed to serialize Graph envelope: {e}");
            GraphError::Delivery
        })?);

        let sender_segment = utf8_percent_encode(mail_from, PATH_SEGMENT).to_string();
        let url = format!("{}/users/{}/sendMail", self.graph_api_base, sender_segment);
        let uri: hyper::Uri = url.parse().map_err(|e| {
            log::error!("invalid Graph sendMail URL {url:?}: {e}");
            GraphError::Delivery
        })?;

        let auth_header = format!("Bearer {token}");

        let result = self
            .executor
            .execute(cancel, || {
                Request::builder()
                    .method(Method::POST)
                    .uri(uri.clone())
                    .header("Authorization", auth_header.clone())
                    .header("Content-Type", "application/json")
                    .body(Full::new(body_bytes.clone()))
                    .expect("well-formed Graph sendMail request")
            })
            .await;

        match result {
            Ok(response) if response.status.is_success() => Ok(()),
            Ok(response) => {
                log::error!(
                    "Graph sendMail rejected permanently: status={} body={}",
                    response.status,
                    String::from_utf8_lossy(&response.body)
                );
                Err(GraphError::Delivery)
            }
            Err(RetryError::Cancelled) => {
                log::warn!("Graph sendMail submission cancelled");
                Err(GraphError::Delivery)
            }
            Err(e) => {
                log::error!("Graph sendMail failed after retries: {e}");
                Err(GraphError::Delivery)
            }
        }
    }
}
