//! Outbound delivery. `Transport` abstracts over the real mail
//! gateway and a synthetic in-process loop used when both endpoints
//! are agents on the same deployment.

use async_trait::async_trait;
use flowmail_core::error::{FlowMailError, Result};
use reqwest::Client;
use serde::Serialize;
use std::sync::Mutex;
use tracing::{debug, warn};

#[derive(Clone, Debug, Serialize)]
pub struct OutboundAttachment {
    pub filename: String,
    pub mime_type: String,
    pub content_base64: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct OutboundMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub attachments: Vec<OutboundAttachment>,
}

/// Sends a normalised outbound message and returns the provider's
/// message id for the sent mail.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<String>;
}

/// A Mailgun-shaped HTTP transport: HTTP Basic auth, form-encoded
/// fields, threading headers passed through `h:` prefixed keys.
pub struct HttpGatewayTransport {
    client: Client,
    api_base: String,
    domain: String,
    api_key: String,
}

impl HttpGatewayTransport {
    pub fn new(client: Client, api_base: impl Into<String>, domain: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into(),
            domain: domain.into(),
            api_key: api_key.into(),
        }
    }

    fn send_url(&self) -> String {
        format!("{}/v3/{}/messages", self.api_base.trim_end_matches('/'), self.domain)
    }
}

#[async_trait]
impl Transport for HttpGatewayTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<String> {
        let mut form: Vec<(String, String)> = vec![
            ("from".to_string(), message.from.clone()),
            ("to".to_string(), message.to.clone()),
            ("subject".to_string(), message.subject.clone()),
            ("text".to_string(), message.body.clone()),
            ("o:tracking".to_string(), "no".to_string()),
        ];
        if let Some(in_reply_to) = &message.in_reply_to {
            form.push(("h:In-Reply-To".to_string(), format!("<{in_reply_to}>")));
        }
        if !message.references.is_empty() {
            let joined = message.references.iter().map(|r| format!("<{r}>")).collect::<Vec<_>>().join(" ");
            form.push(("h:References".to_string(), joined));
        }

        let response = self
            .client
            .post(self.send_url())
            .basic_auth("api", Some(&self.api_key))
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "gateway send request failed");
                FlowMailError::SendFailed(e.to_string())
            })?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.map_err(|e| {
            warn!(error = %e, "gateway response was not valid json");
            FlowMailError::SendFailed(e.to_string())
        })?;

        if !status.is_success() {
            let message = body
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("gateway rejected the message")
                .to_string();
            warn!(status = %status, message = %message, "gateway returned an error status");
            return Err(FlowMailError::SendFailed(message));
        }

        let id = body
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| FlowMailError::SendFailed("gateway response missing id".to_string()))?;
        debug!(id, "gateway accepted outbound mail");
        Ok(flowmail_core::models::normalize_message_id(id))
    }
}

/// Delivers directly into an in-process sink instead of a real
/// provider, for agent-to-agent sends within one deployment where a
/// network hop buys nothing.
pub struct LocalTransport {
    delivered: Mutex<Vec<OutboundMessage>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self { delivered: Mutex::new(Vec::new()) }
    }

    pub fn delivered(&self) -> Vec<OutboundMessage> {
        self.delivered.lock().expect("local transport lock poisoned").clone()
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<String> {
        let id = format!("local-{}", nanoid::nanoid!(10));
        debug!(id, to = %message.to, "delivered locally without a network hop");
        self.delivered.lock().expect("local transport lock poisoned").push(message.clone());
        Ok(id)
    }
}
