//! Normalises a provider-shaped inbound payload into a single tagged
//! struct. This is the only place in the workspace that ever looks at
//! the raw, casing- and synonym-tolerant map the gateway sends us.

use flowmail_core::error::{FlowMailError, Result};
use flowmail_core::models::{normalize_message_id, AttachmentDescriptor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InboundAttachment {
    pub filename: String,
    pub mime_type: String,
    pub content_base64: String,
}

impl From<&InboundAttachment> for AttachmentDescriptor {
    fn from(a: &InboundAttachment) -> Self {
        AttachmentDescriptor {
            filename: a.filename.clone(),
            mime_type: a.mime_type.clone(),
            size: base64_decoded_len(&a.content_base64),
            datasafe_path: None,
        }
    }
}

fn base64_decoded_len(b64: &str) -> u64 {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map(|bytes| bytes.len() as u64)
        .unwrap_or(0)
}

/// The single normalised shape every downstream component consumes.
/// Raw `serde_json::Value`/form maps never cross this boundary.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InboundMail {
    pub message_id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub html: Option<String>,
    pub in_reply_to: Vec<String>,
    pub references: Vec<String>,
    pub attachments: Vec<InboundAttachment>,
}

const MESSAGE_ID_KEYS: &[&str] = &["messageId", "message-id", "Message-Id", "message_id"];
const FROM_KEYS: &[&str] = &["from", "sender", "From"];
const TO_KEYS: &[&str] = &["to", "recipient", "recipients", "To"];
const SUBJECT_KEYS: &[&str] = &["subject", "Subject"];
const BODY_KEYS: &[&str] = &["stripped-text", "text", "body-plain", "body"];
const HTML_KEYS: &[&str] = &["stripped-html", "html"];
const IN_REPLY_TO_KEYS: &[&str] = &["In-Reply-To", "in-reply-to", "inReplyTo"];
const REFERENCES_KEYS: &[&str] = &["References", "references"];

fn get_str(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(v) = map.get(*key) {
            if let Some(s) = v.as_str() {
                if !s.trim().is_empty() {
                    return Some(s.to_string());
                }
            }
        }
    }
    None
}

/// Splits `In-Reply-To`/`References` header text on whitespace and
/// angle-bracket groups, normalising every extracted id.
pub fn parse_thread_ids(raw: &str) -> Vec<String> {
    raw.split_whitespace()
        .map(normalize_message_id)
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_attachments(map: &Map<String, Value>) -> Vec<InboundAttachment> {
    if let Some(Value::Array(items)) = map.get("attachments") {
        return items
            .iter()
            .filter_map(|item| {
                let item = item.as_object()?;
                Some(InboundAttachment {
                    filename: get_str(item, &["filename", "name"])?,
                    mime_type: get_str(item, &["mimeType", "mime-type", "contentType"]).unwrap_or_else(|| "application/octet-stream".to_string()),
                    content_base64: get_str(item, &["content", "contentBase64", "data"])?,
                })
            })
            .collect();
    }

    let count: usize = map
        .get("attachment-count")
        .and_then(|v| v.as_str().and_then(|s| s.parse().ok()).or_else(|| v.as_u64().map(|n| n as usize)))
        .unwrap_or(0);
    (1..=count)
        .filter_map(|i| {
            let key = format!("attachment-{i}");
            let obj = map.get(&key)?.as_object()?;
            Some(InboundAttachment {
                filename: get_str(obj, &["filename", "name"])?,
                mime_type: get_str(obj, &["mimeType", "mime-type", "contentType"]).unwrap_or_else(|| "application/octet-stream".to_string()),
                content_base64: get_str(obj, &["content", "contentBase64", "data"])?,
            })
        })
        .collect()
}

/// Parses a raw provider payload (already decoded from JSON, form, or
/// multipart into a flat object) into the normalised shape.
pub fn parse_inbound(raw: &Value) -> Result<InboundMail> {
    let map = raw
        .as_object()
        .ok_or_else(|| FlowMailError::ToolError("inbound payload is not an object".to_string()))?;

    let message_id = get_str(map, MESSAGE_ID_KEYS)
        .ok_or_else(|| FlowMailError::InvariantViolation("inbound payload missing a message id".to_string()))?;
    let from = get_str(map, FROM_KEYS)
        .ok_or_else(|| FlowMailError::InvariantViolation("inbound payload missing a from address".to_string()))?;
    let to = get_str(map, TO_KEYS)
        .ok_or_else(|| FlowMailError::InvariantViolation("inbound payload missing a to address".to_string()))?;
    let subject = get_str(map, SUBJECT_KEYS).unwrap_or_default();
    let body = get_str(map, BODY_KEYS).unwrap_or_default();
    let html = get_str(map, HTML_KEYS);

    let in_reply_to = get_str(map, IN_REPLY_TO_KEYS).map(|s| parse_thread_ids(&s)).unwrap_or_default();
    let references = get_str(map, REFERENCES_KEYS).map(|s| parse_thread_ids(&s)).unwrap_or_default();
    let attachments = parse_attachments(map);

    Ok(InboundMail {
        message_id: normalize_message_id(&message_id),
        from,
        to,
        subject,
        body,
        html,
        in_reply_to,
        references,
        attachments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_canonical_json_payload() {
        let raw = json!({
            "messageId": "<m1@x>",
            "from": "user@acme.example",
            "to": "bot@team.example",
            "subject": "Hi",
            "stripped-text": "say hello",
            "In-Reply-To": "<ancestor@x>"
        });
        let mail = parse_inbound(&raw).unwrap();
        assert_eq!(mail.message_id, "m1@x");
        assert_eq!(mail.body, "say hello");
        assert_eq!(mail.in_reply_to, vec!["ancestor@x"]);
    }

    #[test]
    fn tolerates_synonym_casing() {
        let raw = json!({
            "Message-Id": "<m2@x>",
            "sender": "user@acme.example",
            "recipient": "bot@team.example",
            "body-plain": "fallback body"
        });
        let mail = parse_inbound(&raw).unwrap();
        assert_eq!(mail.from, "user@acme.example");
        assert_eq!(mail.body, "fallback body");
    }

    #[test]
    fn prefers_stripped_text_over_body_plain() {
        let raw = json!({
            "messageId": "<m3@x>",
            "from": "a@x.com",
            "to": "b@x.com",
            "stripped-text": "stripped",
            "body-plain": "plain"
        });
        let mail = parse_inbound(&raw).unwrap();
        assert_eq!(mail.body, "stripped");
    }

    #[test]
    fn parses_numbered_attachments() {
        let raw = json!({
            "messageId": "<m4@x>",
            "from": "a@x.com",
            "to": "b@x.com",
            "attachment-count": "2",
            "attachment-1": {"filename": "a.pdf", "mimeType": "application/pdf", "content": "YQ=="},
            "attachment-2": {"filename": "b.png", "mimeType": "image/png", "content": "Yg=="}
        });
        let mail = parse_inbound(&raw).unwrap();
        assert_eq!(mail.attachments.len(), 2);
        assert_eq!(mail.attachments[0].filename, "a.pdf");
    }

    #[test]
    fn missing_message_id_is_invariant_violation() {
        let raw = json!({"from": "a@x.com", "to": "b@x.com"});
        let err = parse_inbound(&raw).unwrap_err();
        assert!(matches!(err, FlowMailError::InvariantViolation(_)));
    }

    #[test]
    fn parse_thread_ids_splits_and_normalizes() {
        let ids = parse_thread_ids("<a@x> <B@Y>  <c@z>");
        assert_eq!(ids, vec!["a@x", "b@y", "c@z"]);
    }
}
