//! The `Tool` trait and the small argument-extraction helpers every
//! backend tool uses to turn loose JSON into typed values.

use async_trait::async_trait;
use flowmail_core::error::{FlowMailError, Result};
use flowmail_core::models::Agent;
use serde_json::Value;

/// Per-call context a tool executes under. Carries the caller's agent
/// denormalized in (rather than just its id) since every backend that
/// touches mail needs the agent's policy and multi-round config.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub team_id: String,
    pub team_domain: String,
    pub user_id: Option<String>,
    pub agent: Agent,
    pub team_member_emails: Vec<String>,
    /// The email of the flow's original requester, when the call is
    /// happening inside an active flow — lets policy-checked tools
    /// (reply/forward, directory) permit sends back to the requester.
    pub requester_email: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolContentBlock {
    pub content_type: String,
    pub text: String,
}

impl ToolContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ToolContentBlock {
            content_type: "text".to_string(),
            text: text.into(),
        }
    }
}

/// A compact, self-describing result the Decision Engine can feed back
/// to the LLM verbatim as a tool message.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolResult {
    pub is_error: bool,
    pub content: Vec<ToolContentBlock>,
}

impl ToolResult {
    pub fn ok(text: impl Into<String>) -> Self {
        ToolResult {
            is_error: false,
            content: vec![ToolContentBlock::text(text)],
        }
    }

    pub fn ok_json(value: &Value) -> Self {
        ToolResult::ok(value.to_string())
    }

    pub fn error(text: impl Into<String>) -> Self {
        ToolResult {
            is_error: true,
            content: vec![ToolContentBlock::text(text)],
        }
    }

    /// Renders this result as the single string the tool-loop appends
    /// to the conversation as a `tool` message.
    pub fn as_message_text(&self) -> String {
        self.content
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;
    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolResult>;
}

pub fn require_string(args: &Value, field: &str) -> Result<String> {
    args.get(field)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| FlowMailError::ToolError(format!("missing required string field '{field}'")))
}

pub fn optional_string(args: &Value, field: &str) -> Option<String> {
    args.get(field).and_then(|v| v.as_str()).map(|s| s.to_string())
}

pub fn optional_bool(args: &Value, field: &str) -> Option<bool> {
    args.get(field).and_then(|v| v.as_bool())
}

pub fn optional_string_array(args: &Value, field: &str) -> Vec<String> {
    args.get(field)
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(|s| s.to_string())).collect())
        .unwrap_or_default()
}
