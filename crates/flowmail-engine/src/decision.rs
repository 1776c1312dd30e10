//! The Decision Engine: turns one round's context into a [`Decision`],
//! either with a single no-tools call or a bounded tool-execution loop.
//! Abstracted behind [`DecisionMaker`] so the Flow Engine
//! can be exercised with a scripted implementation in tests, the same
//! role a pluggable provider interface plays in any agent loop.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowmail_core::models::{AttachmentDescriptor, Decision, DecisionAction, Flow, McpCall, Team};
use flowmail_core::types::{Message, ToolDefinition};
use flowmail_core::utils::truncate_string;
use flowmail_llm::{ChatRequest, LlmProvider, LlmResponse};
use flowmail_tools::{ToolContext, ToolRegistry, DOWNLOAD_TOOL_NAME};
use serde_json::Value;
use tracing::warn;

use crate::peers::PeerAgent;
use crate::prompt::build_decision_messages;

/// Apology sent to the requester when the LLM provider fails twice in a
/// row. Never replaced with the provider's own diagnostic text — that
/// text is for logs only.
const LLM_FAILURE_APOLOGY: &str = "I'm sorry, I wasn't able to process this request due to a system error.";

/// How much of each message's content survives the retry-with-smaller-
/// payload attempt.
const RETRY_SHRINK_CHARS: usize = 2000;

fn shrink_messages(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .map(|m| match m {
            Message::System { content } => Message::System { content: truncate_string(content, RETRY_SHRINK_CHARS) },
            Message::User { content } => Message::User { content: truncate_string(content, RETRY_SHRINK_CHARS) },
            other => other.clone(),
        })
        .collect()
}

/// Everything the Decision Engine needs for one round, assembled by
/// the Flow Engine before delegating here.
pub struct DecisionContext<'a> {
    pub flow: &'a Flow,
    pub team: &'a Team,
    pub agent_prompt: &'a str,
    pub now: DateTime<Utc>,
    pub last_chance: bool,
    pub peers: Vec<PeerAgent>,
    pub tool_ctx: ToolContext,
}

/// Outcome of one round of decision making: the decision itself plus
/// whatever tool calls were made along the way, for the round record.
pub struct DecisionOutcome {
    pub decision: Decision,
    pub mcp_calls: Vec<McpCall>,
}

#[async_trait]
pub trait DecisionMaker: Send + Sync {
    async fn decide(&self, ctx: &DecisionContext<'_>) -> DecisionOutcome;
}

pub struct LlmDecisionMaker {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    model_default: String,
    model_tools: String,
    tool_loop_cap: u32,
}

impl LlmDecisionMaker {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        model_default: impl Into<String>,
        model_tools: impl Into<String>,
        tool_loop_cap: u32,
    ) -> Self {
        LlmDecisionMaker {
            provider,
            tools,
            model_default: model_default.into(),
            model_tools: model_tools.into(),
            tool_loop_cap,
        }
    }
}

#[async_trait]
impl DecisionMaker for LlmDecisionMaker {
    async fn decide(&self, ctx: &DecisionContext<'_>) -> DecisionOutcome {
        let messages = build_decision_messages(
            ctx.agent_prompt,
            ctx.team,
            ctx.flow,
            ctx.now,
            ctx.last_chance,
            &ctx.peers,
        );

        if self.tools.is_empty() {
            let response = self.chat_with_retry(&self.model_default, &messages, None).await;
            if response.is_error {
                return DecisionOutcome {
                    decision: Decision::fail_with("LLM provider failed twice in a row", Some(LLM_FAILURE_APOLOGY.to_string())),
                    mcp_calls: Vec::new(),
                };
            }
            let content = response.content.unwrap_or_default();
            return DecisionOutcome {
                decision: parse_model_decision(&content),
                mcp_calls: Vec::new(),
            };
        }

        self.decide_with_tools(messages, ctx).await
    }
}

impl LlmDecisionMaker {
    /// Calls the provider once; on a transport/provider failure (never a
    /// real model reply), retries exactly once with a shrunk payload per
    /// spec's LLMError handling. Returns whatever the second attempt
    /// produced, error or not — callers decide how to fail from there.
    async fn chat_with_retry(&self, model: &str, messages: &[Message], tools: Option<Vec<ToolDefinition>>) -> LlmResponse {
        let mut request = ChatRequest::new(model, messages.to_vec());
        if let Some(defs) = tools.clone() {
            request = request.with_tools(defs);
        }
        let response = self.provider.chat(request).await;
        if !response.is_error {
            return response;
        }
        warn!("LLM call failed; retrying once with a smaller payload");
        let mut retry_request = ChatRequest::new(model, shrink_messages(messages));
        if let Some(defs) = tools {
            retry_request = retry_request.with_tools(defs);
        }
        self.provider.chat(retry_request).await
    }

    async fn decide_with_tools(&self, mut messages: Vec<Message>, ctx: &DecisionContext<'_>) -> DecisionOutcome {
        let tool_defs = self.tools.get_definitions();
        let mut mcp_calls = Vec::new();
        let mut captured_attachments: Vec<AttachmentDescriptor> = Vec::new();

        for _ in 0..self.tool_loop_cap {
            let response = self.chat_with_retry(&self.model_tools, &messages, Some(tool_defs.clone())).await;

            if response.is_error {
                return DecisionOutcome {
                    decision: Decision::fail_with("LLM provider failed twice in a row", Some(LLM_FAILURE_APOLOGY.to_string())),
                    mcp_calls,
                };
            }

            if response.has_tool_calls() {
                messages.push(Message::assistant_tool_calls(response.tool_calls.clone()));
                for call in &response.tool_calls {
                    let args: Value = serde_json::from_str(&call.function.arguments).unwrap_or(Value::Null);
                    let result = self.tools.execute(&call.function.name, &ctx.tool_ctx, args.clone()).await;
                    let (text, is_error) = match &result {
                        Ok(r) => (r.as_message_text(), r.is_error),
                        Err(e) => (e.to_string(), true),
                    };

                    if call.function.name == DOWNLOAD_TOOL_NAME && !is_error {
                        if let Some(descriptor) = attachment_from_download(&call.function.arguments, &text) {
                            captured_attachments.push(descriptor);
                        }
                    }

                    mcp_calls.push(McpCall {
                        tool_name: call.function.name.clone(),
                        arguments: args,
                        result: Value::String(text.clone()),
                        is_error,
                    });
                    messages.push(Message::tool_result(call.id.clone(), text));
                }
                continue;
            }

            let content = response.content.unwrap_or_default();
            let mut decision = parse_model_decision(&content);
            if let DecisionAction::Complete { attachments, .. } = &mut decision.action {
                attachments.extend(captured_attachments.clone());
                attachments.extend(ctx.flow.trigger.attachments.clone());
            }
            return DecisionOutcome { decision, mcp_calls };
        }

        DecisionOutcome {
            decision: Decision::fail_with(
                "reached the tool-loop iteration cap without a decision",
                Some("I'm sorry, I wasn't able to complete this in time.".to_string()),
            ),
            mcp_calls,
        }
    }
}

fn attachment_from_download(arguments: &str, result_text: &str) -> Option<AttachmentDescriptor> {
    let args: Value = serde_json::from_str(arguments).ok()?;
    let path = args.get("path").and_then(|v| v.as_str())?.to_string();
    let result: Value = serde_json::from_str(result_text).ok()?;
    let mime_type = result.get("mimeType").and_then(|v| v.as_str()).unwrap_or("application/octet-stream").to_string();
    let content_base64 = result.get("contentBase64").and_then(|v| v.as_str()).unwrap_or_default();
    let size = {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(content_base64)
            .map(|b| b.len() as u64)
            .unwrap_or(0)
    };
    let filename = path.rsplit('/').next().unwrap_or(&path).to_string();
    Some(AttachmentDescriptor {
        filename,
        mime_type,
        size,
        datasafe_path: Some(path),
    })
}

/// Parses the model's raw content into a [`Decision`], applying the
/// validation rules: `complete` must carry a
/// non-empty `final_response`; `wait_for_agent` must carry a target
/// and subject/body; confidence is clamped to `[0, 1]`; unrecognised
/// decision kinds and unparsable content both fall back to `continue`
/// with a logged warning, except that unparsable content from the
/// tool-loop path is instead treated as a natural-language `complete`
/// by the caller before this function would even be asked — this
/// function's own fallback for invalid JSON is `continue`.
fn parse_model_decision(content: &str) -> Decision {
    let value: Value = match serde_json::from_str(content) {
        Ok(v) => v,
        Err(_) => {
            warn!("model response was not valid JSON; treating content as a completion");
            return Decision {
                reasoning: "model did not return structured output".to_string(),
                confidence: 0.3,
                action: DecisionAction::Complete {
                    final_response: content.to_string(),
                    attachments: Vec::new(),
                },
            };
        }
    };

    let reasoning = value.get("reasoning").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let confidence = value.get("confidence").and_then(|v| v.as_f64()).unwrap_or(0.5).clamp(0.0, 1.0);
    let kind = value.get("decision").and_then(|v| v.as_str()).unwrap_or("");

    let action = match kind {
        "complete" => match value.get("final_response").and_then(|v| v.as_str()) {
            Some(fr) if !fr.trim().is_empty() => DecisionAction::Complete {
                final_response: fr.to_string(),
                attachments: Vec::new(),
            },
            _ => {
                warn!("complete decision missing final_response; falling back to continue");
                DecisionAction::Continue
            }
        },
        "wait_for_agent" => {
            let target = value
                .get("target_agent")
                .or_else(|| value.get("target_username"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            match target {
                Some(target_username) if !target_username.trim().is_empty() => {
                    let subject = value.get("subject").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    let body = value.get("body").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    let question = value.get("question").and_then(|v| v.as_str()).unwrap_or(&body).to_string();
                    DecisionAction::WaitForAgent {
                        target_username,
                        subject,
                        body,
                        question,
                        request_id: None,
                    }
                }
                _ => {
                    warn!("wait_for_agent decision missing target_agent; falling back to continue");
                    DecisionAction::Continue
                }
            }
        }
        "continue" => DecisionAction::Continue,
        "fail" => DecisionAction::Fail {
            final_response: value.get("final_response").and_then(|v| v.as_str()).map(|s| s.to_string()),
        },
        other => {
            warn!(decision = other, "model returned an unrecognised decision kind; falling back to continue");
            DecisionAction::Continue
        }
    };

    Decision { reasoning, confidence, action }
}
