//! The LLM half of the Decision Engine's external interface: an
//! OpenAI-compatible chat-completions client behind a small trait so the
//! Decision Engine never depends on `reqwest` directly.

use async_trait::async_trait;
use flowmail_core::types::{ChatCompletionRequest, ChatCompletionResponse, LlmResponse, Message, ToolDefinition};
use tracing::{debug, warn};

/// One chat-completions call: model, conversation so far, and the
/// tools available this round (empty when the engine is in its
/// no-tools path).
#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Option<Vec<ToolDefinition>>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        ChatRequest {
            model: model.into(),
            messages,
            tools: None,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = Some(tools);
        self
    }
}

/// Abstraction over "call an LLM and get a response back", so
/// `flowmail-engine` can be exercised with a scripted implementation in
/// tests instead of real network.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> LlmResponse;
}

pub struct HttpLlmProvider {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
}

impl HttpLlmProvider {
    pub fn new(api_base: impl Into<String>, api_key: Option<String>) -> Self {
        HttpLlmProvider {
            client: reqwest::Client::new(),
            api_base: api_base.into(),
            api_key,
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_base.trim_end_matches('/'))
    }
}

#[async_trait]
impl LlmProvider for HttpLlmProvider {
    async fn chat(&self, request: ChatRequest) -> LlmResponse {
        let body = ChatCompletionRequest {
            model: request.model.clone(),
            messages: request.messages,
            tools: request.tools,
            tool_choice: None,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let mut req = self.client.post(self.completions_url()).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "LLM request failed to send");
                return LlmResponse::error(format!("LLM request failed: {e}"));
            }
        };

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            warn!(%status, body = %text, "LLM endpoint returned an error status");
            return LlmResponse::error(format!("LLM endpoint returned {status}: {text}"));
        }

        match resp.json::<ChatCompletionResponse>().await {
            Ok(parsed) => {
                debug!(model = %request.model, "received LLM response");
                parsed.into()
            }
            Err(e) => {
                warn!(error = %e, "failed to parse LLM response body");
                LlmResponse::error(format!("failed to parse LLM response: {e}"))
            }
        }
    }
}
