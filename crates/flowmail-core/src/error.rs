//! Error types for FlowMail.
//!
//! One variant per failure kind the engine needs to distinguish
//! (`DuplicateMessageId`, `NotFound`, `PolicyDenied`, `FlowBusy`,
//! `Expired`, `LlmError`/`ToolError`, `SendFailed`, `InvariantViolation`)
//! so callers can match on the kind instead of parsing strings.

use thiserror::Error;

/// Result type alias used across FlowMail library crates.
pub type Result<T> = std::result::Result<T, FlowMailError>;

#[derive(Debug, Error)]
pub enum FlowMailError {
    #[error("duplicate message id: {0}")]
    DuplicateMessageId(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("policy denied: {0}")]
    PolicyDenied(String),

    #[error("flow busy: {0}")]
    FlowBusy(String),

    #[error("flow expired: {0}")]
    Expired(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("tool error: {0}")]
    ToolError(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlowMailError {
    /// Whether this error is an expected, recoverable outcome of routing
    /// or evaluating inbound mail rather than a system fault — callers at
    /// the webhook boundary still answer `200 {ok:true}` for these so a
    /// retrying gateway doesn't see a failure and redeliver the same mail.
    pub fn is_webhook_swallowable(&self) -> bool {
        matches!(
            self,
            FlowMailError::DuplicateMessageId(_)
                | FlowMailError::NotFound(_)
                | FlowMailError::PolicyDenied(_)
                | FlowMailError::FlowBusy(_)
                | FlowMailError::Expired(_)
        )
    }
}
