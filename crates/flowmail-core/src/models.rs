//! Domain model: agents, teams, mail entries, flows, and decisions.
//!
//! These types are shared by every FlowMail crate; they carry no I/O and
//! no policy logic of their own — just shape and the handful of pure
//! helpers (conversation-id derivation, request-id formatting) that
//! every component needs to agree on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────
// Identity
// ─────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Team {
    pub id: String,
    pub name: String,
    /// Lower-cased, unique.
    pub domain: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Membership {
    pub user_id: String,
    pub team_id: String,
}

/// An agent's mail policy mode. Evaluated identically on send and receive.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum MailPolicy {
    Open,
    TeamOnly,
    Allowlist { addresses: Vec<String> },
}

impl Default for MailPolicy {
    fn default() -> Self {
        MailPolicy::Open
    }
}

/// Multi-round behavior for an agent, including agent-to-agent delegation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MultiRoundConfig {
    pub enabled: bool,
    pub max_rounds: u32,
    pub timeout_minutes: i64,
    pub can_communicate_with_agents: bool,
    pub allowed_agent_usernames: Vec<String>,
}

impl Default for MultiRoundConfig {
    fn default() -> Self {
        MultiRoundConfig {
            enabled: false,
            max_rounds: 10,
            timeout_minutes: 30,
            can_communicate_with_agents: false,
            allowed_agent_usernames: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub team_id: String,
    /// Local-part only; full address is `username@team.domain`.
    pub username: String,
    pub display_name: String,
    pub role: String,
    /// System message for the LLM.
    pub prompt: String,
    pub mcp_server_ids: Vec<String>,
    pub mail_policy: MailPolicy,
    pub multi_round_config: MultiRoundConfig,
}

impl Agent {
    /// Normalises a freshly-loaded or freshly-deserialized agent record,
    /// folding forward any legacy field shapes so the rest of the engine
    /// never has to special-case them. Call once at the load boundary.
    pub fn normalize(mut self) -> Self {
        self.username = self.username.trim().to_lowercase();
        self.multi_round_config.allowed_agent_usernames = self
            .multi_round_config
            .allowed_agent_usernames
            .into_iter()
            .map(|u| u.trim().to_lowercase())
            .collect();
        self
    }

    pub fn address(&self, team_domain: &str) -> String {
        format!("{}@{}", self.username, team_domain)
    }
}

// ─────────────────────────────────────────────
// Mail store entries
// ─────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MailKind {
    Inbound,
    Outbound,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AttachmentDescriptor {
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub datasafe_path: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredMail {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: MailKind,
    /// Globally unique, lower-cased, angle-brackets stripped.
    pub message_id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub agent_id: Option<String>,
    pub conversation_id: String,
    pub in_reply_to: Vec<String>,
    pub references: Vec<String>,
    pub attachments: Vec<AttachmentDescriptor>,
    /// Set false when an outbound entry was persisted before the gateway
    /// confirmed delivery (a send that raced a crash or timeout).
    pub delivery_confirmed: bool,
}

/// Strips surrounding angle brackets and lower-cases a message-id, the
/// normal form used for every store lookup and threading comparison.
pub fn normalize_message_id(raw: &str) -> String {
    raw.trim().trim_start_matches('<').trim_end_matches('>').to_lowercase()
}

// ─────────────────────────────────────────────
// Flow
// ─────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    Running,
    Waiting,
    Completed,
    Failed,
    Expired,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Requester {
    pub name: String,
    pub email: String,
}

/// Snapshot of the inbound email that started a flow.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub message_id: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<AttachmentDescriptor>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WaitingFor {
    pub request_id: String,
    pub target_agent_username: String,
    pub sent_message_id: String,
    pub thread_message_ids: Vec<String>,
    pub expected_by: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct McpCall {
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub result: serde_json::Value,
    pub is_error: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Round {
    pub number: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub decision: Option<Decision>,
    pub mcp_calls: Vec<McpCall>,
    pub messages: Vec<StoredMail>,
}

impl Round {
    pub fn new(number: u32, started_at: DateTime<Utc>) -> Self {
        Round {
            number,
            started_at,
            ended_at: None,
            decision: None,
            mcp_calls: Vec::new(),
            messages: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: String,
    pub agent_id: String,
    pub team_id: String,
    pub user_id: Option<String>,
    pub requester: Requester,
    pub status: FlowStatus,
    pub trigger: Trigger,
    pub current_round: u32,
    pub max_rounds: u32,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub rounds: Vec<Round>,
    pub waiting_for: Option<WaitingFor>,
    pub final_response: Option<String>,
}

impl Flow {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            FlowStatus::Completed | FlowStatus::Failed | FlowStatus::Expired
        )
    }
}

// ─────────────────────────────────────────────
// Decision
// ─────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum DecisionAction {
    Complete {
        final_response: String,
        #[serde(default)]
        attachments: Vec<AttachmentDescriptor>,
    },
    WaitForAgent {
        target_username: String,
        subject: String,
        body: String,
        question: String,
        /// Assigned by the engine, not the model — absent on the raw
        /// model output and filled in once the flow actually suspends.
        #[serde(default)]
        request_id: Option<String>,
    },
    Continue,
    Fail {
        #[serde(default)]
        final_response: Option<String>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub reasoning: String,
    pub confidence: f64,
    #[serde(flatten)]
    pub action: DecisionAction,
}

impl Decision {
    pub fn continue_with(reasoning: impl Into<String>) -> Self {
        Decision {
            reasoning: reasoning.into(),
            confidence: 0.5,
            action: DecisionAction::Continue,
        }
    }

    pub fn fail_with(reasoning: impl Into<String>, final_response: Option<String>) -> Self {
        Decision {
            reasoning: reasoning.into(),
            confidence: 0.0,
            action: DecisionAction::Fail { final_response },
        }
    }

    pub fn complete_with(reasoning: impl Into<String>, final_response: impl Into<String>) -> Self {
        Decision {
            reasoning: reasoning.into(),
            confidence: 1.0,
            action: DecisionAction::Complete {
                final_response: final_response.into(),
                attachments: Vec::new(),
            },
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.action,
            DecisionAction::Complete { .. } | DecisionAction::Fail { .. }
        )
    }
}

/// Subject-embedded request-id token, e.g. `req-V1StGXR8_Z5j`.
pub fn new_request_id() -> String {
    format!("req-{}", nanoid::nanoid!(10))
}

/// Extracts a `req-<id>` token from a subject line formatted as
/// `[Req: req-XXXX] ...`. Returns `None` if no such tag is present.
pub fn extract_request_id(subject: &str) -> Option<String> {
    let start = subject.find("[Req:")?;
    let rest = &subject[start + "[Req:".len()..];
    let end = rest.find(']')?;
    let token = rest[..end].trim();
    if token.starts_with("req-") {
        Some(token.to_string())
    } else {
        None
    }
}

/// Formats the subject for an agent-to-agent send carrying a request id.
pub fn tag_subject_with_request_id(request_id: &str, subject: &str) -> String {
    format!("[Req: {}] {}", request_id, subject)
}
