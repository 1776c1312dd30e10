//! Reply/forward tool: the one built-in backend that touches the Mail
//! Store and Mail Policy directly, since sending mail on an agent's
//! behalf must be policy-checked exactly like every other outbound
//! send.

use std::sync::Arc;

use async_trait::async_trait;
use flowmail_core::error::{FlowMailError, Result};
use flowmail_core::models::StoredMail;
use flowmail_policy::{evaluate_outbound, PolicyContext};
use flowmail_store::MailStore;
use serde_json::{json, Value};

use crate::base::{optional_string, require_string, Tool, ToolContext, ToolResult};

/// Sends mail on an agent's behalf once the reply/forward tool has
/// policy-checked the recipient. Implemented by the Message Router in
/// production; tests inject a scripted implementation.
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(
        &self,
        ctx: &ToolContext,
        to: &str,
        subject: &str,
        body: &str,
        in_reply_to: Vec<String>,
        references: Vec<String>,
    ) -> Result<String>;
}

pub struct EmailActionTool {
    store: Arc<MailStore>,
    sender: Arc<dyn MailSender>,
}

impl EmailActionTool {
    pub fn new(store: Arc<MailStore>, sender: Arc<dyn MailSender>) -> Self {
        EmailActionTool { store, sender }
    }

    fn recipient_for(action: &str, original: &StoredMail, forward_to: Option<&str>) -> Result<String> {
        match action {
            "reply" => Ok(original.from.clone()),
            "forward" => forward_to
                .map(|s| s.to_string())
                .ok_or_else(|| FlowMailError::ToolError("forward requires a 'forward_to' address".into())),
            other => Err(FlowMailError::ToolError(format!("unknown action '{other}', expected reply or forward"))),
        }
    }
}

#[async_trait]
impl Tool for EmailActionTool {
    fn name(&self) -> &str {
        "reply_or_forward_email"
    }

    fn description(&self) -> &str {
        "Replies to or forwards a previously stored message, subject to mail policy."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message_id": {"type": "string"},
                "action": {"type": "string", "enum": ["reply", "forward"]},
                "body": {"type": "string"},
                "forward_to": {"type": "string"}
            },
            "required": ["message_id", "action", "body"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolResult> {
        let message_id = require_string(&args, "message_id")?;
        let action = require_string(&args, "action")?;
        let body = require_string(&args, "body")?;
        let forward_to = optional_string(&args, "forward_to");

        let original = match self.store.get_by_message_id(&message_id) {
            Ok(entry) => entry,
            Err(FlowMailError::NotFound(_)) => {
                return Ok(ToolResult::error(format!(
                    "cannot reply/forward: message {message_id} is not in the mail store"
                )))
            }
            Err(e) => return Err(e),
        };

        let recipient = match Self::recipient_for(&action, &original, forward_to.as_deref()) {
            Ok(r) => r,
            Err(e) => return Ok(ToolResult::error(e.to_string())),
        };

        let policy_ctx = PolicyContext {
            other_email: &recipient,
            team_domain: &ctx.team_domain,
            team_member_emails: &ctx.team_member_emails,
            requester_email: ctx.requester_email.as_deref(),
            other_agent_username: None,
        };
        let decision = evaluate_outbound(&ctx.agent, &recipient, &policy_ctx);
        if !decision.allowed {
            return Ok(ToolResult::error(format!("policy denied: {}", decision.reason)));
        }

        let subject_prefix = if action == "reply" { "Re: " } else { "Fwd: " };
        let subject = format!("{subject_prefix}{}", original.subject);
        let mut references = original.references.clone();
        references.push(original.message_id.clone());

        let sent_message_id = self
            .sender
            .send(ctx, &recipient, &subject, &body, vec![original.message_id.clone()], references)
            .await?;

        Ok(ToolResult::ok_json(&json!({
            "status": "sent",
            "to": recipient,
            "messageId": sent_message_id
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowmail_core::models::{Agent, MailKind, MailPolicy, MultiRoundConfig};
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct RecordingSender {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MailSender for RecordingSender {
        async fn send(
            &self,
            _ctx: &ToolContext,
            to: &str,
            subject: &str,
            _body: &str,
            _in_reply_to: Vec<String>,
            _references: Vec<String>,
        ) -> Result<String> {
            self.sent.lock().unwrap().push((to.to_string(), subject.to_string()));
            Ok("<sent-1@team.example>".to_string())
        }
    }

    fn ctx(policy: MailPolicy) -> ToolContext {
        ToolContext {
            team_id: "t1".into(),
            team_domain: "team.example".into(),
            user_id: None,
            agent: Agent {
                id: "a1".into(),
                team_id: "t1".into(),
                username: "bot".into(),
                display_name: "Bot".into(),
                role: "assistant".into(),
                prompt: "help".into(),
                mcp_server_ids: vec![],
                mail_policy: policy,
                multi_round_config: MultiRoundConfig::default(),
            },
            team_member_emails: vec![],
            requester_email: None,
        }
    }

    fn seed_original(store: &MailStore) -> StoredMail {
        store
            .store_inbound(StoredMail {
                id: "id-1".into(),
                timestamp: chrono::Utc::now(),
                kind: MailKind::Inbound,
                message_id: "<m1@x>".into(),
                from: "user@acme.example".into(),
                to: "bot@team.example".into(),
                subject: "Hi".into(),
                body: "say hello".into(),
                agent_id: Some("a1".into()),
                conversation_id: String::new(),
                in_reply_to: vec![],
                references: vec![],
                attachments: vec![],
                delivery_confirmed: true,
            })
            .unwrap()
    }

    #[tokio::test]
    async fn replies_to_original_sender() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MailStore::open(dir.path()).unwrap());
        seed_original(&store);
        let sender = Arc::new(RecordingSender { sent: Mutex::new(vec![]) });
        let tool = EmailActionTool::new(store, sender.clone());

        let result = tool
            .execute(&ctx(MailPolicy::Open), json!({"message_id": "m1@x", "action": "reply", "body": "Hello!"}))
            .await
            .unwrap();

        assert!(!result.is_error);
        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent[0].0, "user@acme.example");
        assert_eq!(sent[0].1, "Re: Hi");
    }

    #[tokio::test]
    async fn refuses_unknown_message_id() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MailStore::open(dir.path()).unwrap());
        let sender = Arc::new(RecordingSender { sent: Mutex::new(vec![]) });
        let tool = EmailActionTool::new(store, sender);

        let result = tool
            .execute(&ctx(MailPolicy::Open), json!({"message_id": "ghost@x", "action": "reply", "body": "hi"}))
            .await
            .unwrap();
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn policy_denies_forward_outside_allowlist() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MailStore::open(dir.path()).unwrap());
        seed_original(&store);
        let sender = Arc::new(RecordingSender { sent: Mutex::new(vec![]) });
        let policy = MailPolicy::Allowlist { addresses: vec!["trusted@x.example".into()] };
        let tool = EmailActionTool::new(store, sender.clone());

        let result = tool
            .execute(
                &ctx(policy),
                json!({"message_id": "m1@x", "action": "forward", "forward_to": "outsider@evil.example", "body": "fwd"}),
            )
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(sender.sent.lock().unwrap().is_empty());
    }
}
