//! Outbound dispatch: agent-to-agent delegation and agent-to-user
//! replies, both landing in the Mail Store and going out over whatever
//! `Transport` the deployment is configured with.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use flowmail_core::error::{FlowMailError, Result};
use flowmail_core::models::{tag_subject_with_request_id, Agent, MailKind, StoredMail};
use flowmail_gateway::{OutboundMessage, Transport};
use flowmail_policy::{evaluate_outbound, PolicyContext};
use flowmail_store::MailStore;
use flowmail_tools::{MailSender, ToolContext};
use tracing::{debug, warn};

/// Backoff between requester-facing send retries. Doubled each attempt.
const SEND_RETRY_BACKOFF: Duration = Duration::from_millis(250);

pub struct Router {
    store: Arc<MailStore>,
    transport: Arc<dyn Transport>,
}

impl Router {
    pub fn new(store: Arc<MailStore>, transport: Arc<dyn Transport>) -> Self {
        Router { store, transport }
    }

    /// Delegates to another agent on the same team. Requires the sender
    /// to have agent-to-agent communication enabled and, if it carries
    /// an allowlist, the target to be on it.
    pub async fn send_agent_to_agent(
        &self,
        from_agent: &Agent,
        team_domain: &str,
        to_username: &str,
        subject: &str,
        body: &str,
        request_id: &str,
    ) -> Result<String> {
        if !from_agent.multi_round_config.can_communicate_with_agents {
            return Err(FlowMailError::PolicyDenied(format!(
                "{} is not permitted to communicate with other agents",
                from_agent.username
            )));
        }
        let allowed = &from_agent.multi_round_config.allowed_agent_usernames;
        if !allowed.is_empty() && !allowed.iter().any(|u| u == to_username) {
            return Err(FlowMailError::PolicyDenied(format!(
                "{to_username} is not on {}'s allowed agent list",
                from_agent.username
            )));
        }

        let tagged_subject = tag_subject_with_request_id(request_id, subject);
        let to = format!("{to_username}@{team_domain}");
        debug!(from = %from_agent.username, to = %to_username, request_id, "dispatching agent-to-agent mail");
        self.deliver(from_agent, team_domain, &to, &tagged_subject, body, vec![], vec![]).await
    }

    /// Sends a reply to a human, subject to the sender agent's Mail
    /// Policy. `in_reply_to`/`references` should carry the trigger
    /// message's ids so the reply threads correctly.
    pub async fn send_agent_to_user(
        &self,
        from_agent: &Agent,
        team_domain: &str,
        to_email: &str,
        subject: &str,
        body: &str,
        in_reply_to: Vec<String>,
        references: Vec<String>,
        policy_ctx: &PolicyContext<'_>,
    ) -> Result<String> {
        let decision = evaluate_outbound(from_agent, to_email, policy_ctx);
        if !decision.allowed {
            warn!(to = %to_email, reason = %decision.reason, "outbound send denied by mail policy");
            return Err(FlowMailError::PolicyDenied(decision.reason));
        }
        self.deliver(from_agent, team_domain, to_email, subject, body, in_reply_to, references).await
    }

    /// Like `send_agent_to_user`, but a `SendFailed` transport error is
    /// retried twice more with backoff before giving up, per spec's
    /// handling for final-reply sends to a requester. A `PolicyDenied`
    /// is never retried — the policy won't change between attempts.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_agent_to_user_with_retry(
        &self,
        from_agent: &Agent,
        team_domain: &str,
        to_email: &str,
        subject: &str,
        body: &str,
        in_reply_to: Vec<String>,
        references: Vec<String>,
        policy_ctx: &PolicyContext<'_>,
    ) -> Result<String> {
        let mut backoff = SEND_RETRY_BACKOFF;
        let mut attempt = 0u32;
        loop {
            match self
                .send_agent_to_user(from_agent, team_domain, to_email, subject, body, in_reply_to.clone(), references.clone(), policy_ctx)
                .await
            {
                Ok(id) => return Ok(id),
                Err(FlowMailError::SendFailed(reason)) if attempt < 2 => {
                    attempt += 1;
                    warn!(to = %to_email, attempt, reason = %reason, "requester send failed, retrying with backoff");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn deliver(
        &self,
        from_agent: &Agent,
        team_domain: &str,
        to: &str,
        subject: &str,
        body: &str,
        in_reply_to: Vec<String>,
        references: Vec<String>,
    ) -> Result<String> {
        let message = OutboundMessage {
            from: from_agent.address(team_domain),
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            in_reply_to: in_reply_to.first().cloned(),
            references: references.clone(),
            attachments: vec![],
        };

        let send_result = self.transport.send(&message).await;

        let (message_id, delivery_confirmed) = match &send_result {
            Ok(sent_id) => (sent_id.clone(), true),
            Err(_) => (format!("unconfirmed-{}", nanoid::nanoid!(10)), false),
        };

        let stored = StoredMail {
            id: format!("mail-{}", nanoid::nanoid!(10)),
            timestamp: Utc::now(),
            kind: MailKind::Outbound,
            message_id,
            from: message.from,
            to: message.to,
            subject: message.subject,
            body: message.body,
            agent_id: Some(from_agent.id.clone()),
            conversation_id: String::new(),
            in_reply_to,
            references,
            attachments: vec![],
            delivery_confirmed,
        };
        self.store.store_outbound(stored)?;

        send_result
    }
}

/// Wires the reply/forward tool's sends through the same dispatch path.
/// The tool has already run its own policy check on the recipient, so
/// this does not repeat it.
#[async_trait]
impl MailSender for Router {
    async fn send(
        &self,
        ctx: &ToolContext,
        to: &str,
        subject: &str,
        body: &str,
        in_reply_to: Vec<String>,
        references: Vec<String>,
    ) -> Result<String> {
        self.deliver(&ctx.agent, &ctx.team_domain, to, subject, body, in_reply_to, references).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowmail_core::models::{MailPolicy, MultiRoundConfig};
    use flowmail_gateway::LocalTransport;
    use tempfile::tempdir;

    fn agent(can_communicate: bool, allowed: Vec<&str>, policy: MailPolicy) -> Agent {
        Agent {
            id: "a1".into(),
            team_id: "t1".into(),
            username: "alice".into(),
            display_name: "Alice".into(),
            role: "assistant".into(),
            prompt: "help".into(),
            mcp_server_ids: vec![],
            mail_policy: policy,
            multi_round_config: MultiRoundConfig {
                enabled: true,
                can_communicate_with_agents: can_communicate,
                allowed_agent_usernames: allowed.into_iter().map(String::from).collect(),
                ..Default::default()
            },
        }
    }

    fn router() -> Router {
        let dir = tempdir().unwrap();
        let store = Arc::new(MailStore::open(dir.path()).unwrap());
        let transport = Arc::new(LocalTransport::new());
        Router::new(store, transport)
    }

    #[tokio::test]
    async fn agent_to_agent_denied_without_communication_flag() {
        let router = router();
        let from = agent(false, vec![], MailPolicy::Open);
        let err = router
            .send_agent_to_agent(&from, "team.example", "bob", "date?", "what date?", "req-1")
            .await
            .unwrap_err();
        assert!(matches!(err, FlowMailError::PolicyDenied(_)));
    }

    #[tokio::test]
    async fn agent_to_agent_denied_outside_allowlist() {
        let router = router();
        let from = agent(true, vec!["carol"], MailPolicy::Open);
        let err = router
            .send_agent_to_agent(&from, "team.example", "bob", "date?", "what date?", "req-1")
            .await
            .unwrap_err();
        assert!(matches!(err, FlowMailError::PolicyDenied(_)));
    }

    #[tokio::test]
    async fn agent_to_agent_tags_subject_and_persists() {
        let router = router();
        let from = agent(true, vec![], MailPolicy::Open);
        let id = router
            .send_agent_to_agent(&from, "team.example", "bob", "date?", "what date?", "req-abc")
            .await
            .unwrap();
        let stored = router.store.get_by_message_id(&id).unwrap();
        assert_eq!(stored.subject, "[Req: req-abc] date?");
        assert_eq!(stored.to, "bob@team.example");
        assert_eq!(stored.agent_id.as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn agent_to_user_denied_by_team_only_policy() {
        let router = router();
        let from = agent(false, vec![], MailPolicy::TeamOnly);
        let ctx = PolicyContext {
            other_email: "",
            team_domain: "team.example",
            team_member_emails: &[],
            requester_email: None,
            other_agent_username: None,
        };
        let err = router
            .send_agent_to_user(&from, "team.example", "mallory@evil.example", "Re: hi", "hello", vec![], vec![], &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowMailError::PolicyDenied(_)));
    }

    #[tokio::test]
    async fn agent_to_user_threads_reply() {
        let router = router();
        let from = agent(false, vec![], MailPolicy::Open);
        let ctx = PolicyContext {
            other_email: "",
            team_domain: "team.example",
            team_member_emails: &[],
            requester_email: None,
            other_agent_username: None,
        };
        let id = router
            .send_agent_to_user(
                &from,
                "team.example",
                "user@acme.example",
                "Re: hi",
                "hello back",
                vec!["orig@x".into()],
                vec!["orig@x".into()],
                &ctx,
            )
            .await
            .unwrap();
        let stored = router.store.get_by_message_id(&id).unwrap();
        assert_eq!(stored.conversation_id, "orig@x");
    }

    struct FailingTransport;

    #[async_trait]
    impl Transport for FailingTransport {
        async fn send(&self, _message: &OutboundMessage) -> Result<String> {
            Err(FlowMailError::SendFailed("gateway unreachable".into()))
        }
    }

    #[tokio::test]
    async fn failed_send_still_persists_an_unconfirmed_stored_entry() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MailStore::open(dir.path()).unwrap());
        let router = Router::new(store.clone(), Arc::new(FailingTransport));
        let from = agent(true, vec![], MailPolicy::Open);

        let err = router
            .send_agent_to_agent(&from, "team.example", "bob", "date?", "what date?", "req-1")
            .await
            .unwrap_err();
        assert!(matches!(err, FlowMailError::SendFailed(_)));

        let unconfirmed = store.list_unconfirmed();
        assert_eq!(unconfirmed.len(), 1);
        assert_eq!(unconfirmed[0].to, "bob@team.example");
    }

    struct FlakyTransport {
        remaining_failures: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn send(&self, _message: &OutboundMessage) -> Result<String> {
            use std::sync::atomic::Ordering;
            if self.remaining_failures.load(Ordering::SeqCst) > 0 {
                self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
                Err(FlowMailError::SendFailed("gateway timeout".into()))
            } else {
                Ok("msg-ok@gateway".into())
            }
        }
    }

    #[tokio::test]
    async fn send_agent_to_user_with_retry_recovers_after_transient_failures() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MailStore::open(dir.path()).unwrap());
        let transport = Arc::new(FlakyTransport {
            remaining_failures: std::sync::atomic::AtomicU32::new(2),
        });
        let router = Router::new(store, transport);
        let from = agent(false, vec![], MailPolicy::Open);
        let ctx = PolicyContext {
            other_email: "",
            team_domain: "team.example",
            team_member_emails: &[],
            requester_email: None,
            other_agent_username: None,
        };
        let id = router
            .send_agent_to_user_with_retry(&from, "team.example", "user@acme.example", "Re: hi", "done", vec![], vec![], &ctx)
            .await
            .unwrap();
        assert_eq!(id, "msg-ok@gateway");
    }

    #[tokio::test]
    async fn send_agent_to_user_with_retry_gives_up_after_exhausting_attempts() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MailStore::open(dir.path()).unwrap());
        let router = Router::new(store, Arc::new(FailingTransport));
        let from = agent(false, vec![], MailPolicy::Open);
        let ctx = PolicyContext {
            other_email: "",
            team_domain: "team.example",
            team_member_emails: &[],
            requester_email: None,
            other_agent_username: None,
        };
        let err = router
            .send_agent_to_user_with_retry(&from, "team.example", "user@acme.example", "Re: hi", "done", vec![], vec![], &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowMailError::SendFailed(_)));
    }

    #[tokio::test]
    async fn mail_sender_impl_delivers_without_repeating_policy_check() {
        let router = router();
        let from = agent(false, vec![], MailPolicy::Allowlist { addresses: vec![] });
        let ctx = ToolContext {
            team_id: "t1".into(),
            team_domain: "team.example".into(),
            user_id: None,
            agent: from,
            team_member_emails: vec![],
            requester_email: None,
        };
        let id = MailSender::send(&router, &ctx, "anyone@elsewhere.example", "Re: hi", "hi", vec![], vec![])
            .await
            .unwrap();
        assert!(router.store.get_by_message_id(&id).is_ok());
    }
}
