//! Mail policy: the allow/deny rules enforced at every send and every
//! receive. Pure functions, no I/O — callers resolve identity data first
//! and pass in exactly what's needed to decide.

use flowmail_core::models::{Agent, MailPolicy};

/// Everything needed to evaluate one side of a policy check. The same
/// shape serves both directions: for an inbound check, `other_email` is
/// the sender; for an outbound check, it's the recipient.
#[derive(Clone, Debug, Default)]
pub struct PolicyContext<'a> {
    pub other_email: &'a str,
    pub team_domain: &'a str,
    pub team_member_emails: &'a [String],
    /// The current flow's requester email, when evaluating an outbound
    /// send (a reply to the original requester is always permitted
    /// under `allowlist` mode, even if they aren't on the list).
    pub requester_email: Option<&'a str>,
    /// Set when `other_email` belongs to another agent in the same
    /// team, so `allowlist` mode can check `allowedAgentUsernames`.
    pub other_agent_username: Option<&'a str>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: String,
}

impl PolicyDecision {
    fn allow(reason: impl Into<String>) -> Self {
        PolicyDecision {
            allowed: true,
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        PolicyDecision {
            allowed: false,
            reason: reason.into(),
        }
    }
}

fn domain_of(email: &str) -> String {
    email
        .rsplit_once('@')
        .map(|(_, domain)| domain.to_lowercase())
        .unwrap_or_default()
}

fn fold_eq(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

/// Evaluates one side of a policy check against `agent`'s mode. Used
/// identically for inbound and outbound — see [`evaluate_inbound`] and
/// [`evaluate_outbound`] for the direction-specific entry points.
pub fn evaluate(agent: &Agent, ctx: &PolicyContext) -> PolicyDecision {
    match &agent.mail_policy {
        MailPolicy::Open => PolicyDecision::allow("mode=open"),

        MailPolicy::TeamOnly => {
            let other_domain = domain_of(ctx.other_email);
            if other_domain == ctx.team_domain.to_lowercase() {
                return PolicyDecision::allow("team-only: same domain");
            }
            if ctx
                .team_member_emails
                .iter()
                .any(|e| fold_eq(e, ctx.other_email))
            {
                return PolicyDecision::allow("team-only: team member");
            }
            PolicyDecision::deny(format!(
                "team-only: {} is neither on domain {} nor a team member",
                ctx.other_email, ctx.team_domain
            ))
        }

        MailPolicy::Allowlist { addresses } => {
            if addresses.iter().any(|a| fold_eq(a, ctx.other_email)) {
                return PolicyDecision::allow("allowlist: explicit address");
            }
            if let Some(requester) = ctx.requester_email {
                if fold_eq(requester, ctx.other_email) {
                    return PolicyDecision::allow("allowlist: original requester");
                }
            }
            if let Some(username) = ctx.other_agent_username {
                if agent
                    .multi_round_config
                    .allowed_agent_usernames
                    .iter()
                    .any(|u| fold_eq(u, username))
                {
                    return PolicyDecision::allow("allowlist: permitted peer agent");
                }
            }
            PolicyDecision::deny(format!(
                "allowlist: {} is not on the allowlist, the requester, or a permitted peer agent",
                ctx.other_email
            ))
        }
    }
}

pub fn evaluate_inbound(agent: &Agent, sender_email: &str, ctx: &PolicyContext) -> PolicyDecision {
    evaluate(
        agent,
        &PolicyContext {
            other_email: sender_email,
            ..ctx.clone()
        },
    )
}

pub fn evaluate_outbound(
    agent: &Agent,
    recipient_email: &str,
    ctx: &PolicyContext,
) -> PolicyDecision {
    evaluate(
        agent,
        &PolicyContext {
            other_email: recipient_email,
            ..ctx.clone()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowmail_core::models::MultiRoundConfig;
    use proptest::prelude::*;

    fn agent_with(policy: MailPolicy) -> Agent {
        Agent {
            id: "a1".into(),
            team_id: "t1".into(),
            username: "bot".into(),
            display_name: "Bot".into(),
            role: "assistant".into(),
            prompt: "help".into(),
            mcp_server_ids: vec![],
            mail_policy: policy,
            multi_round_config: MultiRoundConfig {
                allowed_agent_usernames: vec!["bob".into()],
                ..Default::default()
            },
        }
    }

    #[test]
    fn open_mode_always_allows() {
        let agent = agent_with(MailPolicy::Open);
        let ctx = PolicyContext {
            other_email: "anyone@elsewhere.example",
            team_domain: "team.example",
            team_member_emails: &[],
            requester_email: None,
            other_agent_username: None,
        };
        assert!(evaluate_inbound(&agent, ctx.other_email, &ctx).allowed);
    }

    #[test]
    fn team_only_allows_same_domain() {
        let agent = agent_with(MailPolicy::TeamOnly);
        let ctx = PolicyContext {
            other_email: "alice@team.example",
            team_domain: "team.example",
            team_member_emails: &[],
            requester_email: None,
            other_agent_username: None,
        };
        assert!(evaluate_inbound(&agent, ctx.other_email, &ctx).allowed);
    }

    #[test]
    fn team_only_denies_outside_domain_non_member() {
        let agent = agent_with(MailPolicy::TeamOnly);
        let member_emails = vec!["carol@team.example".to_string()];
        let ctx = PolicyContext {
            other_email: "mallory@evil.example",
            team_domain: "team.example",
            team_member_emails: &member_emails,
            requester_email: None,
            other_agent_username: None,
        };
        let decision = evaluate_outbound(&agent, ctx.other_email, &ctx);
        assert!(!decision.allowed);
        assert!(decision.reason.contains("team-only"));
    }

    #[test]
    fn team_only_allows_non_domain_member() {
        let agent = agent_with(MailPolicy::TeamOnly);
        let member_emails = vec!["carol@other.example".to_string()];
        let ctx = PolicyContext {
            other_email: "carol@other.example",
            team_domain: "team.example",
            team_member_emails: &member_emails,
            requester_email: None,
            other_agent_username: None,
        };
        assert!(evaluate_inbound(&agent, ctx.other_email, &ctx).allowed);
    }

    #[test]
    fn allowlist_permits_requester_even_if_unlisted() {
        let agent = agent_with(MailPolicy::Allowlist {
            addresses: vec!["trusted@x.example".into()],
        });
        let ctx = PolicyContext {
            other_email: "requester@x.example",
            team_domain: "team.example",
            team_member_emails: &[],
            requester_email: Some("requester@x.example"),
            other_agent_username: None,
        };
        assert!(evaluate_outbound(&agent, ctx.other_email, &ctx).allowed);
    }

    #[test]
    fn allowlist_permits_configured_peer_agent() {
        let agent = agent_with(MailPolicy::Allowlist { addresses: vec![] });
        let ctx = PolicyContext {
            other_email: "bob@team.example",
            team_domain: "team.example",
            team_member_emails: &[],
            requester_email: None,
            other_agent_username: Some("bob"),
        };
        assert!(evaluate_outbound(&agent, ctx.other_email, &ctx).allowed);
    }

    #[test]
    fn allowlist_denies_unrelated_peer_agent() {
        let agent = agent_with(MailPolicy::Allowlist { addresses: vec![] });
        let ctx = PolicyContext {
            other_email: "eve@team.example",
            team_domain: "team.example",
            team_member_emails: &[],
            requester_email: None,
            other_agent_username: Some("eve"),
        };
        assert!(!evaluate_outbound(&agent, ctx.other_email, &ctx).allowed);
    }

    proptest! {
        #[test]
        fn evaluate_is_idempotent(email in "[a-z]{1,10}@[a-z]{1,10}\\.example") {
            let agent = agent_with(MailPolicy::TeamOnly);
            let ctx = PolicyContext {
                other_email: &email,
                team_domain: "team.example",
                team_member_emails: &[],
                requester_email: None,
                other_agent_username: None,
            };
            let first = evaluate(&agent, &ctx);
            let second = evaluate(&agent, &ctx);
            prop_assert_eq!(first, second);
        }
    }
}
