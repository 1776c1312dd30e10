//! Agent directory tool: enumerates peer agents in the caller's team,
//! filtered through Mail Policy so the model never sees an agent it
//! isn't permitted to contact.

use async_trait::async_trait;
use flowmail_core::error::Result;
use flowmail_core::models::Agent;
use flowmail_policy::{evaluate_outbound, PolicyContext};
use serde_json::{json, Value};

use crate::base::{Tool, ToolContext, ToolResult};

#[async_trait]
pub trait DirectoryBackend: Send + Sync {
    async fn team_agents(&self, team_id: &str) -> Result<Vec<Agent>>;
}

#[derive(Default, Clone)]
pub struct InMemoryDirectoryBackend {
    pub agents: Vec<Agent>,
}

#[async_trait]
impl DirectoryBackend for InMemoryDirectoryBackend {
    async fn team_agents(&self, team_id: &str) -> Result<Vec<Agent>> {
        Ok(self.agents.iter().filter(|a| a.team_id == team_id).cloned().collect())
    }
}

pub struct DirectoryTool {
    backend: Box<dyn DirectoryBackend>,
}

impl DirectoryTool {
    pub fn new(backend: Box<dyn DirectoryBackend>) -> Self {
        DirectoryTool { backend }
    }
}

#[async_trait]
impl Tool for DirectoryTool {
    fn name(&self) -> &str {
        "list_peer_agents"
    }

    fn description(&self) -> &str {
        "Lists other agents in this team that are permitted to be contacted for delegation."
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, ctx: &ToolContext, _args: Value) -> Result<ToolResult> {
        let peers = self.backend.team_agents(&ctx.team_id).await?;
        let allowed: Vec<Value> = peers
            .into_iter()
            .filter(|peer| peer.id != ctx.agent.id)
            .filter(|peer| {
                let policy_ctx = PolicyContext {
                    other_email: &peer.address(&ctx.team_domain),
                    team_domain: &ctx.team_domain,
                    team_member_emails: &ctx.team_member_emails,
                    requester_email: ctx.requester_email.as_deref(),
                    other_agent_username: Some(&peer.username),
                };
                evaluate_outbound(&ctx.agent, &peer.address(&ctx.team_domain), &policy_ctx).allowed
            })
            .map(|peer| json!({"username": peer.username, "displayName": peer.display_name, "role": peer.role}))
            .collect();
        Ok(ToolResult::ok_json(&json!({"agents": allowed})))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowmail_core::models::{MailPolicy, MultiRoundConfig};

    fn peer(username: &str) -> Agent {
        Agent {
            id: format!("agent-{username}"),
            team_id: "t1".into(),
            username: username.into(),
            display_name: username.into(),
            role: "assistant".into(),
            prompt: "help".into(),
            mcp_server_ids: vec![],
            mail_policy: MailPolicy::Open,
            multi_round_config: MultiRoundConfig::default(),
        }
    }

    fn self_agent(allowed: Vec<&str>) -> Agent {
        Agent {
            id: "self".into(),
            team_id: "t1".into(),
            username: "bot".into(),
            display_name: "Bot".into(),
            role: "assistant".into(),
            prompt: "help".into(),
            mcp_server_ids: vec![],
            mail_policy: MailPolicy::Allowlist { addresses: vec![] },
            multi_round_config: MultiRoundConfig {
                allowed_agent_usernames: allowed.into_iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn lists_only_allowed_peers() {
        let backend = InMemoryDirectoryBackend {
            agents: vec![peer("alice"), peer("bob")],
        };
        let tool = DirectoryTool::new(Box::new(backend));
        let ctx = ToolContext {
            team_id: "t1".into(),
            team_domain: "team.example".into(),
            user_id: None,
            agent: self_agent(vec!["alice"]),
            team_member_emails: vec![],
            requester_email: None,
        };
        let result = tool.execute(&ctx, json!({})).await.unwrap();
        let text = result.as_message_text();
        assert!(text.contains("alice"));
        assert!(!text.contains("bob"));
    }

    #[tokio::test]
    async fn excludes_self_from_listing() {
        let mut self_as_peer = self_agent(vec![]);
        self_as_peer.id = "self".into();
        let backend = InMemoryDirectoryBackend {
            agents: vec![self_as_peer],
        };
        let tool = DirectoryTool::new(Box::new(backend));
        let ctx = ToolContext {
            team_id: "t1".into(),
            team_domain: "team.example".into(),
            user_id: None,
            agent: self_agent(vec![]),
            team_member_emails: vec![],
            requester_email: None,
        };
        let result = tool.execute(&ctx, json!({})).await.unwrap();
        assert_eq!(result.as_message_text(), "{\"agents\":[]}");
    }
}
