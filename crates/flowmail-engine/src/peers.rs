//! Peer agent enumeration for the Decision Engine's prompt: the other
//! agents on the same team an agent may delegate to, already filtered
//! through its own Mail Policy check.

use flowmail_core::models::Agent;
use flowmail_identity::IdentityView;
use flowmail_policy::{evaluate_outbound, PolicyContext};

#[derive(Clone, Debug, PartialEq)]
pub struct PeerAgent {
    pub username: String,
    pub display_name: String,
    pub role: String,
}

/// Agents the given agent could delegate a `wait_for_agent` decision to:
/// same team, not itself, communication enabled, and permitted by its
/// own outbound Mail Policy check against the candidate's address.
pub fn available_peers(agent: &Agent, team_domain: &str, identity: &IdentityView) -> Vec<PeerAgent> {
    if !agent.multi_round_config.can_communicate_with_agents {
        return Vec::new();
    }

    let mut peers: Vec<PeerAgent> = identity
        .agents_by_team(&agent.team_id)
        .into_iter()
        .filter(|other| other.id != agent.id)
        .filter(|other| {
            let address = other.address(team_domain);
            let ctx = PolicyContext {
                other_email: &address,
                team_domain,
                team_member_emails: &[],
                requester_email: None,
                other_agent_username: Some(&other.username),
            };
            evaluate_outbound(agent, &address, &ctx).allowed
        })
        .map(|other| PeerAgent {
            username: other.username,
            display_name: other.display_name,
            role: other.role,
        })
        .collect();

    peers.sort_by(|a, b| a.username.cmp(&b.username));
    peers
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowmail_core::models::{MailPolicy, MultiRoundConfig};
    use tempfile::tempdir;

    fn agent(id: &str, username: &str, can_communicate: bool, allowed: Vec<&str>) -> Agent {
        Agent {
            id: id.into(),
            team_id: "t1".into(),
            username: username.into(),
            display_name: username.to_uppercase(),
            role: "assistant".into(),
            prompt: "help".into(),
            mcp_server_ids: vec![],
            mail_policy: MailPolicy::Open,
            multi_round_config: MultiRoundConfig {
                enabled: true,
                can_communicate_with_agents: can_communicate,
                allowed_agent_usernames: allowed.into_iter().map(String::from).collect(),
                ..Default::default()
            },
        }
    }

    fn identity_with(agents: Vec<Agent>) -> IdentityView {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.json");
        let snapshot = flowmail_identity::IdentitySnapshot {
            teams: vec![],
            users: vec![],
            memberships: vec![],
            agents,
        };
        std::fs::write(&path, serde_json::to_string(&snapshot).unwrap()).unwrap();
        // leak the tempdir so the file outlives this helper
        std::mem::forget(dir);
        IdentityView::load(path).unwrap()
    }

    #[test]
    fn no_peers_without_communication_flag() {
        let alice = agent("a1", "alice", false, vec![]);
        let bob = agent("a2", "bob", true, vec![]);
        let identity = identity_with(vec![alice.clone(), bob]);
        assert!(available_peers(&alice, "team.example", &identity).is_empty());
    }

    #[test]
    fn excludes_self_and_other_teams() {
        let alice = agent("a1", "alice", true, vec![]);
        let bob = agent("a2", "bob", true, vec![]);
        let mut carol = agent("a3", "carol", true, vec![]);
        carol.team_id = "other-team".into();
        let identity = identity_with(vec![alice.clone(), bob, carol]);
        let peers = available_peers(&alice, "team.example", &identity);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].username, "bob");
    }

    #[test]
    fn filters_by_outbound_policy_allowlist() {
        let mut alice = agent("a1", "alice", true, vec!["bob"]);
        alice.mail_policy = MailPolicy::Allowlist { addresses: vec![] };
        let bob = agent("a2", "bob", true, vec![]);
        let carol = agent("a3", "carol", true, vec![]);
        let identity = identity_with(vec![alice.clone(), bob, carol]);
        let peers = available_peers(&alice, "team.example", &identity);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].username, "bob");
    }
}
