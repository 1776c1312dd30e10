//! Read-only resolution of teams, users, memberships, and agents.
//!
//! The identity view is a cached snapshot loaded on demand from the
//! admin-managed identity file (out of scope for this engine — it only
//! reads what another system writes). All string comparisons fold case
//! on local-parts and domains; RFC-conformant mailbox comparison is out
//! of scope.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use flowmail_core::error::{FlowMailError, Result};
use flowmail_core::models::{Agent, Membership, Team, User};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct IdentitySnapshot {
    #[serde(default)]
    pub teams: Vec<Team>,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub memberships: Vec<Membership>,
    #[serde(default)]
    pub agents: Vec<Agent>,
}

/// A cached, read-only view over identity data. Reload on admin
/// mutation (out of scope) by calling [`IdentityView::reload`].
pub struct IdentityView {
    path: PathBuf,
    snapshot: RwLock<IdentitySnapshot>,
}

impl IdentityView {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let snapshot = read_snapshot(&path)?;
        Ok(IdentityView {
            path,
            snapshot: RwLock::new(snapshot),
        })
    }

    pub fn reload(&self) -> Result<()> {
        let snapshot = read_snapshot(&self.path)?;
        *self.snapshot.write().expect("identity snapshot lock poisoned") = snapshot;
        Ok(())
    }

    pub fn team_by_domain(&self, domain: &str) -> Result<Team> {
        let domain = domain.trim().to_lowercase();
        self.snapshot
            .read()
            .expect("identity snapshot lock poisoned")
            .teams
            .iter()
            .find(|t| t.domain == domain)
            .cloned()
            .ok_or_else(|| FlowMailError::NotFound(format!("team with domain {domain}")))
    }

    pub fn user_by_email(&self, email: &str) -> Result<User> {
        let email = email.trim().to_lowercase();
        self.snapshot
            .read()
            .expect("identity snapshot lock poisoned")
            .users
            .iter()
            .find(|u| u.email.to_lowercase() == email)
            .cloned()
            .ok_or_else(|| FlowMailError::NotFound(format!("user with email {email}")))
    }

    pub fn agent_by_username(&self, team_id: &str, username: &str) -> Result<Agent> {
        let username = username.trim().to_lowercase();
        self.snapshot
            .read()
            .expect("identity snapshot lock poisoned")
            .agents
            .iter()
            .find(|a| a.team_id == team_id && a.username == username)
            .cloned()
            .ok_or_else(|| FlowMailError::NotFound(format!("agent {username} in team {team_id}")))
    }

    pub fn agent_by_id(&self, id: &str) -> Result<Agent> {
        self.snapshot
            .read()
            .expect("identity snapshot lock poisoned")
            .agents
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or_else(|| FlowMailError::NotFound(format!("agent {id}")))
    }

    pub fn team_by_id(&self, id: &str) -> Result<Team> {
        self.snapshot
            .read()
            .expect("identity snapshot lock poisoned")
            .teams
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| FlowMailError::NotFound(format!("team {id}")))
    }

    /// All agents belonging to a team, for peer-agent enumeration in the
    /// Decision Engine's prompt (spec §4.6).
    pub fn agents_by_team(&self, team_id: &str) -> Vec<Agent> {
        self.snapshot
            .read()
            .expect("identity snapshot lock poisoned")
            .agents
            .iter()
            .filter(|a| a.team_id == team_id)
            .cloned()
            .collect()
    }

    /// All member emails of a team, for mail-policy `team-only` checks.
    pub fn team_members(&self, team_id: &str) -> Result<Vec<String>> {
        let snapshot = self.snapshot.read().expect("identity snapshot lock poisoned");
        let member_ids: Vec<&str> = snapshot
            .memberships
            .iter()
            .filter(|m| m.team_id == team_id)
            .map(|m| m.user_id.as_str())
            .collect();
        Ok(snapshot
            .users
            .iter()
            .filter(|u| member_ids.contains(&u.id.as_str()))
            .map(|u| u.email.to_lowercase())
            .collect())
    }
}

fn read_snapshot(path: &Path) -> Result<IdentitySnapshot> {
    if !path.exists() {
        return Ok(IdentitySnapshot::default());
    }
    let raw = std::fs::read_to_string(path)?;
    let snapshot: IdentitySnapshot = serde_json::from_str(&raw)?;
    let snapshot = IdentitySnapshot {
        agents: snapshot.agents.into_iter().map(Agent::normalize).collect(),
        ..snapshot
    };
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowmail_core::models::{MailPolicy, MultiRoundConfig};
    use tempfile::tempdir;

    fn write_fixture(dir: &Path) -> PathBuf {
        let path = dir.join("identity.json");
        let snapshot = IdentitySnapshot {
            teams: vec![Team {
                id: "t1".into(),
                name: "Acme".into(),
                domain: "acme.example".into(),
            }],
            users: vec![User {
                id: "u1".into(),
                name: "Alice User".into(),
                email: "alice@acme.example".into(),
            }],
            memberships: vec![Membership {
                user_id: "u1".into(),
                team_id: "t1".into(),
            }],
            agents: vec![Agent {
                id: "a1".into(),
                team_id: "t1".into(),
                username: "Bot".into(),
                display_name: "Bot".into(),
                role: "assistant".into(),
                prompt: "help".into(),
                mcp_server_ids: vec![],
                mail_policy: MailPolicy::Open,
                multi_round_config: MultiRoundConfig::default(),
            }],
        };
        std::fs::write(&path, serde_json::to_string_pretty(&snapshot).unwrap()).unwrap();
        path
    }

    #[test]
    fn resolves_team_by_domain_case_insensitively() {
        let dir = tempdir().unwrap();
        let view = IdentityView::load(write_fixture(dir.path())).unwrap();
        let team = view.team_by_domain("ACME.example").unwrap();
        assert_eq!(team.id, "t1");
    }

    #[test]
    fn agent_username_is_normalized_on_load() {
        let dir = tempdir().unwrap();
        let view = IdentityView::load(write_fixture(dir.path())).unwrap();
        let agent = view.agent_by_username("t1", "bot").unwrap();
        assert_eq!(agent.username, "bot");
    }

    #[test]
    fn unknown_domain_is_not_found() {
        let dir = tempdir().unwrap();
        let view = IdentityView::load(write_fixture(dir.path())).unwrap();
        assert!(matches!(
            view.team_by_domain("nope.example"),
            Err(FlowMailError::NotFound(_))
        ));
    }

    #[test]
    fn team_members_returns_emails() {
        let dir = tempdir().unwrap();
        let view = IdentityView::load(write_fixture(dir.path())).unwrap();
        assert_eq!(view.team_members("t1").unwrap(), vec!["alice@acme.example"]);
    }

    #[test]
    fn missing_file_yields_empty_snapshot() {
        let dir = tempdir().unwrap();
        let view = IdentityView::load(dir.path().join("missing.json")).unwrap();
        assert!(view.team_by_domain("anything").is_err());
    }
}
