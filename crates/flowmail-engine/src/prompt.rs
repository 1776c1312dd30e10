//! Builds the message list handed to the LLM for one round of decision
//! making: the agent's own system prompt, temporal context, the
//! trigger, a bounded window of prior-round history, the peer agent
//! enumeration, and the JSON decision schema.

use chrono::{DateTime, Duration, Utc};
use flowmail_core::models::{Flow, Team};
use flowmail_core::types::Message;

use crate::peers::PeerAgent;

/// How many prior rounds' worth of conversation to include, mirroring
/// a bounded-history session cap rather than replaying a
/// flow's entire round list into every prompt.
const HISTORY_WINDOW: usize = 5;

fn schema_block(last_chance: bool, has_peers: bool) -> String {
    let mut actions = vec!["\"complete\"", "\"fail\""];
    if !last_chance {
        actions.push("\"continue\"");
        if has_peers {
            actions.push("\"wait_for_agent\"");
        }
    }
    format!(
        "Respond with a single JSON object and nothing else:\n\
         {{\n  \"decision\": one of {},\n  \"reasoning\": \"short internal justification\",\n  \
         \"confidence\": a number between 0 and 1,\n  \
         // when decision is \"complete\": \"final_response\": the text to send back\n  \
         // when decision is \"wait_for_agent\": \"target_agent\", \"subject\", \"body\", \"question\"\n  \
         // when decision is \"fail\": \"final_response\" (optional) explaining what went wrong\n}}",
        actions.join(", ")
    )
}

/// One relative-time phrase, in German or English, resolved against
/// `now` to a concrete calendar date so the model doesn't have to guess
/// what "übermorgen" or "next week" means relative to the request time.
struct RelativeTerm {
    phrase: &'static str,
    offset_days: i64,
}

const RELATIVE_TERMS: &[RelativeTerm] = &[
    RelativeTerm { phrase: "today / heute", offset_days: 0 },
    RelativeTerm { phrase: "tomorrow / morgen", offset_days: 1 },
    RelativeTerm { phrase: "day after tomorrow / übermorgen", offset_days: 2 },
    RelativeTerm { phrase: "next week / nächste Woche", offset_days: 7 },
];

fn temporal_context(now: DateTime<Utc>, deadline: DateTime<Utc>) -> String {
    let remaining = deadline - now;
    let minutes = remaining.num_minutes().max(0);
    let today = now.format("%Y-%m-%d (%A)");
    let tomorrow = (now + Duration::days(1)).format("%Y-%m-%d (%A)");
    let glossary: Vec<String> = RELATIVE_TERMS
        .iter()
        .map(|t| format!("{} = {}", t.phrase, (now + Duration::days(t.offset_days)).format("%Y-%m-%d")))
        .collect();
    format!(
        "Current time: {now} ({today} is today; {tomorrow} is tomorrow). \
         This request must finish by {deadline} ({minutes} minute(s) remaining).\n\
         Relative-time definitions (resolve any mention of these phrases, in either \
         language, to the date shown):\n{terms}",
        now = now.to_rfc3339(),
        deadline = deadline.to_rfc3339(),
        terms = glossary.join("\n"),
    )
}

fn peers_block(peers: &[PeerAgent]) -> String {
    if peers.is_empty() {
        return "No other agents are available to delegate to.".to_string();
    }
    let lines: Vec<String> = peers
        .iter()
        .map(|p| format!("- {} ({}, role: {})", p.username, p.display_name, p.role))
        .collect();
    format!("Agents you may delegate to with wait_for_agent:\n{}", lines.join("\n"))
}

fn history_block(flow: &Flow) -> String {
    let rounds = flow.rounds.iter().rev().take(HISTORY_WINDOW).collect::<Vec<_>>();
    if rounds.is_empty() {
        return String::new();
    }
    let mut lines = Vec::new();
    for round in rounds.into_iter().rev() {
        if let Some(decision) = &round.decision {
            lines.push(format!(
                "Round {}: decision={:?} reasoning={}",
                round.number,
                std::mem::discriminant(&decision.action),
                decision.reasoning
            ));
        }
        for msg in &round.messages {
            lines.push(format!("  [{} -> {}] {}", msg.from, msg.to, msg.body));
        }
    }
    format!("Prior rounds (most recent {} shown):\n{}", HISTORY_WINDOW, lines.join("\n"))
}

pub fn build_decision_messages(
    agent_prompt: &str,
    team: &Team,
    flow: &Flow,
    now: DateTime<Utc>,
    last_chance: bool,
    peers: &[PeerAgent],
) -> Vec<Message> {
    let mut system = String::new();
    system.push_str(agent_prompt);
    system.push_str("\n\n---\n\n");
    system.push_str(&format!("You are acting on behalf of the team \"{}\" ({}).\n", team.name, team.domain));
    system.push_str(&temporal_context(now, flow.deadline));
    system.push_str("\n\n");
    system.push_str(&peers_block(peers));
    if last_chance {
        system.push_str("\n\nThis is the final round available for this request. You must either complete or fail it now.");
    }
    let history = history_block(flow);
    if !history.is_empty() {
        system.push_str("\n\n");
        system.push_str(&history);
    }
    system.push_str("\n\n");
    system.push_str(&schema_block(last_chance, !peers.is_empty()));

    let trigger_message = format!("Subject: {}\n\n{}", flow.trigger.subject, flow.trigger.body);

    vec![Message::system(system), Message::user(trigger_message)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowmail_core::models::{AttachmentDescriptor, FlowStatus, Requester, Trigger};

    fn base_flow() -> Flow {
        Flow {
            id: "flow-1".into(),
            agent_id: "a1".into(),
            team_id: "t1".into(),
            user_id: None,
            requester: Requester { name: "User".into(), email: "user@acme.example".into() },
            status: FlowStatus::Running,
            trigger: Trigger {
                message_id: "m1@x".into(),
                subject: "Book a room".into(),
                body: "please book a room for Friday".into(),
                attachments: Vec::<AttachmentDescriptor>::new(),
            },
            current_round: 0,
            max_rounds: 10,
            started_at: Utc::now(),
            deadline: Utc::now() + Duration::minutes(30),
            rounds: vec![],
            waiting_for: None,
            final_response: None,
        }
    }

    fn team() -> Team {
        Team { id: "t1".into(), name: "Acme".into(), domain: "acme.example".into() }
    }

    #[test]
    fn includes_trigger_and_schema() {
        let flow = base_flow();
        let messages = build_decision_messages("be helpful", &team(), &flow, Utc::now(), false, &[]);
        assert_eq!(messages.len(), 2);
        match &messages[1] {
            Message::User { content } => assert!(content.contains("Book a room")),
            other => panic!("expected user message, got {other:?}"),
        }
        match &messages[0] {
            Message::System { content } => {
                assert!(content.contains("decision"));
                assert!(content.contains("No other agents"));
            }
            other => panic!("expected system message, got {other:?}"),
        }
    }

    #[test]
    fn last_chance_omits_continue_and_wait() {
        let flow = base_flow();
        let messages = build_decision_messages("be helpful", &team(), &flow, Utc::now(), true, &[]);
        match &messages[0] {
            Message::System { content } => {
                assert!(!content.contains("\"continue\""));
                assert!(content.contains("final round"));
            }
            other => panic!("expected system message, got {other:?}"),
        }
    }

    #[test]
    fn temporal_context_includes_relative_glossary() {
        let flow = base_flow();
        let messages = build_decision_messages("be helpful", &team(), &flow, Utc::now(), false, &[]);
        match &messages[0] {
            Message::System { content } => {
                assert!(content.contains("morgen"));
                assert!(content.contains("is today"));
                assert!(content.contains("is tomorrow"));
            }
            other => panic!("expected system message, got {other:?}"),
        }
    }

    #[test]
    fn peers_are_listed_when_present() {
        let flow = base_flow();
        let peers = vec![PeerAgent { username: "bob".into(), display_name: "Bob".into(), role: "scheduler".into() }];
        let messages = build_decision_messages("be helpful", &team(), &flow, Utc::now(), false, &peers);
        match &messages[0] {
            Message::System { content } => assert!(content.contains("bob")),
            other => panic!("expected system message, got {other:?}"),
        }
    }
}
