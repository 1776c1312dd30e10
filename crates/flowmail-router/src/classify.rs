//! Classifies an inbound message as a reply to a suspended flow or a
//! brand-new request, without touching storage — callers supply the
//! candidate waiting flows so this stays a pure function.

use chrono::{DateTime, Utc};
use flowmail_core::models::{extract_request_id, Flow, FlowStatus};
use flowmail_gateway::InboundMail;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The inbound mail resumes this flow.
    FlowResponse { flow_id: String },
    /// No waiting flow claims it; start a new one.
    NewRequest,
}

fn local_part(email: &str) -> String {
    email.split('@').next().unwrap_or(email).trim().to_lowercase()
}

/// Picks the waiting flow `mail` replies to, or `NewRequest` if none
/// claims it. `candidates` should already be filtered to `status =
/// waiting` flows for the recipient agent; this function does not
/// re-check status itself beyond ignoring non-waiting entries.
pub fn classify_inbound(mail: &InboundMail, candidates: &[Flow], now: DateTime<Utc>) -> RouteOutcome {
    let waiting: Vec<&Flow> = candidates
        .iter()
        .filter(|f| f.status == FlowStatus::Waiting && f.waiting_for.is_some())
        .collect();

    let by_header = waiting.iter().find(|f| {
        let waiting_for = f.waiting_for.as_ref().expect("filtered above");
        mail.in_reply_to
            .iter()
            .chain(mail.references.iter())
            .any(|id| waiting_for.thread_message_ids.iter().any(|t| t == id))
    });

    let candidate = by_header.copied().or_else(|| {
        let request_id = extract_request_id(&mail.subject)?;
        waiting
            .iter()
            .copied()
            .find(|f| f.waiting_for.as_ref().expect("filtered above").request_id == request_id)
    });

    let Some(flow) = candidate else {
        return RouteOutcome::NewRequest;
    };
    let waiting_for = flow.waiting_for.as_ref().expect("filtered above");

    if local_part(&mail.from) != waiting_for.target_agent_username {
        return RouteOutcome::NewRequest;
    }
    if now > waiting_for.expected_by {
        return RouteOutcome::NewRequest;
    }

    RouteOutcome::FlowResponse { flow_id: flow.id.clone() }
}
