//! The single inbound webhook entry point (§4.9). Normalises whatever
//! shape the gateway POSTed into one JSON map, hands it to the gateway
//! adapter for field extraction, then delegates to identity lookup,
//! mail policy, routing, and the Flow Engine. Always answers `200`, even
//! on internal errors, so a retrying gateway never sees a failure and
//! redelivers the same message.

use std::sync::Arc;

use axum::async_trait;
use axum::extract::{FromRequest, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use flowmail_core::models::{AttachmentDescriptor, StoredMail, Trigger};
use flowmail_gateway::inbound::{parse_inbound, InboundMail};
use flowmail_router::RouteOutcome;

use crate::wiring::Components;

/// Extracts a flat JSON object from a request body regardless of
/// whether the gateway sent JSON, form-urlencoded, or multipart — the
/// rest of the handler only ever sees [`serde_json::Value`].
pub struct RawPayload(pub Value);

#[async_trait]
impl<S: Send + Sync> FromRequest<S> for RawPayload {
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("multipart/form-data") {
            let mut multipart = axum::extract::Multipart::from_request(req, state)
                .await
                .map_err(IntoResponse::into_response)?;
            let mut map = Map::new();
            let mut attachment_count = 0usize;
            while let Ok(Some(field)) = multipart.next_field().await {
                let Some(name) = field.name().map(|s| s.to_string()) else { continue };
                let filename = field.file_name().map(|s| s.to_string());
                let mime = field.content_type().map(|s| s.to_string());
                let bytes = field.bytes().await.unwrap_or_default();
                if let Some(filename) = filename {
                    attachment_count += 1;
                    let key = format!("attachment-{attachment_count}");
                    let b64 = {
                        use base64::Engine;
                        base64::engine::general_purpose::STANDARD.encode(&bytes)
                    };
                    map.insert(
                        key,
                        json!({
                            "filename": filename,
                            "mimeType": mime.unwrap_or_else(|| "application/octet-stream".to_string()),
                            "content": b64,
                        }),
                    );
                } else if let Ok(text) = String::from_utf8(bytes.to_vec()) {
                    map.insert(name, Value::String(text));
                }
            }
            map.insert("attachment-count".to_string(), json!(attachment_count.to_string()));
            return Ok(RawPayload(Value::Object(map)));
        }

        if content_type.starts_with("application/x-www-form-urlencoded") {
            let bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
                .await
                .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()).into_response())?;
            let map: Map<String, Value> = form_urlencoded::parse(&bytes)
                .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
                .collect();
            return Ok(RawPayload(Value::Object(map)));
        }

        // Default: JSON.
        let Json(value) = Json::<Value>::from_request(req, state)
            .await
            .map_err(IntoResponse::into_response)?;
        Ok(RawPayload(value))
    }
}

/// Constant-time comparison of the inbound token against the
/// configured secret. Absence of configuration disables the check —
/// per §9's REDESIGN FLAGS, the check stays opt-in for gateway
/// compatibility rather than rejecting unauthenticated webhooks outright.
fn token_ok(configured: &Option<String>, headers: &HeaderMap, payload: &Value) -> bool {
    let Some(expected) = configured else { return true };
    let supplied = headers
        .get("X-Inbound-Token")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .or_else(|| payload.get("token").and_then(|v| v.as_str()).map(|s| s.to_string()));
    match supplied {
        Some(token) => constant_time_eq(token.as_bytes(), expected.as_bytes()),
        None => false,
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn local_part(email: &str) -> String {
    email.split('@').next().unwrap_or(email).trim().to_lowercase()
}

fn domain_of(email: &str) -> String {
    email.rsplit_once('@').map(|(_, d)| d.to_lowercase()).unwrap_or_default()
}

fn ok_response(extra: Option<&str>) -> Response {
    let body = match extra {
        Some(msg) => json!({"ok": true, "error": msg}),
        None => json!({"ok": true}),
    };
    (StatusCode::OK, Json(body)).into_response()
}

fn to_stored(mail: &InboundMail, agent_id: Option<String>) -> StoredMail {
    StoredMail {
        id: format!("mail-{}", nanoid::nanoid!(12)),
        timestamp: Utc::now(),
        kind: flowmail_core::models::MailKind::Inbound,
        message_id: mail.message_id.clone(),
        from: mail.from.clone(),
        to: mail.to.clone(),
        subject: mail.subject.clone(),
        body: mail.body.clone(),
        agent_id,
        conversation_id: String::new(),
        in_reply_to: mail.in_reply_to.clone(),
        references: mail.references.clone(),
        attachments: mail.attachments.iter().map(AttachmentDescriptor::from).collect(),
        delivery_confirmed: true,
    }
}

pub async fn inbound_webhook(State(state): State<Arc<Components>>, headers: HeaderMap, RawPayload(raw): RawPayload) -> Response {
    let mail = match parse_inbound(&raw) {
        Ok(mail) => mail,
        Err(e) => {
            warn!(error = %e, "rejecting malformed inbound payload");
            return ok_response(Some(&e.to_string()));
        }
    };

    if !token_ok(&state.config.gateway.inbound_token, &headers, &raw) {
        warn!(message_id = %mail.message_id, "inbound token mismatch");
        // §9: auth failures still answer {ok:true} for gateway compatibility.
        return ok_response(Some("unauthorized"));
    }

    let team_domain = domain_of(&mail.to);
    let team = match state.identity.team_by_domain(&team_domain) {
        Ok(team) => team,
        Err(e) => {
            warn!(error = %e, to = %mail.to, "no team for inbound recipient domain");
            return ok_response(Some(&e.to_string()));
        }
    };
    let agent = match state.identity.agent_by_username(&team.id, &local_part(&mail.to)) {
        Ok(agent) => agent,
        Err(e) => {
            warn!(error = %e, to = %mail.to, "no agent for inbound recipient");
            return ok_response(Some(&e.to_string()));
        }
    };

    let entry = to_stored(&mail, Some(agent.id.clone()));
    let stored = match state.mail.store_inbound(entry) {
        Ok(stored) => stored,
        Err(e) if matches!(e, flowmail_core::error::FlowMailError::DuplicateMessageId(_)) => {
            info!(message_id = %mail.message_id, "duplicate inbound delivery, ignoring");
            return ok_response(None);
        }
        Err(e) => {
            warn!(error = %e, "failed to store inbound mail");
            return ok_response(Some(&e.to_string()));
        }
    };

    let team_members = state.identity.team_members(&team.id).unwrap_or_default();
    let policy_ctx = flowmail_policy::PolicyContext {
        other_email: &mail.from,
        team_domain: &team.domain,
        team_member_emails: &team_members,
        requester_email: None,
        other_agent_username: None,
    };
    let decision = flowmail_policy::evaluate_inbound(&agent, &mail.from, &policy_ctx);
    if !decision.allowed {
        info!(from = %mail.from, reason = %decision.reason, "inbound mail denied by policy, dropping");
        return ok_response(None);
    }

    let waiting = state.flows.list_waiting_for_agent(&agent.id);
    let outcome = flowmail_router::classify_inbound(&mail, &waiting, Utc::now());

    match outcome {
        RouteOutcome::FlowResponse { flow_id } => {
            match state.engine.resume_flow(&flow_id, stored).await {
                Ok(_) => {}
                Err(flowmail_core::error::FlowMailError::FlowBusy(_)) => {
                    info!(flow_id = %flow_id, "flow busy, leaving delivery for the next retry");
                }
                Err(e) => warn!(flow_id = %flow_id, error = %e, "resume failed"),
            }
            ok_response(None)
        }
        RouteOutcome::NewRequest => {
            let trigger = Trigger {
                message_id: mail.message_id.clone(),
                subject: mail.subject.clone(),
                body: mail.body.clone(),
                attachments: mail.attachments.iter().map(AttachmentDescriptor::from).collect(),
            };
            let delegating = find_delegating_flow(&state, &mail.subject, &mail.from, &agent.id);
            match state.engine.start_flow(&agent, &team, trigger, &mail.from, delegating.as_ref()) {
                Ok(flow) => {
                    if let Err(e) = state.engine.execute_round(&flow.id).await {
                        warn!(flow_id = %flow.id, error = %e, "first round failed");
                    }
                }
                Err(e) => warn!(error = %e, "failed to start flow"),
            }
            ok_response(None)
        }
    }
}

/// Looks up the delegating flow a reply's `[Req: ...]` tag points at, so
/// a brand-new flow for the *recipient* agent can inherit the original
/// human requester instead of treating the sending agent as the asker.
fn find_delegating_flow(
    state: &Components,
    subject: &str,
    from_email: &str,
    _recipient_agent_id: &str,
) -> Option<flowmail_core::models::Flow> {
    let request_id = flowmail_core::models::extract_request_id(subject)?;
    let sender_username = local_part(from_email);
    // The delegating flow is owned by the sender (it sent the
    // agent-to-agent question and is the one waiting on this reply).
    let sender_agent = state
        .identity
        .agent_by_username(state.identity.team_by_domain(&domain_of(from_email)).ok()?.id.as_str(), &sender_username)
        .ok()?;
    state
        .flows
        .list_by_agent(&sender_agent.id, None)
        .into_iter()
        .find(|f| f.waiting_for.as_ref().map(|w| w.request_id.as_str()) == Some(request_id.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flowmail_core::config::Config;
    use flowmail_core::models::{Agent, Decision, MailPolicy, Membership, MultiRoundConfig, Team, User};
    use flowmail_engine::{DecisionContext, DecisionMaker, DecisionOutcome, FlowEngine, FlowStore};
    use flowmail_gateway::LocalTransport;
    use flowmail_identity::{IdentitySnapshot, IdentityView};
    use flowmail_router::Router;
    use flowmail_store::MailStore;
    use flowmail_tools::ToolRegistry;
    use serde_json::json;
    use tempfile::tempdir;

    struct ScriptedDecisionMaker {
        script: std::sync::Mutex<Vec<Decision>>,
    }

    #[async_trait]
    impl DecisionMaker for ScriptedDecisionMaker {
        async fn decide(&self, _ctx: &DecisionContext<'_>) -> DecisionOutcome {
            DecisionOutcome {
                decision: self.script.lock().unwrap().remove(0),
                mcp_calls: vec![],
            }
        }
    }

    fn agent(username: &str) -> Agent {
        Agent {
            id: format!("{username}-agent"),
            team_id: "t1".into(),
            username: username.into(),
            display_name: username.to_uppercase(),
            role: "assistant".into(),
            prompt: "be helpful".into(),
            mcp_server_ids: vec![],
            mail_policy: MailPolicy::Open,
            multi_round_config: MultiRoundConfig::default(),
        }
    }

    fn build_components(decisions: Vec<Decision>) -> Components {
        let dir = tempdir().unwrap();
        let path = dir.path().to_path_buf();
        std::mem::forget(dir);

        let identity_path = path.join("identity.json");
        let snapshot = IdentitySnapshot {
            teams: vec![Team { id: "t1".into(), name: "Acme".into(), domain: "acme.example".into() }],
            users: vec![User { id: "u1".into(), name: "User".into(), email: "user@acme.example".into() }],
            memberships: vec![Membership { user_id: "u1".into(), team_id: "t1".into() }],
            agents: vec![agent("bot")],
        };
        std::fs::write(&identity_path, serde_json::to_string(&snapshot).unwrap()).unwrap();

        let identity = Arc::new(IdentityView::load(identity_path).unwrap());
        let mail = Arc::new(MailStore::open(&path).unwrap());
        let flows = Arc::new(FlowStore::open(&path).unwrap());
        let transport = Arc::new(LocalTransport::new());
        let router = Arc::new(Router::new(mail.clone(), transport));
        let tools = Arc::new(ToolRegistry::new());
        let decision_maker = Arc::new(ScriptedDecisionMaker { script: std::sync::Mutex::new(decisions) });
        let engine = Arc::new(FlowEngine::new(identity.clone(), mail.clone(), flows.clone(), router.clone(), tools, decision_maker, 10, 30));

        Components { config: Config::default(), identity, mail, flows, router, engine }
    }

    #[tokio::test]
    async fn simple_single_round_replies_to_requester() {
        let decision = Decision::complete_with("done", "Hello!");
        let components = Arc::new(build_components(vec![decision]));

        let payload = json!({
            "messageId": "<m1@x>",
            "from": "user@acme.example",
            "to": "bot@acme.example",
            "subject": "Hi",
            "stripped-text": "say hello",
        });

        let response = inbound_webhook(State(components.clone()), HeaderMap::new(), RawPayload(payload)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let flows = components.flows.list_by_agent("bot-agent", None);
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].status, flowmail_core::models::FlowStatus::Completed);
        assert_eq!(flows[0].final_response.as_deref(), Some("Hello!"));

        let sent = components.mail.get_by_message_id("m1@x");
        assert!(sent.is_ok());
    }

    #[tokio::test]
    async fn duplicate_delivery_does_not_start_a_second_flow() {
        let decisions = vec![Decision::complete_with("done", "Hello!"), Decision::complete_with("done", "Hello again!")];
        let components = Arc::new(build_components(decisions));

        let payload = json!({
            "messageId": "<m1@x>",
            "from": "user@acme.example",
            "to": "bot@acme.example",
            "subject": "Hi",
            "stripped-text": "say hello",
        });

        let first = inbound_webhook(State(components.clone()), HeaderMap::new(), RawPayload(payload.clone())).await;
        let second = inbound_webhook(State(components.clone()), HeaderMap::new(), RawPayload(payload)).await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::OK);

        assert_eq!(components.flows.list_by_agent("bot-agent", None).len(), 1);
    }

    #[tokio::test]
    async fn unknown_recipient_domain_is_swallowed_with_ok() {
        let components = Arc::new(build_components(vec![]));
        let payload = json!({
            "messageId": "<m2@x>",
            "from": "user@acme.example",
            "to": "bot@unknown.example",
            "subject": "Hi",
            "stripped-text": "hello",
        });
        let response = inbound_webhook(State(components), HeaderMap::new(), RawPayload(payload)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn token_check_accepts_header_and_rejects_mismatch() {
        let configured = Some("secret".to_string());
        let mut headers = HeaderMap::new();
        headers.insert("X-Inbound-Token", "secret".parse().unwrap());
        assert!(token_ok(&configured, &headers, &Value::Null));

        let mut wrong = HeaderMap::new();
        wrong.insert("X-Inbound-Token", "nope".parse().unwrap());
        assert!(!token_ok(&configured, &wrong, &Value::Null));
    }

    #[test]
    fn token_check_disabled_when_unconfigured() {
        assert!(token_ok(&None, &HeaderMap::new(), &Value::Null));
    }

    #[test]
    fn local_part_and_domain_fold_case() {
        assert_eq!(local_part("Bot@Team.Example"), "bot");
        assert_eq!(domain_of("Bot@Team.Example"), "team.example");
    }
}

