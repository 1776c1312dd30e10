//! The Flow Engine: starts, advances, and resumes flows.
//! Owns the per-flow lock discipline and the state-machine transitions;
//! the Decision Engine only ever sees one round's context and returns
//! one decision.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use flowmail_core::error::{FlowMailError, Result};
use flowmail_core::models::{
    new_request_id, tag_subject_with_request_id, Agent, DecisionAction, Flow, FlowStatus, Requester, Round,
    StoredMail, Team, Trigger, WaitingFor,
};
use flowmail_identity::IdentityView;
use flowmail_policy::PolicyContext;
use flowmail_router::Router;
use flowmail_store::MailStore;
use flowmail_tools::{ToolContext, ToolRegistry};
use tracing::{info, warn};

use crate::decision::{DecisionContext, DecisionMaker};
use crate::peers::available_peers;
use crate::store::FlowStore;

/// The per-deployment lock-acquisition timeout: how long `executeRound`
/// waits for another caller on the same flow before returning `FlowBusy`.
const DEFAULT_LOCK_WAIT: StdDuration = StdDuration::from_secs(5);

pub struct FlowEngine {
    identity: Arc<IdentityView>,
    mail: Arc<MailStore>,
    flows: Arc<FlowStore>,
    router: Arc<Router>,
    tools: Arc<ToolRegistry>,
    decision_maker: Arc<dyn DecisionMaker>,
    max_rounds_default: u32,
    timeout_minutes_default: i64,
    lock_wait: StdDuration,
}

impl FlowEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<IdentityView>,
        mail: Arc<MailStore>,
        flows: Arc<FlowStore>,
        router: Arc<Router>,
        tools: Arc<ToolRegistry>,
        decision_maker: Arc<dyn DecisionMaker>,
        max_rounds_default: u32,
        timeout_minutes_default: i64,
    ) -> Self {
        FlowEngine {
            identity,
            mail,
            flows,
            router,
            tools,
            decision_maker,
            max_rounds_default,
            timeout_minutes_default,
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    pub fn flows(&self) -> &Arc<FlowStore> {
        &self.flows
    }

    /// Starts a brand-new flow for `agent` from `trigger`. When
    /// `delegating_from` is set, the new flow inherits the requester
    /// identity of the delegating flow instead of resolving one from
    /// `from_email` — this is what keeps delegation transparent to the
    /// original requester.
    pub fn start_flow(
        &self,
        agent: &Agent,
        team: &Team,
        trigger: Trigger,
        from_email: &str,
        delegating_from: Option<&Flow>,
    ) -> Result<Flow> {
        let (requester, user_id) = if let Some(delegating) = delegating_from {
            (delegating.requester.clone(), delegating.user_id.clone())
        } else if let Ok(user) = self.identity.user_by_email(from_email) {
            (Requester { name: user.name.clone(), email: user.email.clone() }, Some(user.id))
        } else {
            (Requester { name: from_email.to_string(), email: from_email.to_string() }, None)
        };

        let max_rounds = if agent.multi_round_config.enabled {
            agent.multi_round_config.max_rounds
        } else {
            1
        };
        let timeout_minutes = if agent.multi_round_config.enabled {
            agent.multi_round_config.timeout_minutes
        } else {
            self.timeout_minutes_default
        };
        let max_rounds = max_rounds.clamp(1, self.max_rounds_default);

        let now = Utc::now();
        let flow = Flow {
            id: format!("flow-{}", nanoid::nanoid!(12)),
            agent_id: agent.id.clone(),
            team_id: team.id.clone(),
            user_id,
            requester,
            status: FlowStatus::Running,
            trigger,
            current_round: 0,
            max_rounds,
            started_at: now,
            deadline: now + Duration::minutes(timeout_minutes),
            rounds: Vec::new(),
            waiting_for: None,
            final_response: None,
        };

        info!(flow_id = %flow.id, agent = %agent.username, "started flow");
        self.flows.insert(flow.clone())?;
        Ok(flow)
    }

    fn policy_ctx<'a>(&self, team: &'a Team, flow: &'a Flow, team_members: &'a [String]) -> PolicyContext<'a> {
        PolicyContext {
            other_email: "",
            team_domain: &team.domain,
            team_member_emails: team_members,
            requester_email: Some(&flow.requester.email),
            other_agent_username: None,
        }
    }

    /// Runs consecutive rounds of a running flow until it suspends,
    /// completes, fails, or expires. Holds the flow's lock across every
    /// round in the burst, so a `continue` decision's next round never
    /// interleaves with a concurrent `resumeFlow`/`executeRound` call on
    /// the same flow for the whole burst of rounds it runs.
    pub async fn execute_round(&self, flow_id: &str) -> Result<Flow> {
        let _lock = self.flows.acquire(flow_id, self.lock_wait).await?;
        let mut flow = self.flows.get(flow_id)?;

        if flow.status != FlowStatus::Running {
            return Err(FlowMailError::PreconditionFailed(format!(
                "flow {flow_id} is not running (status={:?})",
                flow.status
            )));
        }

        let agent = self.identity.agent_by_id(&flow.agent_id)?;
        let team = self.identity.team_by_id(&flow.team_id)?;
        let team_members = self.identity.team_members(&flow.team_id).unwrap_or_default();

        loop {
            let now = Utc::now();
            if now > flow.deadline {
                flow.status = FlowStatus::Expired;
                warn!(flow_id = %flow.id, "flow expired mid-execution");
                self.flows.save(&flow)?;
                return Ok(flow);
            }

            let last_chance = flow.current_round + 1 >= flow.max_rounds;
            let peers = available_peers(&agent, &team.domain, &self.identity);

            let tool_ctx = ToolContext {
                team_id: team.id.clone(),
                team_domain: team.domain.clone(),
                user_id: flow.user_id.clone(),
                agent: agent.clone(),
                team_member_emails: team_members.clone(),
                requester_email: Some(flow.requester.email.clone()),
            };

            let ctx = DecisionContext {
                flow: &flow,
                team: &team,
                agent_prompt: &agent.prompt,
                now,
                last_chance,
                peers,
                tool_ctx,
            };

            let outcome = self.decision_maker.decide(&ctx).await;
            let mut decision = outcome.decision;
            if last_chance && !decision.is_terminal() {
                warn!(flow_id = %flow.id, "model did not terminate on the last available round; forcing failure");
                decision = flowmail_core::models::Decision::fail_with(
                    "reached the maximum number of rounds without completing",
                    Some("I'm sorry, I wasn't able to finish this within the allotted number of steps.".to_string()),
                );
            }

            let mut round = Round::new(flow.current_round, now);
            round.mcp_calls = outcome.mcp_calls;
            round.decision = Some(decision.clone());
            round.ended_at = Some(Utc::now());
            flow.rounds.push(round);
            flow.current_round = flow.rounds.len() as u32;

            match decision.action {
                DecisionAction::Complete { final_response, .. } => {
                    let ctx = self.policy_ctx(&team, &flow, &team_members);
                    let trigger_ids = vec![flow.trigger.message_id.clone()];
                    match self
                        .router
                        .send_agent_to_user_with_retry(
                            &agent,
                            &team.domain,
                            &flow.requester.email,
                            &format!("Re: {}", flow.trigger.subject),
                            &final_response,
                            trigger_ids.clone(),
                            trigger_ids,
                            &ctx,
                        )
                        .await
                    {
                        Ok(_) => {
                            flow.status = FlowStatus::Completed;
                            flow.final_response = Some(final_response);
                            info!(flow_id = %flow.id, "flow completed");
                        }
                        Err(e) => {
                            warn!(flow_id = %flow.id, error = %e, "completion send failed after retries");
                            flow.status = FlowStatus::Failed;
                        }
                    }
                    break;
                }
                DecisionAction::WaitForAgent { target_username, subject, body, question: _, .. } => {
                    let request_id = new_request_id();
                    let tagged_subject = tag_subject_with_request_id(&request_id, &subject);
                    match self
                        .router
                        .send_agent_to_agent(&agent, &team.domain, &target_username, &subject, &body, &request_id)
                        .await
                    {
                        Ok(sent_id) => {
                            let timeout = Duration::minutes(agent.multi_round_config.timeout_minutes);
                            let expected_by = std::cmp::min(now + timeout, flow.deadline);
                            flow.waiting_for = Some(WaitingFor {
                                request_id,
                                target_agent_username: target_username,
                                sent_message_id: sent_id.clone(),
                                thread_message_ids: vec![sent_id],
                                expected_by,
                            });
                            flow.status = FlowStatus::Waiting;
                            info!(flow_id = %flow.id, subject = %tagged_subject, "flow suspended waiting for peer agent");
                        }
                        Err(e) => {
                            warn!(flow_id = %flow.id, error = %e, "agent-to-agent send denied");
                            if let Some(last_round) = flow.rounds.last_mut() {
                                last_round.decision = Some(flowmail_core::models::Decision::fail_with(
                                    format!("outbound send denied: {e}"),
                                    None,
                                ));
                            }
                            flow.status = FlowStatus::Failed;
                        }
                    }
                    break;
                }
                DecisionAction::Continue => {
                    self.flows.save(&flow)?;
                    continue;
                }
                DecisionAction::Fail { final_response } => {
                    if let Some(message) = &final_response {
                        let ctx = self.policy_ctx(&team, &flow, &team_members);
                        let trigger_ids = vec![flow.trigger.message_id.clone()];
                        if let Err(e) = self
                            .router
                            .send_agent_to_user_with_retry(
                                &agent,
                                &team.domain,
                                &flow.requester.email,
                                &format!("Re: {}", flow.trigger.subject),
                                message,
                                trigger_ids.clone(),
                                trigger_ids,
                                &ctx,
                            )
                            .await
                        {
                            warn!(flow_id = %flow.id, error = %e, "failure notification send failed after retries");
                        }
                    }
                    flow.status = FlowStatus::Failed;
                    warn!(flow_id = %flow.id, "flow failed");
                    break;
                }
            }
        }

        self.flows.save(&flow)?;
        Ok(flow)
    }

    /// Resumes a `waiting` flow with the message that answers it:
    /// appends it to the suspending round, transitions back to
    /// `running`, clears `waitingFor`, then runs the next round.
    pub async fn resume_flow(&self, flow_id: &str, incoming: StoredMail) -> Result<Flow> {
        {
            let _lock = self.flows.acquire(flow_id, self.lock_wait).await?;
            let mut flow = self.flows.get(flow_id)?;
            if flow.status != FlowStatus::Waiting {
                return Err(FlowMailError::PreconditionFailed(format!(
                    "flow {flow_id} is not waiting (status={:?})",
                    flow.status
                )));
            }
            if let Some(round) = flow.rounds.last_mut() {
                round.messages.push(incoming);
            }
            flow.status = FlowStatus::Running;
            flow.waiting_for = None;
            self.flows.save(&flow)?;
        }
        self.execute_round(flow_id).await
    }

    pub fn mail(&self) -> &Arc<MailStore> {
        &self.mail
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }
}
