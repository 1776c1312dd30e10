//! Periodic sweep for flows that have run past their deadline while
//! `running` or `waiting`. Built on the same custom async-timer shape
//! as a sleep/shutdown `tokio::select!` loop rather than pulling in a
//! scheduling crate — there's exactly one job here, on a fixed interval.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use flowmail_core::error::Result;
use flowmail_core::models::{Flow, FlowStatus};
use flowmail_engine::FlowStore;
use flowmail_identity::IdentityView;
use flowmail_policy::PolicyContext;
use flowmail_router::Router;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

const DEFAULT_SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(60);

pub struct TimeoutSweeper {
    flows: Arc<FlowStore>,
    identity: Arc<IdentityView>,
    router: Arc<Router>,
    interval: StdDuration,
    shutdown: Arc<Notify>,
}

impl TimeoutSweeper {
    pub fn new(flows: Arc<FlowStore>, identity: Arc<IdentityView>, router: Arc<Router>) -> Self {
        TimeoutSweeper {
            flows,
            identity,
            router,
            interval: DEFAULT_SWEEP_INTERVAL,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn with_interval(mut self, interval: StdDuration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs until [`TimeoutSweeper::stop`] is called, sleeping `interval`
    /// between passes.
    pub async fn run(&self) {
        info!(interval_secs = self.interval.as_secs(), "timeout sweeper started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let expired = self.sweep_once().await;
                    if expired > 0 {
                        debug!(expired, "swept expired flows");
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("timeout sweeper shutting down");
                    return;
                }
            }
        }
    }

    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }

    /// One sweep pass: finds every open flow past its deadline, marks it
    /// expired, and notifies the requester (retried on transport failure)
    /// if no final response was ever sent. Returns the number of flows
    /// expired.
    pub async fn sweep_once(&self) -> usize {
        let now = Utc::now();
        let due: Vec<Flow> = self
            .flows
            .list_open()
            .into_iter()
            .filter(|f| f.deadline < now)
            .collect();
        let count = due.len();

        for mut flow in due {
            flow.status = FlowStatus::Expired;
            if let Err(e) = self.notify_requester(&flow).await {
                warn!(flow_id = %flow.id, error = %e, "could not notify requester of expiry");
            }
            match self.flows.save(&flow) {
                Ok(()) => info!(flow_id = %flow.id, "expired flow past its deadline"),
                Err(e) => warn!(flow_id = %flow.id, error = %e, "failed to persist expired flow"),
            }
        }

        count
    }

    async fn notify_requester(&self, flow: &Flow) -> Result<()> {
        if flow.final_response.is_some() {
            return Ok(());
        }
        let agent = self.identity.agent_by_id(&flow.agent_id)?;
        let team = self.identity.team_by_id(&flow.team_id)?;
        let team_members = self.identity.team_members(&flow.team_id).unwrap_or_default();
        let ctx = PolicyContext {
            other_email: "",
            team_domain: &team.domain,
            team_member_emails: &team_members,
            requester_email: Some(&flow.requester.email),
            other_agent_username: None,
        };
        let trigger_ids = vec![flow.trigger.message_id.clone()];
        self.router
            .send_agent_to_user_with_retry(
                &agent,
                &team.domain,
                &flow.requester.email,
                &format!("Re: {}", flow.trigger.subject),
                "I'm sorry, I wasn't able to complete this request in time.",
                trigger_ids.clone(),
                trigger_ids,
                &ctx,
            )
            .await
            .map(|_| ())
    }
}
