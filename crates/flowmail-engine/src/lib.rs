//! Flow Engine and Decision Engine: the orchestration core that turns
//! one inbound trigger into a running, possibly multi-round flow, and
//! one round's context into a structured decision.

pub mod decision;
pub mod flow;
pub mod peers;
pub mod prompt;
pub mod store;

pub use decision::{DecisionContext, DecisionMaker, DecisionOutcome, LlmDecisionMaker};
pub use flow::FlowEngine;
pub use peers::{available_peers, PeerAgent};
pub use prompt::build_decision_messages;
pub use store::{FlowLock, FlowStore};
