//! Correlates inbound mail to a waiting flow and dispatches outbound
//! agent-to-agent and agent-to-user mail.

pub mod classify;
pub mod dispatch;

pub use classify::{classify_inbound, RouteOutcome};
pub use dispatch::Router;
