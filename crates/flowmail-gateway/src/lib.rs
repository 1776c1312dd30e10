//! Inbound webhook payload normalisation and outbound mail transport.

pub mod inbound;
pub mod transport;

pub use inbound::{parse_inbound, parse_thread_ids, InboundAttachment, InboundMail};
pub use transport::{HttpGatewayTransport, LocalTransport, OutboundAttachment, OutboundMessage, Transport};
