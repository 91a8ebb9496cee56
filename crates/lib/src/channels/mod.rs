//! Messaging channels: the transport capability, the HTTP bridge adapter and inbound bridge events.

mod bridge;
mod inbound;
mod transport;

pub use bridge::{classify_status, BridgeClient, UnconfiguredTransport};
pub use inbound::{BridgeEvent, BridgeEventKind};
pub use transport::{Ack, ChannelIdentity, ChannelTransport, TransportError};
