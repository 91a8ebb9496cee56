//! Channel transport: the opaque capability that delivers one message to one recipient
//! over a paired channel endpoint.

use crate::message::MessageSpec;
use crate::recipients::Recipient;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable endpoint identifier of a paired channel (e.g. the phone number the tenant scanned with).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelIdentity(String);

impl ChannelIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Delivery acknowledgement from the channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    /// Channel-assigned message id, when the channel reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Timeout, throttling or a temporary channel fault; safe to retry.
    #[error("transient transport error: {0}")]
    Transient(String),
    /// Malformed media, recipient refused by the channel, etc. Retrying will not help.
    #[error("rejected by channel: {0}")]
    Rejected(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}

/// Message delivery primitive. Sends to distinct recipients may be issued concurrently.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn send(
        &self,
        channel: &ChannelIdentity,
        recipient: &Recipient,
        message: &MessageSpec,
    ) -> Result<Ack, TransportError>;
}
