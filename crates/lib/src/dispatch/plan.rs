//! Dispatch planner: expand recipients x messages into a flat, deterministic send plan.
//!
//! Items are laid out recipient-major, message-minor, so each recipient's messages appear
//! in conversation order and plan index order is the global FIFO order.

use crate::message::{MessageSequence, MessageSpec};
use crate::recipients::{Recipient, RecipientSet};
use std::sync::Arc;

/// One (recipient, message) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendItem {
    /// Position in the plan.
    pub index: usize,
    pub recipient: Recipient,
    pub message: Arc<MessageSpec>,
    pub sequence_index: usize,
    pub recipient_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("empty plan ({recipients} recipient(s), {messages} message(s))")]
pub struct EmptyPlan {
    pub recipients: usize,
    pub messages: usize,
}

/// Immutable work breakdown of one dispatch request. Never empty.
#[derive(Debug, Clone)]
pub struct SendPlan {
    items: Vec<SendItem>,
    recipient_count: usize,
    message_count: usize,
}

impl SendPlan {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Always false: an empty plan cannot be constructed.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[SendItem] {
        &self.items
    }

    pub fn recipient_count(&self) -> usize {
        self.recipient_count
    }

    pub fn message_count(&self) -> usize {
        self.message_count
    }

    /// Plan index of a (recipient, message) pair.
    pub fn index_of(&self, recipient_index: usize, sequence_index: usize) -> usize {
        recipient_index * self.message_count + sequence_index
    }
}

/// Build the plan. Fails with [`EmptyPlan`] when either input is empty.
pub fn plan(recipients: &RecipientSet, sequence: &MessageSequence) -> Result<SendPlan, EmptyPlan> {
    if recipients.is_empty() || sequence.is_empty() {
        return Err(EmptyPlan {
            recipients: recipients.len(),
            messages: sequence.len(),
        });
    }
    let messages: Vec<Arc<MessageSpec>> = sequence.iter().cloned().map(Arc::new).collect();
    let mut items = Vec::with_capacity(recipients.len() * messages.len());
    for (recipient_index, recipient) in recipients.iter().enumerate() {
        for (sequence_index, message) in messages.iter().enumerate() {
            items.push(SendItem {
                index: items.len(),
                recipient: recipient.clone(),
                message: message.clone(),
                sequence_index,
                recipient_index,
            });
        }
    }
    Ok(SendPlan {
        items,
        recipient_count: recipients.len(),
        message_count: messages.len(),
    })
}
