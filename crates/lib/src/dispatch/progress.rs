//! Progress tracking for a bulk job.
//!
//! Counts only real terminal transitions. `dispatched` (terminal items) is monotonic and
//! never exceeds `total`; each item can be advanced exactly once.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemStatus {
    Pending,
    InFlight,
    Sent,
    Failed,
    Skipped,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Sent | ItemStatus::Failed | ItemStatus::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureReason {
    /// Credit gate refused; the transport was never called.
    InsufficientCredits,
    /// Transient errors outlasted the retry budget, or the send could not complete.
    TransportError,
    /// The channel refused the message; not retried.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    SessionNotConnected,
    Cancelled,
}

/// Terminal result of one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ItemOutcome {
    #[serde(rename_all = "camelCase")]
    Sent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        attempts: u32,
    },
    #[serde(rename_all = "camelCase")]
    Failed {
        reason: FailureReason,
        detail: String,
        attempts: u32,
    },
    Skipped { reason: SkipReason },
}

impl ItemOutcome {
    pub fn status(&self) -> ItemStatus {
        match self {
            ItemOutcome::Sent { .. } => ItemStatus::Sent,
            ItemOutcome::Failed { .. } => ItemStatus::Failed,
            ItemOutcome::Skipped { .. } => ItemStatus::Skipped,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            ItemOutcome::Sent { attempts, .. } | ItemOutcome::Failed { attempts, .. } => *attempts,
            ItemOutcome::Skipped { .. } => 0,
        }
    }

    /// Short human-readable reason for failures and skips.
    pub fn reason(&self) -> Option<String> {
        match self {
            ItemOutcome::Sent { .. } => None,
            ItemOutcome::Failed { reason, detail, .. } => {
                let reason = serde_json::to_value(reason)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                Some(if detail.is_empty() {
                    reason
                } else {
                    format!("{}: {}", reason, detail)
                })
            }
            ItemOutcome::Skipped { reason } => serde_json::to_value(reason)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub dispatched: usize,
    pub total: usize,
    pub success_count: usize,
    pub fail_count: usize,
    pub skipped_count: usize,
}

impl ProgressSnapshot {
    /// `dispatched / total * 100`, clamped to `[0, 100]`.
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.dispatched as f64 / self.total as f64 * 100.0).clamp(0.0, 100.0)
    }

    pub fn is_complete(&self) -> bool {
        self.dispatched == self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProgressError {
    #[error("item {0} is already terminal")]
    AlreadyTerminal(usize),
    #[error("item {0} is not part of this job")]
    UnknownItem(usize),
    #[error("item {0} is not pending")]
    NotPending(usize),
}

#[derive(Debug)]
struct Slot {
    status: ItemStatus,
    outcome: Option<ItemOutcome>,
}

#[derive(Debug)]
struct TrackerState {
    slots: Vec<Slot>,
    snapshot: ProgressSnapshot,
}

/// Concurrency-safe per-item status and counters. Subscribers see every advance.
#[derive(Debug)]
pub struct ProgressTracker {
    state: Mutex<TrackerState>,
    updates: watch::Sender<ProgressSnapshot>,
}

impl ProgressTracker {
    pub fn new(total: usize) -> Self {
        let snapshot = ProgressSnapshot {
            total,
            ..ProgressSnapshot::default()
        };
        let (updates, _) = watch::channel(snapshot);
        let slots = (0..total)
            .map(|_| Slot {
                status: ItemStatus::Pending,
                outcome: None,
            })
            .collect();
        Self {
            state: Mutex::new(TrackerState { slots, snapshot }),
            updates,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `Pending -> InFlight` when a worker picks the item up.
    pub fn mark_in_flight(&self, index: usize) -> Result<(), ProgressError> {
        let mut state = self.lock();
        let slot = state
            .slots
            .get_mut(index)
            .ok_or(ProgressError::UnknownItem(index))?;
        if slot.status != ItemStatus::Pending {
            return Err(ProgressError::NotPending(index));
        }
        slot.status = ItemStatus::InFlight;
        Ok(())
    }

    /// Record the item's terminal outcome. A second call for the same item is rejected and counts nothing.
    pub fn advance(&self, index: usize, outcome: ItemOutcome) -> Result<ProgressSnapshot, ProgressError> {
        let mut state = self.lock();
        let slot = state
            .slots
            .get_mut(index)
            .ok_or(ProgressError::UnknownItem(index))?;
        if slot.status.is_terminal() {
            return Err(ProgressError::AlreadyTerminal(index));
        }
        let status = outcome.status();
        slot.status = status;
        slot.outcome = Some(outcome);

        let snapshot = &mut state.snapshot;
        snapshot.dispatched += 1;
        match status {
            ItemStatus::Sent => snapshot.success_count += 1,
            ItemStatus::Failed => snapshot.fail_count += 1,
            _ => snapshot.skipped_count += 1,
        }
        let snapshot = *snapshot;
        self.updates.send_replace(snapshot);
        Ok(snapshot)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.lock().snapshot
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.updates.subscribe()
    }

    pub fn status(&self, index: usize) -> Option<ItemStatus> {
        self.lock().slots.get(index).map(|s| s.status)
    }

    /// Indices of items not yet terminal.
    pub fn unfinished(&self) -> Vec<usize> {
        self.lock()
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.status.is_terminal())
            .map(|(i, _)| i)
            .collect()
    }

    /// Terminal outcomes in plan order; `None` for items not yet terminal.
    pub fn outcomes(&self) -> Vec<Option<ItemOutcome>> {
        self.lock().slots.iter().map(|s| s.outcome.clone()).collect()
    }
}
