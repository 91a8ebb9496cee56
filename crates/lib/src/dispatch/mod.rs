//! Bulk dispatch: planning, credit gating, the worker-pool orchestrator, progress and the message log.

pub mod credit;
pub mod history;
pub mod job;
pub mod orchestrator;
pub mod plan;
pub mod progress;
pub mod retry;
mod scheduler;
pub mod service;

pub use credit::{CreditGate, CreditLedger};
pub use history::{LogEntry, LogPage, LogQuery, MessageLog};
pub use job::{ItemResult, JobHandle, JobId, JobRegistry, JobState, JobSummary};
pub use orchestrator::Orchestrator;
pub use plan::{plan, EmptyPlan, SendItem, SendPlan};
pub use progress::{
    FailureReason, ItemOutcome, ItemStatus, ProgressError, ProgressSnapshot, ProgressTracker, SkipReason,
};
pub use retry::RetryPolicy;
pub use service::{DispatchError, DispatchRequest, Dispatcher, Submission};
