//! Bulk job handles, terminal summaries and the registry of running and finished jobs.

use super::progress::{ItemOutcome, ProgressSnapshot, ProgressTracker};
use crate::message::MessageKind;
use crate::recipients::Recipient;
use crate::session::TenantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{watch, Notify, RwLock};

/// Opaque job identifier (a v4 uuid for jobs created by the orchestrator).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `Running -> Completed`, or `Running -> Cancelled -> Completed` when cancellation was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobState {
    Running,
    Cancelled,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemResult {
    pub index: usize,
    pub recipient: Recipient,
    pub sequence_index: usize,
    pub kind: MessageKind,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

/// Terminal report of a bulk job. Partial failure is a normal outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub total: usize,
    pub success_count: usize,
    pub fail_count: usize,
    pub skipped_count: usize,
    /// Cancellation was requested while the job ran.
    pub cancelled: bool,
    /// The session left `Connected` before every item was handed out.
    pub session_lost: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<ItemResult>,
}

/// State shared between a job's supervisor, its workers and every handle.
#[derive(Debug)]
pub(crate) struct JobShared {
    pub(crate) id: JobId,
    pub(crate) tenant_id: TenantId,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) tracker: ProgressTracker,
    pub(crate) cancelled: AtomicBool,
    pub(crate) session_lost: AtomicBool,
    /// Woken when an item completes or the job is cancelled.
    pub(crate) wake: Notify,
    pub(crate) state: watch::Sender<JobState>,
    pub(crate) summary: OnceLock<JobSummary>,
}

impl JobShared {
    pub(crate) fn new(tenant_id: &str, total: usize) -> Self {
        let (state, _) = watch::channel(JobState::Running);
        Self {
            id: JobId::generate(),
            tenant_id: tenant_id.to_string(),
            started_at: Utc::now(),
            tracker: ProgressTracker::new(total),
            cancelled: AtomicBool::new(false),
            session_lost: AtomicBool::new(false),
            wake: Notify::new(),
            state,
            summary: OnceLock::new(),
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Cheap handle to a running or finished bulk job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub(crate) shared: Arc<JobShared>,
}

impl JobHandle {
    pub fn id(&self) -> &JobId {
        &self.shared.id
    }

    pub fn tenant_id(&self) -> &str {
        &self.shared.tenant_id
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.shared.tracker.snapshot()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<ProgressSnapshot> {
        self.shared.tracker.subscribe()
    }

    pub fn state(&self) -> JobState {
        *self.shared.state.borrow()
    }

    /// Request cooperative cancellation: items not yet handed out are skipped, in-flight
    /// sends finish. Returns false if the job already completed or was already cancelled.
    pub fn cancel(&self) -> bool {
        let transitioned = self.shared.state.send_if_modified(|state| {
            if *state == JobState::Running {
                *state = JobState::Cancelled;
                true
            } else {
                false
            }
        });
        if transitioned {
            self.shared.cancelled.store(true, Ordering::SeqCst);
            self.shared.wake.notify_waiters();
            log::info!("job {}: cancellation requested", self.shared.id);
        }
        transitioned
    }

    /// Wait for the job to reach `Completed` and return its summary.
    pub async fn wait(&self) -> JobSummary {
        let mut rx = self.shared.state.subscribe();
        loop {
            if let Some(summary) = self.summary() {
                return summary;
            }
            // the sender lives in `shared`, which this handle keeps alive
            let _ = rx.changed().await;
        }
    }

    /// Terminal summary, once the job has completed.
    pub fn summary(&self) -> Option<JobSummary> {
        self.shared.summary.get().cloned()
    }
}

/// Running and finished jobs, keyed by id.
///
/// Finished jobs whose summary nobody takes are dropped once they are older than the
/// retention window; pruning happens whenever a job is inserted.
#[derive(Debug, Clone)]
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<JobId, JobHandle>>>,
    retention: chrono::Duration,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::with_retention(chrono::Duration::hours(1))
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: chrono::Duration) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            retention,
        }
    }

    pub async fn insert(&self, job: JobHandle) {
        let mut jobs = self.jobs.write().await;
        Self::prune_locked(&mut jobs, self.retention, Utc::now());
        jobs.insert(job.id().clone(), job);
    }

    /// Drop finished jobs that completed more than the retention window before `now`.
    /// Running jobs are never dropped. Returns how many were removed.
    pub async fn prune(&self, now: DateTime<Utc>) -> usize {
        Self::prune_locked(&mut *self.jobs.write().await, self.retention, now)
    }

    fn prune_locked(jobs: &mut HashMap<JobId, JobHandle>, retention: chrono::Duration, now: DateTime<Utc>) -> usize {
        let before = jobs.len();
        jobs.retain(|_, job| {
            job.shared
                .summary
                .get()
                .map_or(true, |s| now.signed_duration_since(s.finished_at) < retention)
        });
        let removed = before - jobs.len();
        if removed > 0 {
            log::debug!("pruned {} finished job(s) past retention", removed);
        }
        removed
    }

    pub async fn get(&self, id: &JobId) -> Option<JobHandle> {
        self.jobs.read().await.get(id).cloned()
    }

    /// Jobs of one tenant, or of all tenants.
    pub async fn list(&self, tenant_id: Option<&str>) -> Vec<JobHandle> {
        let mut jobs: Vec<JobHandle> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| tenant_id.map_or(true, |t| j.tenant_id() == t))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.shared.started_at);
        jobs
    }

    /// Remove a completed job and return its summary. Running jobs stay registered.
    pub async fn take_summary(&self, id: &JobId) -> Option<JobSummary> {
        let mut jobs = self.jobs.write().await;
        let summary = jobs.get(id)?.summary()?;
        jobs.remove(id);
        Some(summary)
    }

    /// Cancel every running job. Returns how many were cancelled.
    pub async fn cancel_all(&self) -> usize {
        self.jobs
            .read()
            .await
            .values()
            .filter(|j| j.cancel())
            .count()
    }
}
