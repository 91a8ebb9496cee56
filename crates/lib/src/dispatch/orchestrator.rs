//! Bulk dispatch orchestrator: drains a [`SendPlan`] through a bounded worker pool.
//!
//! Workers share one [`Scheduler`]; a recipient's next message is handed out only after its
//! previous one is terminal. Between items every worker checks the job's cancellation flag
//! and the session lease. On either, the items not yet handed out are skipped and the job
//! still completes with a summary.

use super::credit::CreditGate;
use super::job::{ItemResult, JobHandle, JobShared, JobState, JobSummary};
use super::history::{LogEntry, MessageLog};
use super::plan::{SendItem, SendPlan};
use super::progress::{FailureReason, ItemOutcome, SkipReason};
use super::retry::RetryPolicy;
use super::scheduler::{Next, Scheduler};
use crate::channels::TransportError;
use crate::config::DispatchConfig;
use crate::session::{LeaseSendError, SessionLease};
use chrono::Utc;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub struct Orchestrator {
    credit_gate: Arc<dyn CreditGate>,
    config: DispatchConfig,
    retry: RetryPolicy,
    log: Option<Arc<MessageLog>>,
}

/// Everything one job's workers share.
struct Run {
    job: Arc<JobShared>,
    plan: SendPlan,
    lease: SessionLease,
    scheduler: Mutex<Scheduler>,
    credit_gate: Arc<dyn CreditGate>,
    retry: RetryPolicy,
    send_timeout: Duration,
    log: Option<Arc<MessageLog>>,
}

impl Orchestrator {
    pub fn new(credit_gate: Arc<dyn CreditGate>, config: DispatchConfig) -> Self {
        let retry = RetryPolicy::from(&config.retry);
        Self {
            credit_gate,
            config,
            retry,
            log: None,
        }
    }

    /// Record every terminal item in `log`.
    pub fn with_log(mut self, log: Arc<MessageLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Start the job and return its handle immediately. `concurrency` is clamped to
    /// `[1, maxConcurrency]`; `None` uses the configured default.
    pub fn execute(&self, plan: SendPlan, lease: SessionLease, concurrency: Option<usize>) -> JobHandle {
        let job = Arc::new(JobShared::new(lease.tenant_id(), plan.len()));
        let workers = self.config.effective_concurrency(concurrency).min(plan.len()).max(1);
        log::info!(
            "job {}: dispatching {} item(s) for tenant {} with {} worker(s)",
            job.id,
            plan.len(),
            job.tenant_id,
            workers
        );
        let run = Arc::new(Run {
            job: job.clone(),
            scheduler: Mutex::new(Scheduler::new(&plan)),
            plan,
            lease,
            credit_gate: self.credit_gate.clone(),
            retry: self.retry,
            send_timeout: self.config.send_timeout(),
            log: self.log.clone(),
        });
        tokio::spawn(supervise(run, workers));
        JobHandle { shared: job }
    }
}

async fn supervise(run: Arc<Run>, workers: usize) {
    let handles: Vec<_> = (0..workers)
        .map(|n| tokio::spawn(work(run.clone(), n)))
        .collect();
    for result in futures_util::future::join_all(handles).await {
        if let Err(e) = result {
            log::error!("job {}: worker task failed: {}", run.job.id, e);
        }
    }

    // a worker that died outside a send leaves its item unfinished; account for it so the job terminates
    for index in run.job.tracker.unfinished() {
        run.finish(
            index,
            ItemOutcome::Failed {
                reason: FailureReason::TransportError,
                detail: "worker stopped before the item finished".to_string(),
                attempts: 0,
            },
        );
    }
    run.complete_job();
}

async fn work(run: Arc<Run>, worker: usize) {
    loop {
        let notified = run.job.wake.notified();
        if let Some(reason) = run.stop_reason() {
            run.skip_remaining(reason);
            return;
        }
        let next = run
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next();
        match next {
            Next::Item(index) => {
                let item = &run.plan.items()[index];
                log::debug!("job {}: worker {} takes item {}", run.job.id, worker, index);
                run.process(item).await;
            }
            Next::Wait => {
                tokio::select! {
                    _ = notified => {}
                    _ = run.lease.closed() => {}
                }
            }
            Next::Done => return,
        }
    }
}

impl Run {
    fn stop_reason(&self) -> Option<SkipReason> {
        if self.job.is_cancelled() {
            Some(SkipReason::Cancelled)
        } else if !self.lease.is_active() {
            Some(SkipReason::SessionNotConnected)
        } else {
            None
        }
    }

    fn skip_remaining(&self, reason: SkipReason) {
        let rest = self
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain();
        if rest.is_empty() {
            return;
        }
        if reason == SkipReason::SessionNotConnected {
            self.job.session_lost.store(true, Ordering::SeqCst);
        }
        log::info!(
            "job {}: skipping {} item(s) ({:?})",
            self.job.id,
            rest.len(),
            reason
        );
        for index in rest {
            self.finish(index, ItemOutcome::Skipped { reason });
        }
        self.job.wake.notify_waiters();
    }

    async fn process(&self, item: &SendItem) {
        if let Err(e) = self.job.tracker.mark_in_flight(item.index) {
            log::warn!("job {}: {}", self.job.id, e);
        }
        let outcome = match AssertUnwindSafe(self.send_item(item)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                log::error!("job {}: send of item {} panicked", self.job.id, item.index);
                ItemOutcome::Failed {
                    reason: FailureReason::TransportError,
                    detail: "send panicked".to_string(),
                    attempts: 0,
                }
            }
        };
        self.finish(item.index, outcome);
        self.scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .complete(item.recipient_index);
        self.job.wake.notify_waiters();
    }

    async fn send_item(&self, item: &SendItem) -> ItemOutcome {
        if !self.credit_gate.try_consume(&self.job.tenant_id, 1).await {
            return ItemOutcome::Failed {
                reason: FailureReason::InsufficientCredits,
                detail: String::new(),
                attempts: 0,
            };
        }

        let max_attempts = self.retry.max_attempts();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = match tokio::time::timeout(
                self.send_timeout,
                self.lease.send(&item.recipient, &item.message),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(LeaseSendError::Transport(TransportError::Transient(
                    "send timed out".to_string(),
                ))),
            };
            match result {
                Ok(ack) => {
                    return ItemOutcome::Sent {
                        message_id: ack.message_id,
                        attempts,
                    }
                }
                Err(LeaseSendError::SessionClosed(_)) => {
                    return ItemOutcome::Failed {
                        reason: FailureReason::TransportError,
                        detail: "session closed before the send completed".to_string(),
                        attempts,
                    }
                }
                Err(LeaseSendError::Transport(TransportError::Rejected(detail))) => {
                    return ItemOutcome::Failed {
                        reason: FailureReason::Rejected,
                        detail,
                        attempts,
                    }
                }
                Err(LeaseSendError::Transport(TransportError::Transient(detail))) => {
                    if attempts >= max_attempts {
                        return ItemOutcome::Failed {
                            reason: FailureReason::TransportError,
                            detail,
                            attempts,
                        };
                    }
                    let delay = self.retry.delay_for(attempts - 1);
                    log::debug!(
                        "job {}: item {} to {} failed transiently ({}), retrying in {:?}",
                        self.job.id,
                        item.index,
                        item.recipient,
                        detail,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Advance the tracker exactly once and log the outcome.
    fn finish(&self, index: usize, outcome: ItemOutcome) {
        let item = &self.plan.items()[index];
        if let Some(log) = &self.log {
            log.record(LogEntry::from_outcome(
                &self.job.id,
                &self.job.tenant_id,
                &item.recipient,
                item.message.kind,
                item.sequence_index,
                &outcome,
            ));
        }
        if let Err(e) = self.job.tracker.advance(index, outcome) {
            log::warn!("job {}: {}", self.job.id, e);
        }
    }

    fn complete_job(&self) {
        let snapshot = self.job.tracker.snapshot();
        let results = self
            .job
            .tracker
            .outcomes()
            .into_iter()
            .zip(self.plan.items())
            .filter_map(|(outcome, item)| {
                Some(ItemResult {
                    index: item.index,
                    recipient: item.recipient.clone(),
                    sequence_index: item.sequence_index,
                    kind: item.message.kind,
                    outcome: outcome?,
                })
            })
            .collect();
        let summary = JobSummary {
            job_id: self.job.id.clone(),
            tenant_id: self.job.tenant_id.clone(),
            total: snapshot.total,
            success_count: snapshot.success_count,
            fail_count: snapshot.fail_count,
            skipped_count: snapshot.skipped_count,
            cancelled: self.job.is_cancelled(),
            session_lost: self.job.session_lost.load(Ordering::SeqCst),
            started_at: self.job.started_at,
            finished_at: Utc::now(),
            results,
        };
        log::info!(
            "job {}: completed ({} sent, {} failed, {} skipped of {})",
            self.job.id,
            summary.success_count,
            summary.fail_count,
            summary.skipped_count,
            summary.total
        );
        let _ = self.job.summary.set(summary);
        self.job.state.send_replace(JobState::Completed);
    }
}
