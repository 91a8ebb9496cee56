//! One entry point for every bulk send: resolve, validate, plan, lease, execute.

use super::job::{JobHandle, JobRegistry};
use super::orchestrator::Orchestrator;
use super::plan::{plan, EmptyPlan};
use crate::message::{InvalidMessage, MessageSequence, MessageSpec};
use crate::recipients::{resolve_with, InvalidRecipient, InvalidRecipientPolicy};
use crate::session::{SessionError, SessionManager};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    /// Raw identifiers as entered or imported.
    pub recipients: Vec<String>,
    pub messages: Vec<MessageSpec>,
    #[serde(default)]
    pub invalid_recipients: InvalidRecipientPolicy,
    /// Worker pool size; clamped to the configured maximum.
    #[serde(default)]
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    InvalidRecipient(#[from] InvalidRecipient),
    #[error(transparent)]
    InvalidMessage(#[from] InvalidMessage),
    #[error(transparent)]
    EmptyPlan(#[from] EmptyPlan),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// A started job plus what the resolver dropped on the way.
#[derive(Debug, Clone)]
pub struct Submission {
    pub job: JobHandle,
    pub rejected: Vec<InvalidRecipient>,
    pub duplicates: usize,
}

#[derive(Clone)]
pub struct Dispatcher {
    sessions: Arc<SessionManager>,
    orchestrator: Arc<Orchestrator>,
    jobs: JobRegistry,
}

impl Dispatcher {
    pub fn new(sessions: Arc<SessionManager>, orchestrator: Arc<Orchestrator>, jobs: JobRegistry) -> Self {
        Self {
            sessions,
            orchestrator,
            jobs,
        }
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    /// Validate the request and start a job on the tenant's current connection.
    /// Nothing is sent and no credit is consumed when this returns an error.
    pub async fn submit(&self, tenant_id: &str, request: DispatchRequest) -> Result<Submission, DispatchError> {
        let resolution = resolve_with(&request.recipients, request.invalid_recipients)?;
        let sequence = MessageSequence::new(request.messages)?;
        let plan = plan(&resolution.recipients, &sequence)?;
        let lease = self.sessions.lease(tenant_id).await?;
        if !resolution.rejected.is_empty() {
            log::info!(
                "tenant {}: dropped {} invalid recipient(s)",
                tenant_id,
                resolution.rejected.len()
            );
        }
        let job = self.orchestrator.execute(plan, lease, request.concurrency);
        self.jobs.insert(job.clone()).await;
        Ok(Submission {
            job,
            rejected: resolution.rejected,
            duplicates: resolution.duplicates,
        })
    }
}
