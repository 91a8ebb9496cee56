//! Bounded in-memory log of per-item outcomes, queryable per tenant with filters and paging.

use super::job::JobId;
use super::progress::{ItemOutcome, ItemStatus};
use crate::message::MessageKind;
use crate::recipients::Recipient;
use crate::session::TenantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

const DEFAULT_PAGE_LIMIT: usize = 20;
const MAX_PAGE_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub recipient: Recipient,
    pub kind: MessageKind,
    pub sequence_index: usize,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub attempts: u32,
    pub at: DateTime<Utc>,
}

impl LogEntry {
    pub fn from_outcome(
        job_id: &JobId,
        tenant_id: &str,
        recipient: &Recipient,
        kind: MessageKind,
        sequence_index: usize,
        outcome: &ItemOutcome,
    ) -> Self {
        Self {
            job_id: job_id.clone(),
            tenant_id: tenant_id.to_string(),
            recipient: recipient.clone(),
            kind,
            sequence_index,
            status: outcome.status(),
            reason: outcome.reason(),
            attempts: outcome.attempts(),
            at: Utc::now(),
        }
    }
}

/// Filter and page for [`MessageLog::query`]. Pages are 1-based.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogQuery {
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    #[serde(default)]
    pub status: Option<ItemStatus>,
    #[serde(default)]
    pub kind: Option<MessageKind>,
    #[serde(default)]
    pub job_id: Option<JobId>,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPage {
    pub entries: Vec<LogEntry>,
    pub total: usize,
    pub page: usize,
    pub pages: usize,
}

pub struct MessageLog {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
}

impl MessageLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Append an entry, evicting the oldest when full.
    pub fn record(&self, entry: LogEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Matching entries, newest first.
    pub fn query(&self, query: &LogQuery) -> LogPage {
        let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
        let page = query.page.unwrap_or(1).max(1);
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let matching: Vec<&LogEntry> = entries
            .iter()
            .rev()
            .filter(|e| query.tenant_id.as_ref().map_or(true, |t| &e.tenant_id == t))
            .filter(|e| query.status.map_or(true, |s| e.status == s))
            .filter(|e| query.kind.map_or(true, |k| e.kind == k))
            .filter(|e| query.job_id.as_ref().map_or(true, |j| &e.job_id == j))
            .collect();
        let total = matching.len();
        LogPage {
            entries: matching
                .into_iter()
                .skip(page.saturating_sub(1).saturating_mul(limit))
                .take(limit)
                .cloned()
                .collect(),
            total,
            page,
            pages: total.div_ceil(limit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::progress::{FailureReason, SkipReason};

    fn entry(tenant: &str, n: usize, outcome: ItemOutcome, kind: MessageKind) -> LogEntry {
        let recipient: Recipient = format!("+1555000{:04}", n).parse().unwrap();
        LogEntry::from_outcome(&JobId::from("job-1"), tenant, &recipient, kind, 0, &outcome)
    }

    fn sent() -> ItemOutcome {
        ItemOutcome::Sent {
            message_id: None,
            attempts: 1,
        }
    }

    #[test]
    fn query_filters_and_pages_newest_first() {
        let log = MessageLog::new(100);
        for n in 0..25 {
            log.record(entry("a", n, sent(), MessageKind::Text));
        }
        log.record(entry(
            "a",
            99,
            ItemOutcome::Failed {
                reason: FailureReason::Rejected,
                detail: "bad media".into(),
                attempts: 1,
            },
            MessageKind::Image,
        ));
        log.record(entry(
            "b",
            1,
            ItemOutcome::Skipped {
                reason: SkipReason::Cancelled,
            },
            MessageKind::Text,
        ));

        let page = log.query(&LogQuery {
            tenant_id: Some("a".into()),
            ..LogQuery::default()
        });
        assert_eq!(page.total, 26);
        assert_eq!(page.pages, 2);
        assert_eq!(page.entries.len(), 20);
        assert_eq!(page.entries[0].recipient.as_str(), "+15550000099");

        let failed = log.query(&LogQuery {
            status: Some(ItemStatus::Failed),
            ..LogQuery::default()
        });
        assert_eq!(failed.total, 1);
        assert_eq!(failed.entries[0].reason.as_deref(), Some("rejected: bad media"));

        let second = log.query(&LogQuery {
            tenant_id: Some("a".into()),
            kind: Some(MessageKind::Text),
            page: Some(2),
            ..LogQuery::default()
        });
        assert_eq!(second.total, 25);
        assert_eq!(second.entries.len(), 5);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let log = MessageLog::new(3);
        for n in 0..5 {
            log.record(entry("a", n, sent(), MessageKind::Text));
        }
        assert_eq!(log.len(), 3);
        let page = log.query(&LogQuery::default());
        assert_eq!(page.entries.last().unwrap().recipient.as_str(), "+15550000002");
    }

    #[test]
    fn page_far_past_the_end_is_empty() {
        let log = MessageLog::new(10);
        log.record(entry("a", 1, sent(), MessageKind::Text));
        let page = log.query(&LogQuery {
            page: Some(usize::MAX),
            limit: Some(100),
            ..LogQuery::default()
        });
        assert_eq!(page.total, 1);
        assert_eq!(page.page, usize::MAX);
        assert!(page.entries.is_empty());
    }
}
