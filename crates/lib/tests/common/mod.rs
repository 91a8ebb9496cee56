//! In-process collaborators shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use herald::channels::{Ack, ChannelIdentity, ChannelTransport, TransportError};
use herald::config::{DispatchConfig, PairingConfig, RetryConfig};
use herald::dispatch::{CreditLedger, Dispatcher, JobRegistry, MessageLog, Orchestrator};
use herald::message::MessageSpec;
use herald::recipients::Recipient;
use herald::session::{PairingArtifact, PairingProvider, PairingUnavailable, SessionManager};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TENANT: &str = "acme";

/// Issues `artifact-N` payloads and counts calls.
#[derive(Default)]
pub struct CountingProvider {
    pub issued: AtomicUsize,
}

#[async_trait]
impl PairingProvider for CountingProvider {
    async fn issue(&self, _tenant_id: &str) -> Result<PairingArtifact, PairingUnavailable> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(PairingArtifact {
            payload: format!("artifact-{}", n),
            expires_at: None,
        })
    }
}

/// Records every send, flags overlapping sends to one recipient, and replays scripted results.
#[derive(Default)]
pub struct FakeTransport {
    pub delay: Duration,
    /// Completed sends in completion order: (recipient, message text).
    pub calls: Mutex<Vec<(String, String)>>,
    pub in_flight: Mutex<HashSet<String>>,
    pub overlapped: AtomicBool,
    pub script: Mutex<HashMap<String, VecDeque<Result<(), TransportError>>>>,
    /// Sends to this recipient panic.
    pub panic_for: Option<String>,
}

impl FakeTransport {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Queue results for a recipient; once the queue is empty sends succeed.
    pub fn script(&self, recipient: &str, results: Vec<Result<(), TransportError>>) {
        self.script
            .lock()
            .unwrap()
            .insert(recipient.to_string(), results.into());
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn texts_for(&self, recipient: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| r == recipient)
            .map(|(_, t)| t.clone())
            .collect()
    }
}

#[async_trait]
impl ChannelTransport for FakeTransport {
    async fn send(
        &self,
        _channel: &ChannelIdentity,
        recipient: &Recipient,
        message: &MessageSpec,
    ) -> Result<Ack, TransportError> {
        let to = recipient.as_str().to_string();
        if self.panic_for.as_deref() == Some(to.as_str()) {
            panic!("transport blew up for {}", to);
        }
        if !self.in_flight.lock().unwrap().insert(to.clone()) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        tokio::time::sleep(self.delay).await;
        let scripted = self
            .script
            .lock()
            .unwrap()
            .get_mut(&to)
            .and_then(|q| q.pop_front());
        self.in_flight.lock().unwrap().remove(&to);
        self.calls.lock().unwrap().push((to.clone(), message.text.clone()));
        match scripted {
            Some(Err(e)) => Err(e),
            _ => Ok(Ack {
                message_id: Some(format!("msg-{}", to)),
            }),
        }
    }
}

pub fn dispatch_config() -> DispatchConfig {
    DispatchConfig {
        concurrency: 3,
        max_concurrency: 5,
        send_timeout_ms: 1_000,
        retry: RetryConfig {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 4,
        },
        log_capacity: 1_000,
        job_retention_secs: 3_600,
    }
}

pub struct Harness {
    pub sessions: Arc<SessionManager>,
    pub provider: Arc<CountingProvider>,
    pub transport: Arc<FakeTransport>,
    pub ledger: Arc<CreditLedger>,
    pub log: Arc<MessageLog>,
    pub dispatcher: Dispatcher,
}

impl Harness {
    pub fn new(transport: FakeTransport, credits: u64, config: DispatchConfig) -> Self {
        let provider = Arc::new(CountingProvider::default());
        let transport = Arc::new(transport);
        let sessions = Arc::new(SessionManager::new(
            provider.clone(),
            transport.clone(),
            PairingConfig::default(),
        ));
        let ledger = Arc::new(CreditLedger::new(credits));
        let log = Arc::new(MessageLog::new(config.log_capacity));
        let orchestrator = Arc::new(Orchestrator::new(ledger.clone(), config).with_log(log.clone()));
        let dispatcher = Dispatcher::new(sessions.clone(), orchestrator, JobRegistry::new());
        Self {
            sessions,
            provider,
            transport,
            ledger,
            log,
            dispatcher,
        }
    }

    /// Pair and approve the test tenant.
    pub async fn connect(&self) {
        self.sessions.request_connection(TENANT).await.unwrap();
        self.sessions
            .on_approval_detected(TENANT, ChannelIdentity::new("+15550009999"))
            .await
            .unwrap();
    }
}

pub fn recipients(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("+1555000{:04}", i)).collect()
}

pub fn texts(n: usize) -> Vec<MessageSpec> {
    (0..n).map(|i| MessageSpec::text(format!("m{}", i))).collect()
}
