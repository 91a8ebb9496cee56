//! Session manager: the single writer for every tenant's channel session.
//!
//! Each tenant has a slot holding an async mutex around its [`Session`] plus a `watch`
//! channel carrying the latest snapshot. Transitions take the mutex (so two callers never
//! issue two artifacts for one tenant); status reads only borrow the watch value.
//! Sends go through a [`SessionLease`], which is the only way to reach the transport.

use super::pairing::{IssuedArtifact, PairingProvider, PairingUnavailable};
use super::state::{ConnectOutcome, InvalidTransition, Session, SessionState, TenantId};
use crate::channels::{Ack, ChannelIdentity, ChannelTransport, TransportError};
use crate::config::PairingConfig;
use crate::message::MessageSpec;
use crate::recipients::Recipient;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    PairingUnavailable(#[from] PairingUnavailable),
    #[error("tenant {tenant_id} is not connected (state: {state})")]
    NotConnected {
        tenant_id: TenantId,
        state: SessionState,
    },
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

/// Published on every state change; the gateway forwards these as `session.state` events.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub tenant_id: TenantId,
    pub from: SessionState,
    pub to: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ConnectOutcome>,
    pub at: DateTime<Utc>,
}

struct TenantSlot {
    session: Mutex<Session>,
    status: watch::Sender<Session>,
}

impl TenantSlot {
    fn new(tenant_id: &str) -> Self {
        let session = Session::new(tenant_id, Utc::now());
        let (status, _) = watch::channel(session.clone());
        Self {
            session: Mutex::new(session),
            status,
        }
    }
}

pub struct SessionManager {
    tenants: RwLock<HashMap<TenantId, Arc<TenantSlot>>>,
    provider: Arc<dyn PairingProvider>,
    transport: Arc<dyn ChannelTransport>,
    config: PairingConfig,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new(
        provider: Arc<dyn PairingProvider>,
        transport: Arc<dyn ChannelTransport>,
        config: PairingConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            tenants: RwLock::new(HashMap::new()),
            provider,
            transport,
            config,
            events,
        }
    }

    async fn slot(&self, tenant_id: &str) -> Arc<TenantSlot> {
        if let Some(slot) = self.tenants.read().await.get(tenant_id) {
            return slot.clone();
        }
        self.tenants
            .write()
            .await
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(TenantSlot::new(tenant_id)))
            .clone()
    }

    async fn existing_slot(&self, tenant_id: &str) -> Option<Arc<TenantSlot>> {
        self.tenants.read().await.get(tenant_id).cloned()
    }

    fn publish(
        &self,
        slot: &TenantSlot,
        session: &Session,
        from: SessionState,
        outcome: Option<ConnectOutcome>,
    ) {
        slot.status.send_replace(session.clone());
        if from != session.state {
            log::info!(
                "session {}: {} -> {}",
                session.tenant_id,
                from,
                session.state
            );
            let _ = self.events.send(SessionEvent {
                tenant_id: session.tenant_id.clone(),
                from,
                to: session.state,
                outcome,
                at: session.last_transition_at,
            });
        }
    }

    /// Subscribe to state changes of all tenants.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Watch one tenant's session snapshot.
    pub async fn watch(&self, tenant_id: &str) -> watch::Receiver<Session> {
        self.slot(tenant_id).await.status.subscribe()
    }

    /// Current session snapshot. Never waits on an in-progress transition and never mutates.
    pub async fn get_status(&self, tenant_id: &str) -> Session {
        match self.existing_slot(tenant_id).await {
            Some(slot) => slot.status.borrow().clone(),
            None => Session::new(tenant_id, Utc::now()),
        }
    }

    /// Snapshots of every tenant seen so far, ordered by tenant id.
    pub async fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .tenants
            .read()
            .await
            .values()
            .map(|slot| slot.status.borrow().clone())
            .collect();
        sessions.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        sessions
    }

    /// Start pairing from `Disconnected`: obtain an artifact and move to `AwaitingApproval`.
    ///
    /// While pairing is underway or the tenant is connected this is a no-op returning the
    /// current session. A stale artifact is expired first, so the caller gets a fresh one.
    pub async fn request_connection(&self, tenant_id: &str) -> Result<Session, SessionError> {
        let slot = self.slot(tenant_id).await;
        let mut session = slot.session.lock().await;
        let now = Utc::now();

        if session.expire_if_stale(now) {
            self.publish(&slot, &session, SessionState::AwaitingApproval, None);
        }
        let from = session.state;
        if !session.begin_pairing(now)? {
            log::debug!("session {}: pairing request ignored while {}", tenant_id, from);
            return Ok(session.clone());
        }
        self.publish(&slot, &session, from, None);

        let issued = match tokio::time::timeout(
            self.config.issue_timeout(),
            self.provider.issue(tenant_id),
        )
        .await
        {
            Ok(Ok(artifact)) => artifact,
            Ok(Err(e)) => {
                self.fail_pairing(&slot, &mut session);
                return Err(e.into());
            }
            Err(_) => {
                self.fail_pairing(&slot, &mut session);
                return Err(PairingUnavailable("pairing provider timed out".to_string()).into());
            }
        };

        let issued_at = Utc::now();
        let artifact = IssuedArtifact::stamp(issued, issued_at, self.config.artifact_ttl());
        session.pairing_issued(artifact, issued_at)?;
        self.publish(&slot, &session, SessionState::PairingRequested, None);
        Ok(session.clone())
    }

    fn fail_pairing(&self, slot: &TenantSlot, session: &mut Session) {
        session.pairing_failed(Utc::now());
        log::warn!("session {}: pairing artifact issuance failed", session.tenant_id);
        self.publish(slot, session, SessionState::PairingRequested, None);
    }

    /// Approval or resume signal from the transport layer.
    pub async fn on_approval_detected(
        &self,
        tenant_id: &str,
        channel: ChannelIdentity,
    ) -> Result<ConnectOutcome, SessionError> {
        let slot = self.slot(tenant_id).await;
        let mut session = slot.session.lock().await;
        let from = session.state;
        let outcome = session.approve(channel, Utc::now())?;
        self.publish(&slot, &session, from, Some(outcome));
        Ok(outcome)
    }

    /// The channel dropped without user action: `Connected -> Reconnecting`.
    /// Leases bound to the previous connection stop being active.
    pub async fn on_channel_dropped(&self, tenant_id: &str) -> Result<Session, SessionError> {
        let slot = self.slot(tenant_id).await;
        let mut session = slot.session.lock().await;
        let from = session.state;
        session.channel_dropped(Utc::now())?;
        self.publish(&slot, &session, from, None);
        Ok(session.clone())
    }

    /// Move to `Disconnected` from any state. Invalidates the pairing artifact and every
    /// lease on this tenant, which stops bound dispatch workers from taking new items.
    pub async fn disconnect(&self, tenant_id: &str) -> Session {
        let Some(slot) = self.existing_slot(tenant_id).await else {
            return Session::new(tenant_id, Utc::now());
        };
        let mut session = slot.session.lock().await;
        let from = session.disconnect(Utc::now());
        self.publish(&slot, &session, from, None);
        session.clone()
    }

    /// Expire the tenant's pairing artifact if it is past `expires_at`. Returns true if it expired.
    pub async fn expire_pairing_if_stale(&self, tenant_id: &str, now: DateTime<Utc>) -> bool {
        let Some(slot) = self.existing_slot(tenant_id).await else {
            return false;
        };
        let mut session = slot.session.lock().await;
        let expired = session.expire_if_stale(now);
        if expired {
            self.publish(&slot, &session, SessionState::AwaitingApproval, None);
        }
        expired
    }

    /// Run [`Self::expire_pairing_if_stale`] for every tenant currently awaiting approval.
    pub async fn expire_all_stale(&self, now: DateTime<Utc>) -> Vec<TenantId> {
        let awaiting: Vec<TenantId> = self
            .tenants
            .read()
            .await
            .iter()
            .filter(|(_, slot)| slot.status.borrow().state == SessionState::AwaitingApproval)
            .map(|(id, _)| id.clone())
            .collect();
        let mut expired = Vec::new();
        for tenant_id in awaiting {
            if self.expire_pairing_if_stale(&tenant_id, now).await {
                expired.push(tenant_id);
            }
        }
        expired
    }

    /// Periodically expire stale artifacts until `running` is cleared.
    pub fn spawn_expiry_sweeper(self: Arc<Self>, running: Arc<AtomicBool>) -> JoinHandle<()> {
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                let expired = self.expire_all_stale(Utc::now()).await;
                if !expired.is_empty() {
                    log::debug!("expired pairing for {} tenant(s)", expired.len());
                }
            }
            log::info!("session expiry sweeper stopped");
        })
    }

    /// Bind to the tenant's current connection. Fails unless the tenant is `Connected`.
    pub async fn lease(&self, tenant_id: &str) -> Result<SessionLease, SessionError> {
        let slot = self.slot(tenant_id).await;
        let status = slot.status.subscribe();
        let (channel, generation) = {
            let current = status.borrow();
            match (&current.state, &current.channel_identity) {
                (SessionState::Connected, Some(channel)) => (channel.clone(), current.generation),
                (state, _) => {
                    return Err(SessionError::NotConnected {
                        tenant_id: tenant_id.to_string(),
                        state: *state,
                    })
                }
            }
        };
        Ok(SessionLease {
            tenant_id: tenant_id.to_string(),
            channel,
            generation,
            status,
            transport: self.transport.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeaseSendError {
    #[error("session {0} is no longer connected")]
    SessionClosed(TenantId),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Read-only handle on one tenant connection, shared by dispatch workers.
///
/// Active only while the tenant stays `Connected` on the same generation; a disconnect,
/// a drop to `Reconnecting`, or a later reconnect all end it.
#[derive(Clone)]
pub struct SessionLease {
    tenant_id: TenantId,
    channel: ChannelIdentity,
    generation: u64,
    status: watch::Receiver<Session>,
    transport: Arc<dyn ChannelTransport>,
}

impl SessionLease {
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn channel(&self) -> &ChannelIdentity {
        &self.channel
    }

    pub fn is_active(&self) -> bool {
        let current = self.status.borrow();
        current.state == SessionState::Connected && current.generation == self.generation
    }

    /// Current state of the underlying session (for reporting why a lease ended).
    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    /// Resolves once the lease is no longer active.
    pub async fn closed(&self) {
        let mut status = self.status.clone();
        while self.is_active() {
            if status.changed().await.is_err() {
                return;
            }
        }
    }

    pub async fn send(
        &self,
        recipient: &Recipient,
        message: &MessageSpec,
    ) -> Result<Ack, LeaseSendError> {
        if !self.is_active() {
            return Err(LeaseSendError::SessionClosed(self.tenant_id.clone()));
        }
        Ok(self.transport.send(&self.channel, recipient, message).await?)
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("tenant_id", &self.tenant_id)
            .field("channel", &self.channel)
            .field("generation", &self.generation)
            .finish()
    }
}
