//! Per-tenant session record and its state machine.
//!
//! Transitions are pure methods on [`Session`]; the manager owns locking, pairing
//! issuance and publishing. Every entry into `Connected` bumps `generation`, which is
//! how a dispatch lease tells "still the connection I was bound to" from "connected again".

use super::pairing::IssuedArtifact;
use crate::channels::ChannelIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tenant identifier (opaque string).
pub type TenantId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Disconnected,
    PairingRequested,
    AwaitingApproval,
    Connected,
    Reconnecting,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::PairingRequested => "pairingRequested",
            SessionState::AwaitingApproval => "awaitingApproval",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an approval signal landed. Callers show a first-connect and a resume differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectOutcome {
    /// `AwaitingApproval -> Connected`.
    Fresh,
    /// `Reconnecting -> Connected`, or `Disconnected -> Connected` for a tenant connected earlier in this process.
    Reconnected,
    /// Already connected to the same endpoint; nothing changed.
    AlreadyConnected,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot {action} while {from}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub action: &'static str,
}

/// One tenant's channel session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub tenant_id: TenantId,
    pub state: SessionState,
    /// Present only while `AwaitingApproval`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing: Option<IssuedArtifact>,
    /// Present while `Connected` or `Reconnecting`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_identity: Option<ChannelIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    pub last_transition_at: DateTime<Utc>,
    /// True once the tenant has reached `Connected` in this process.
    pub ever_connected: bool,
    pub generation: u64,
}

impl Session {
    pub fn new(tenant_id: impl Into<TenantId>, now: DateTime<Utc>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            state: SessionState::Disconnected,
            pairing: None,
            channel_identity: None,
            connected_at: None,
            last_transition_at: now,
            ever_connected: false,
            generation: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    fn move_to(&mut self, state: SessionState, now: DateTime<Utc>) {
        self.state = state;
        self.last_transition_at = now;
    }

    /// `Disconnected -> PairingRequested`. Returns false (no-op) when pairing is already underway or connected.
    pub fn begin_pairing(&mut self, now: DateTime<Utc>) -> Result<bool, InvalidTransition> {
        match self.state {
            SessionState::Disconnected => {
                self.move_to(SessionState::PairingRequested, now);
                Ok(true)
            }
            SessionState::PairingRequested | SessionState::AwaitingApproval | SessionState::Connected => {
                Ok(false)
            }
            SessionState::Reconnecting => Err(InvalidTransition {
                from: self.state,
                action: "request pairing",
            }),
        }
    }

    /// `PairingRequested -> AwaitingApproval`, holding the artifact.
    pub fn pairing_issued(
        &mut self,
        artifact: IssuedArtifact,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if self.state != SessionState::PairingRequested {
            return Err(InvalidTransition {
                from: self.state,
                action: "hold a pairing artifact",
            });
        }
        self.pairing = Some(artifact);
        self.move_to(SessionState::AwaitingApproval, now);
        Ok(())
    }

    /// `PairingRequested -> Disconnected` after the provider failed.
    pub fn pairing_failed(&mut self, now: DateTime<Utc>) {
        if self.state == SessionState::PairingRequested {
            self.pairing = None;
            self.move_to(SessionState::Disconnected, now);
        }
    }

    /// Approval (or resume) signal from the transport layer.
    pub fn approve(
        &mut self,
        channel: ChannelIdentity,
        now: DateTime<Utc>,
    ) -> Result<ConnectOutcome, InvalidTransition> {
        let outcome = match self.state {
            SessionState::AwaitingApproval => ConnectOutcome::Fresh,
            SessionState::Reconnecting => ConnectOutcome::Reconnected,
            SessionState::Disconnected if self.ever_connected => ConnectOutcome::Reconnected,
            SessionState::Connected if self.channel_identity.as_ref() == Some(&channel) => {
                return Ok(ConnectOutcome::AlreadyConnected);
            }
            _ => {
                return Err(InvalidTransition {
                    from: self.state,
                    action: "accept approval",
                })
            }
        };
        self.pairing = None;
        self.channel_identity = Some(channel);
        self.connected_at = Some(now);
        self.ever_connected = true;
        self.generation += 1;
        self.move_to(SessionState::Connected, now);
        Ok(outcome)
    }

    /// `Connected -> Reconnecting` when the channel drops without user action. No-op if already reconnecting.
    pub fn channel_dropped(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        match self.state {
            SessionState::Connected => {
                self.move_to(SessionState::Reconnecting, now);
                Ok(())
            }
            SessionState::Reconnecting => Ok(()),
            from => Err(InvalidTransition {
                from,
                action: "mark channel dropped",
            }),
        }
    }

    /// Any state -> `Disconnected`; the outstanding artifact is invalidated. Returns the previous state.
    pub fn disconnect(&mut self, now: DateTime<Utc>) -> SessionState {
        let previous = self.state;
        self.pairing = None;
        self.channel_identity = None;
        self.connected_at = None;
        if previous != SessionState::Disconnected {
            self.move_to(SessionState::Disconnected, now);
        }
        previous
    }

    /// `AwaitingApproval -> Disconnected` once `now` is past the artifact expiry.
    pub fn expire_if_stale(&mut self, now: DateTime<Utc>) -> bool {
        let stale = self.state == SessionState::AwaitingApproval
            && self.pairing.as_ref().map_or(true, |a| a.is_expired(now));
        if stale {
            self.pairing = None;
            self.move_to(SessionState::Disconnected, now);
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn artifact(now: DateTime<Utc>, ttl_secs: i64) -> IssuedArtifact {
        IssuedArtifact {
            payload: "code".to_string(),
            issued_at: now,
            expires_at: now + Duration::seconds(ttl_secs),
        }
    }

    fn awaiting(now: DateTime<Utc>) -> Session {
        let mut s = Session::new("t1", now);
        assert!(s.begin_pairing(now).unwrap());
        s.pairing_issued(artifact(now, 30), now).unwrap();
        s
    }

    #[test]
    fn pairing_then_fresh_connect() {
        let now = Utc::now();
        let mut s = awaiting(now);
        assert_eq!(s.state, SessionState::AwaitingApproval);
        assert!(!s.begin_pairing(now).unwrap());

        let outcome = s.approve(ChannelIdentity::new("+15550001111"), now).unwrap();
        assert_eq!(outcome, ConnectOutcome::Fresh);
        assert!(s.is_connected());
        assert!(s.pairing.is_none());
        assert_eq!(s.generation, 1);
        assert!(!s.begin_pairing(now).unwrap());
    }

    #[test]
    fn drop_and_resume_is_a_reconnection() {
        let now = Utc::now();
        let mut s = awaiting(now);
        let id = ChannelIdentity::new("+15550001111");
        s.approve(id.clone(), now).unwrap();
        s.channel_dropped(now).unwrap();
        assert_eq!(s.state, SessionState::Reconnecting);
        assert!(s.begin_pairing(now).is_err());
        assert_eq!(s.approve(id.clone(), now).unwrap(), ConnectOutcome::Reconnected);
        assert_eq!(s.generation, 2);
        assert_eq!(s.approve(id, now).unwrap(), ConnectOutcome::AlreadyConnected);
        assert_eq!(s.generation, 2);
    }

    #[test]
    fn approval_after_disconnect_depends_on_history() {
        let now = Utc::now();
        let mut fresh = Session::new("t1", now);
        assert!(fresh.approve(ChannelIdentity::new("x"), now).is_err());

        let mut s = awaiting(now);
        s.approve(ChannelIdentity::new("x"), now).unwrap();
        assert_eq!(s.disconnect(now), SessionState::Connected);
        assert!(s.channel_identity.is_none());
        assert_eq!(
            s.approve(ChannelIdentity::new("x"), now).unwrap(),
            ConnectOutcome::Reconnected
        );
    }

    #[test]
    fn stale_artifact_expires_only_after_deadline() {
        let now = Utc::now();
        let mut s = awaiting(now);
        assert!(!s.expire_if_stale(now + Duration::seconds(30)));
        assert!(s.expire_if_stale(now + Duration::seconds(31)));
        assert_eq!(s.state, SessionState::Disconnected);
        assert!(s.pairing.is_none());
        assert!(!s.expire_if_stale(now + Duration::seconds(60)));
    }

    #[test]
    fn pairing_failure_returns_to_disconnected() {
        let now = Utc::now();
        let mut s = Session::new("t1", now);
        s.begin_pairing(now).unwrap();
        s.pairing_failed(now);
        assert_eq!(s.state, SessionState::Disconnected);
        assert!(s.pairing_issued(artifact(now, 5), now).is_err());
    }

    #[test]
    fn drop_requires_connection() {
        let now = Utc::now();
        let mut s = awaiting(now);
        let err = s.channel_dropped(now).unwrap_err();
        assert_eq!(err.from, SessionState::AwaitingApproval);
    }
}
