//! Tenant channel sessions: pairing handshake, connection tracking and the send lease.

mod manager;
mod pairing;
mod state;

pub use manager::{LeaseSendError, SessionError, SessionEvent, SessionLease, SessionManager};
pub use pairing::{
    IssuedArtifact, LocalPairingProvider, PairingArtifact, PairingProvider, PairingUnavailable,
};
pub use state::{ConnectOutcome, InvalidTransition, Session, SessionState, TenantId};
