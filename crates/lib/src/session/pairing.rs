//! Pairing artifacts: the handshake payload a tenant scans or approves to bind a channel endpoint.
//!
//! The manager stamps `issued_at`/`expires_at` on whatever a [`PairingProvider`] returns, so
//! providers that do not know an expiry still produce artifacts that age out.

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provider output: opaque payload (e.g. QR contents) and an optional provider-side expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingArtifact {
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// An artifact held by a session in `AwaitingApproval`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedArtifact {
    pub payload: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IssuedArtifact {
    /// Stamp a provider artifact. A provider expiry later than `issued_at + ttl` is capped to the ttl.
    pub fn stamp(artifact: PairingArtifact, issued_at: DateTime<Utc>, ttl: chrono::Duration) -> Self {
        let cap = issued_at.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let expires_at = artifact.expires_at.map_or(cap, |e| e.min(cap));
        Self {
            payload: artifact.payload,
            issued_at,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Upstream pairing capability is unreachable or refused to issue. Retryable by the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("pairing unavailable: {0}")]
pub struct PairingUnavailable(pub String);

/// Produces the handshake artifact shown to the end user.
#[async_trait]
pub trait PairingProvider: Send + Sync {
    async fn issue(&self, tenant_id: &str) -> Result<PairingArtifact, PairingUnavailable>;
}

/// Issues random one-time pairing codes in-process. Used when no bridge is configured.
#[derive(Debug, Default)]
pub struct LocalPairingProvider;

impl LocalPairingProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PairingProvider for LocalPairingProvider {
    async fn issue(&self, tenant_id: &str) -> Result<PairingArtifact, PairingUnavailable> {
        let mut bytes = [0u8; 18];
        getrandom::getrandom(&mut bytes).map_err(|e| PairingUnavailable(format!("getrandom: {}", e)))?;
        let code = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
        Ok(PairingArtifact {
            payload: format!("herald:{}:{}", tenant_id, code),
            expires_at: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_provider_issues_distinct_codes() {
        let provider = LocalPairingProvider::new();
        let a = provider.issue("acme").await.unwrap();
        let b = provider.issue("acme").await.unwrap();
        assert!(a.payload.starts_with("herald:acme:"));
        assert_ne!(a.payload, b.payload);
        assert!(a.expires_at.is_none());
    }

    #[test]
    fn stamp_caps_provider_expiry_to_ttl() {
        let now = Utc::now();
        let ttl = chrono::Duration::seconds(60);
        let far = PairingArtifact {
            payload: "p".into(),
            expires_at: Some(now + chrono::Duration::hours(1)),
        };
        assert_eq!(IssuedArtifact::stamp(far, now, ttl).expires_at, now + ttl);

        let near = PairingArtifact {
            payload: "p".into(),
            expires_at: Some(now + chrono::Duration::seconds(20)),
        };
        let issued = IssuedArtifact::stamp(near, now, ttl);
        assert_eq!(issued.expires_at, now + chrono::Duration::seconds(20));
        assert!(!issued.is_expired(now + chrono::Duration::seconds(20)));
        assert!(issued.is_expired(now + chrono::Duration::seconds(21)));
    }

    #[test]
    fn stamp_near_the_end_of_time_does_not_overflow() {
        let late = DateTime::<Utc>::MAX_UTC - chrono::Duration::seconds(1);
        let artifact = PairingArtifact {
            payload: "p".into(),
            expires_at: None,
        };
        let issued = IssuedArtifact::stamp(artifact, late, chrono::Duration::days(1));
        assert_eq!(issued.expires_at, DateTime::<Utc>::MAX_UTC);
    }
}
