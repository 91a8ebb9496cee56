//! Inbound bridge events: connection signals the bridge posts back to the gateway.

use super::transport::ChannelIdentity;
use crate::session::TenantId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BridgeEventKind {
    /// The end user approved the pairing artifact, or a dropped channel resumed.
    Approved,
    /// The channel dropped without user action.
    Dropped,
    /// The end user unlinked the device.
    LoggedOut,
}

/// Body of `POST /bridge/events`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeEvent {
    pub tenant_id: TenantId,
    pub event: BridgeEventKind,
    /// Required for `approved`.
    #[serde(default)]
    pub channel_identity: Option<ChannelIdentity>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wire_format() {
        let e: BridgeEvent = serde_json::from_str(
            r#"{"tenantId":"acme","event":"approved","channelIdentity":"+15550001111"}"#,
        )
        .unwrap();
        assert_eq!(e.event, BridgeEventKind::Approved);
        assert_eq!(e.channel_identity.unwrap().as_str(), "+15550001111");
        let e: BridgeEvent = serde_json::from_str(r#"{"tenantId":"acme","event":"loggedOut"}"#).unwrap();
        assert_eq!(e.event, BridgeEventKind::LoggedOut);
    }
}
