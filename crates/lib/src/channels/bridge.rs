//! HTTP bridge to the messaging network: issues pairing artifacts and delivers messages.
//!
//! The bridge owns the actual network connection per tenant. Herald asks it for pairing
//! payloads and hands it one message per call; approval and drop signals come back through
//! the gateway's `/bridge/events` route (see [`super::BridgeEvent`]).

use super::transport::{Ack, ChannelIdentity, ChannelTransport, TransportError};
use crate::message::{MessageKind, MessageSpec};
use crate::recipients::Recipient;
use crate::session::{PairingArtifact, PairingProvider, PairingUnavailable};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Serialize;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundMessage<'a> {
    to: &'a str,
    kind: MessageKind,
    #[serde(skip_serializing_if = "str::is_empty")]
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    media_ref: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_name: Option<&'a str>,
}

/// reqwest client for one bridge base URL.
pub struct BridgeClient {
    base: Url,
    client: reqwest::Client,
}

impl BridgeClient {
    pub fn new(base_url: &str) -> Result<Self, String> {
        let base = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| format!("invalid bridge url {}: {}", base_url, e))?;
        if base.cannot_be_a_base() {
            return Err(format!("invalid bridge url {}", base_url));
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self { base, client })
    }

    pub fn base_url(&self) -> &str {
        self.base.as_str()
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

/// Map a non-success HTTP status to a transport error. Throttling and server faults are retryable.
pub fn classify_status(status: StatusCode, body: &str) -> TransportError {
    let detail = if body.trim().is_empty() {
        status.to_string()
    } else {
        format!("{} {}", status, body.trim())
    };
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        TransportError::Transient(detail)
    } else {
        TransportError::Rejected(detail)
    }
}

fn classify_request_error(e: &reqwest::Error) -> TransportError {
    if e.is_builder() {
        TransportError::Rejected(e.to_string())
    } else {
        TransportError::Transient(e.to_string())
    }
}

#[async_trait]
impl PairingProvider for BridgeClient {
    async fn issue(&self, tenant_id: &str) -> Result<PairingArtifact, PairingUnavailable> {
        let url = self.endpoint(&["tenants", tenant_id, "pairing"]);
        let res = self
            .client
            .post(url)
            .send()
            .await
            .map_err(|e| PairingUnavailable(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            log::warn!("bridge pairing for {} failed: {} {}", tenant_id, status, body);
            return Err(PairingUnavailable(format!("bridge returned {}", status)));
        }
        res.json::<PairingArtifact>()
            .await
            .map_err(|e| PairingUnavailable(format!("invalid pairing response: {}", e)))
    }
}

#[async_trait]
impl ChannelTransport for BridgeClient {
    async fn send(
        &self,
        channel: &ChannelIdentity,
        recipient: &Recipient,
        message: &MessageSpec,
    ) -> Result<Ack, TransportError> {
        let url = self.endpoint(&["channels", channel.as_str(), "messages"]);
        let body = OutboundMessage {
            to: recipient.as_str(),
            kind: message.kind,
            text: &message.text,
            media_ref: message.media_ref.as_deref(),
            file_name: message.file_name.as_deref(),
        };
        let res = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_request_error(&e))?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        // an empty or non-JSON body still means the bridge accepted the message
        let text = res.text().await.unwrap_or_default();
        Ok(serde_json::from_str::<Ack>(&text).unwrap_or_default())
    }
}

/// Transport used when no bridge is configured: every send is rejected.
#[derive(Debug, Default)]
pub struct UnconfiguredTransport;

#[async_trait]
impl ChannelTransport for UnconfiguredTransport {
    async fn send(
        &self,
        _channel: &ChannelIdentity,
        _recipient: &Recipient,
        _message: &MessageSpec,
    ) -> Result<Ack, TransportError> {
        Err(TransportError::Rejected("no bridge configured".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_retryable());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, "").is_retryable());
        assert_eq!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, " bad media "),
            TransportError::Rejected("422 Unprocessable Entity bad media".to_string())
        );
        assert!(!classify_status(StatusCode::NOT_FOUND, "").is_retryable());
    }

    #[test]
    fn endpoints_escape_segments() {
        let client = BridgeClient::new("http://127.0.0.1:3100/api/").unwrap();
        assert_eq!(
            client.endpoint(&["tenants", "acme corp", "pairing"]).as_str(),
            "http://127.0.0.1:3100/api/tenants/acme%20corp/pairing"
        );
        assert_eq!(
            client.endpoint(&["channels", "+15550001111", "messages"]).as_str(),
            "http://127.0.0.1:3100/api/channels/+15550001111/messages"
        );
        assert!(BridgeClient::new("not a url").is_err());
    }

    #[test]
    fn outbound_body_omits_empty_fields() {
        let body = OutboundMessage {
            to: "+15550001111",
            kind: MessageKind::Text,
            text: "hi",
            media_ref: None,
            file_name: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json, serde_json::json!({"to": "+15550001111", "kind": "text", "text": "hi"}));
    }

    #[tokio::test]
    async fn unconfigured_transport_rejects() {
        let to: Recipient = "+15550001111".parse().unwrap();
        let err = UnconfiguredTransport
            .send(&ChannelIdentity::new("x"), &to, &MessageSpec::text("hi"))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
