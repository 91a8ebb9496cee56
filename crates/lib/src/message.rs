//! Outbound message specs and the ordered sequence sent to every recipient of a bulk job.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Message kind as understood by the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Document,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Document => "document",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message: text body (caption for media), and for media kinds the addressed binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSpec {
    pub kind: MessageKind,
    #[serde(default)]
    pub text: String,
    /// Uploaded-and-addressed binary or remote URL. Required for image and document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl MessageSpec {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            text: text.into(),
            media_ref: None,
            file_name: None,
        }
    }

    pub fn image(media_ref: impl Into<String>, caption: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Image,
            text: caption.into(),
            media_ref: Some(media_ref.into()),
            file_name: None,
        }
    }

    pub fn document(media_ref: impl Into<String>, file_name: Option<String>) -> Self {
        Self {
            kind: MessageKind::Document,
            text: String::new(),
            media_ref: Some(media_ref.into()),
            file_name,
        }
    }

    /// Check kind-specific requirements and fill in a document file name from its media ref when absent.
    pub fn validated(mut self) -> Result<Self, InvalidMessage> {
        match self.kind {
            MessageKind::Text => {
                if self.text.trim().is_empty() {
                    return Err(InvalidMessage::EmptyText);
                }
            }
            MessageKind::Image | MessageKind::Document => {
                let media = self
                    .media_ref
                    .as_deref()
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .ok_or(InvalidMessage::MissingMedia { kind: self.kind })?
                    .to_string();
                if self.kind == MessageKind::Document
                    && self.file_name.as_deref().map_or(true, |n| n.trim().is_empty())
                {
                    self.file_name = Some(file_name_from_ref(&media));
                }
                self.media_ref = Some(media);
            }
        }
        Ok(self)
    }
}

/// Last path segment of a media ref, without query or fragment; "document" when nothing usable remains.
fn file_name_from_ref(media_ref: &str) -> String {
    let path = media_ref.split(['?', '#']).next().unwrap_or(media_ref);
    path.rsplit('/')
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("document")
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidMessage {
    #[error("text message has no text")]
    EmptyText,
    #[error("{kind} message has no media reference")]
    MissingMedia { kind: MessageKind },
    #[error("message #{index}: {source}")]
    AtIndex {
        index: usize,
        #[source]
        source: Box<InvalidMessage>,
    },
}

/// Ordered, validated messages. Every recipient receives them in this order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct MessageSequence {
    messages: Vec<MessageSpec>,
}

impl MessageSequence {
    /// Validate each message; the first invalid one fails the whole sequence.
    pub fn new(messages: Vec<MessageSpec>) -> Result<Self, InvalidMessage> {
        let messages = messages
            .into_iter()
            .enumerate()
            .map(|(index, m)| {
                m.validated().map_err(|e| InvalidMessage::AtIndex {
                    index,
                    source: Box::new(e),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { messages })
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MessageSpec> {
        self.messages.iter()
    }

    pub fn as_slice(&self) -> &[MessageSpec] {
        &self.messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_requires_text() {
        assert_eq!(
            MessageSpec::text("  ").validated().unwrap_err(),
            InvalidMessage::EmptyText
        );
        assert!(MessageSpec::text("hi").validated().is_ok());
    }

    #[test]
    fn media_requires_media_ref() {
        let mut m = MessageSpec::image("x", "");
        m.media_ref = Some(" ".into());
        assert_eq!(
            m.validated().unwrap_err(),
            InvalidMessage::MissingMedia {
                kind: MessageKind::Image
            }
        );
        assert!(MessageSpec::image("https://example.com/a.png", "").validated().is_ok());
    }

    #[test]
    fn document_file_name_derived_from_ref() {
        let m = MessageSpec::document("https://example.com/files/report.pdf?sig=1", None)
            .validated()
            .unwrap();
        assert_eq!(m.file_name.as_deref(), Some("report.pdf"));
        let m = MessageSpec::document("https://example.com/", None).validated().unwrap();
        assert_eq!(m.file_name.as_deref(), Some("document"));
        let m = MessageSpec::document("blob:1", Some("q3.pdf".into())).validated().unwrap();
        assert_eq!(m.file_name.as_deref(), Some("q3.pdf"));
    }

    #[test]
    fn sequence_reports_failing_index() {
        let err = MessageSequence::new(vec![MessageSpec::text("a"), MessageSpec::text("")]).unwrap_err();
        assert!(matches!(err, InvalidMessage::AtIndex { index: 1, .. }));
    }

    #[test]
    fn wire_format_is_camel_case() {
        let m: MessageSpec =
            serde_json::from_str(r#"{"kind":"document","mediaRef":"u","fileName":"f.pdf"}"#).unwrap();
        assert_eq!(m.kind, MessageKind::Document);
        assert_eq!(m.text, "");
        assert_eq!(m.file_name.as_deref(), Some("f.pdf"));
    }
}
