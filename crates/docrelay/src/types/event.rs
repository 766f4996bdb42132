//! Chat platform callback events and queue payloads

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Stable identifier of a source chat message.
///
/// Used as the idempotency key for the queue row and every stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive the id from the stable fields of a callback.
    ///
    /// Platform redeliveries of the same message produce the same id.
    pub fn derive(event: &ChatEvent) -> Self {
        let mut hasher = Sha256::new();
        for part in [
            event.source.user_id.as_deref().unwrap_or(""),
            event.source.channel_id.as_deref().unwrap_or(""),
            event.issued_time.as_deref().unwrap_or(""),
            event.file_id().unwrap_or(""),
        ] {
            hasher.update(part.as_bytes());
            hasher.update(b"|");
        }
        let digest = hex::encode(hasher.finalize());
        Self(format!("evt-{}", &digest[..32]))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Callback body posted by the chat platform
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub source: EventSource,
    #[serde(default)]
    pub issued_time: Option<String>,
    #[serde(default)]
    pub content: Option<EventContent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSource {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventContent {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

impl ChatEvent {
    /// Attachment id of an image or file message
    pub fn file_id(&self) -> Option<&str> {
        if self.event_type != "message" {
            return None;
        }
        let content = self.content.as_ref()?;
        match content.content_type.as_str() {
            "image" | "file" => content.file_id.as_deref().filter(|id| !id.is_empty()),
            _ => None,
        }
    }

    /// Who should hear about the outcome: the user, else the channel
    pub fn recipient(&self) -> Option<Recipient> {
        let non_empty = |s: &Option<String>| s.clone().filter(|v| !v.is_empty());
        non_empty(&self.source.user_id)
            .map(Recipient::User)
            .or_else(|| non_empty(&self.source.channel_id).map(Recipient::Channel))
    }
}

/// Destination of a notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Recipient {
    User(String),
    Channel(String),
}

impl Recipient {
    pub fn id(&self) -> &str {
        match self {
            Recipient::User(id) | Recipient::Channel(id) => id,
        }
    }
}

/// Opaque queue payload created by the ingestion gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub event_id: EventId,
    pub file_id: String,
    pub recipient: Recipient,
    /// Correlates log lines across ingestion and processing
    pub trace_id: String,
}
