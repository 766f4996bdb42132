//! Callback acceptance: verify, parse, enqueue, acknowledge
//!
//! Everything before the acknowledgement has to fit in the platform's
//! delivery deadline, so nothing here touches the attachment itself.

use std::sync::Arc;
use std::time::Duration;

use super::signature::SignatureGate;
use crate::error::{Error, Result};
use crate::processing::{EnqueueOutcome, TaskQueue};
use crate::types::{ChatEvent, EventId, TaskPayload};

/// What happened to an authentic callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// Durably queued for processing
    Enqueued(EventId),
    /// A redelivery of an event already queued
    Duplicate(EventId),
    /// Authentic but carries nothing to process
    Ignored(&'static str),
}

/// Front door of the relay
pub struct CallbackAcceptor {
    gate: SignatureGate,
    queue: Arc<TaskQueue>,
    ack_deadline: Duration,
}

impl CallbackAcceptor {
    pub fn new(gate: SignatureGate, queue: Arc<TaskQueue>, ack_deadline: Duration) -> Self {
        Self {
            gate,
            queue,
            ack_deadline,
        }
    }

    /// Handle one raw callback.
    ///
    /// The signature is checked before the body is parsed. Returns a
    /// transient error when the task could not be stored within the
    /// acknowledgement deadline, so the platform redelivers.
    pub async fn accept(&self, raw_body: &[u8], signature: Option<&[u8]>) -> Result<AcceptOutcome> {
        if let Err(e) = self.gate.check(raw_body, signature) {
            tracing::warn!(
                body_len = raw_body.len(),
                has_signature = signature.is_some(),
                "Rejected callback with invalid signature"
            );
            return Err(e);
        }

        let event: ChatEvent = match serde_json::from_slice(raw_body) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Ignoring unparseable callback: {}", e);
                return Ok(AcceptOutcome::Ignored("unparseable body"));
            }
        };

        let Some(file_id) = event.file_id() else {
            tracing::debug!(event_type = %event.event_type, "Ignoring callback without attachment");
            return Ok(AcceptOutcome::Ignored("no attachment"));
        };
        let Some(recipient) = event.recipient() else {
            tracing::warn!("Ignoring attachment without a user or channel to answer");
            return Ok(AcceptOutcome::Ignored("no recipient"));
        };

        let event_id = EventId::derive(&event);
        let payload = TaskPayload {
            event_id: event_id.clone(),
            file_id: file_id.to_string(),
            recipient,
            trace_id: uuid::Uuid::new_v4().to_string(),
        };
        tracing::info!(event_id = %event_id, trace_id = %payload.trace_id, "Callback accepted");

        match tokio::time::timeout(self.ack_deadline, self.queue.enqueue(payload)).await {
            Ok(Ok(EnqueueOutcome::Enqueued)) => Ok(AcceptOutcome::Enqueued(event_id)),
            Ok(Ok(EnqueueOutcome::Duplicate)) => Ok(AcceptOutcome::Duplicate(event_id)),
            Ok(Err(e)) => {
                tracing::error!(event_id = %event_id, "Enqueue failed: {}", e);
                Err(Error::transient("queue", e.to_string()))
            }
            Err(_) => {
                tracing::error!(
                    event_id = %event_id,
                    deadline_ms = self.ack_deadline.as_millis() as u64,
                    "Enqueue missed the acknowledgement deadline"
                );
                Err(Error::transient("queue", "enqueue exceeded the acknowledgement deadline"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::ingestion::signature::sign;
    use crate::storage::TaskDb;
    use crate::types::Recipient;
    use serde_json::json;

    const SECRET: &str = "bot-secret";

    fn acceptor() -> (CallbackAcceptor, Arc<TaskQueue>) {
        let queue = Arc::new(TaskQueue::new(TaskDb::in_memory().unwrap(), QueueConfig::default()));
        let acceptor = CallbackAcceptor::new(
            SignatureGate::new(SECRET),
            queue.clone(),
            Duration::from_secs(5),
        );
        (acceptor, queue)
    }

    fn image_body(file_id: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "type": "message",
            "source": { "userId": "u-1", "channelId": "c-1" },
            "issuedTime": "2024-05-01T09:00:00.000Z",
            "content": { "type": "image", "fileId": file_id }
        }))
        .unwrap()
    }

    async fn post(acceptor: &CallbackAcceptor, body: &[u8]) -> Result<AcceptOutcome> {
        let sig = sign(body, SECRET.as_bytes());
        acceptor.accept(body, Some(sig.as_bytes())).await
    }

    #[tokio::test]
    async fn test_valid_callback_enqueued_once() {
        let (acceptor, queue) = acceptor();
        let body = image_body("file-1");

        let first = post(&acceptor, &body).await.unwrap();
        let AcceptOutcome::Enqueued(id) = first else {
            panic!("expected Enqueued, got {:?}", first);
        };
        assert_eq!(post(&acceptor, &body).await.unwrap(), AcceptOutcome::Duplicate(id.clone()));

        let task = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(task.payload.file_id, "file-1");
        assert_eq!(task.payload.recipient, Recipient::User("u-1".into()));
        assert_eq!(queue.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_bad_signature_rejected_before_parsing() {
        let (acceptor, queue) = acceptor();
        let body = image_body("file-1");

        let result = acceptor.accept(&body, Some(b"bm90IGEgc2lnbmF0dXJl")).await;
        assert!(matches!(result, Err(Error::Authentication)));
        let result = acceptor.accept(b"not json at all", None).await;
        assert!(matches!(result, Err(Error::Authentication)));
        assert_eq!(queue.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_authentic_non_attachment_ignored() {
        let (acceptor, queue) = acceptor();
        let text = serde_json::to_vec(&json!({
            "type": "message",
            "source": { "userId": "u-1" },
            "content": { "type": "text", "text": "hello" }
        }))
        .unwrap();

        assert_eq!(post(&acceptor, &text).await.unwrap(), AcceptOutcome::Ignored("no attachment"));
        assert_eq!(post(&acceptor, b"{oops").await.unwrap(), AcceptOutcome::Ignored("unparseable body"));
        assert_eq!(queue.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_attachment_without_recipient_ignored() {
        let (acceptor, _) = acceptor();
        let body = serde_json::to_vec(&json!({
            "type": "message",
            "source": {},
            "content": { "type": "file", "fileId": "file-1" }
        }))
        .unwrap();

        assert_eq!(post(&acceptor, &body).await.unwrap(), AcceptOutcome::Ignored("no recipient"));
    }
}
