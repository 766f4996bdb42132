//! In-process providers for tests and local runs
//!
//! Each fake can be told to fail its next calls with a transient error to
//! exercise retry paths.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};

use super::{ChatPlatform, ExtractionService, ObjectSink};
use crate::error::{Error, Result};
use crate::types::{ImageAsset, NotificationMessage};

/// Decrement `counter` if positive; true when a failure should be injected
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    content_type: String,
}

/// Object sink backed by a concurrent map
#[derive(Debug, Default)]
pub struct MemorySink {
    name: String,
    objects: DashMap<String, StoredObject>,
    puts: AtomicU32,
    failures: AtomicU32,
}

impl MemorySink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Fail the next `n` puts
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.get(key).map(|o| o.bytes.clone())
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects.get(key).map(|o| o.content_type.clone())
    }

    /// Stored keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Put calls seen, including failed ones
    pub fn puts(&self) -> u32 {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectSink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failures) {
            return Err(Error::transient(self.name.clone(), "injected put failure"));
        }
        self.objects.insert(
            key.to_string(),
            StoredObject {
                bytes: bytes.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Extraction service that answers every request with a canned response
#[derive(Debug)]
pub struct MemoryExtraction {
    response: Mutex<Value>,
    calls: AtomicU32,
    failures: AtomicU32,
}

impl MemoryExtraction {
    pub fn new(response: Value) -> Self {
        Self {
            response: Mutex::new(response),
            calls: AtomicU32::new(0),
            failures: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` requests
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Answer later requests with `response`
    pub fn set_response(&self, response: Value) {
        *self.response.lock() = response;
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExtractionService for MemoryExtraction {
    async fn process(&self, _content: &[u8], _mime_type: &str) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failures) {
            return Err(Error::transient("extraction", "injected failure"));
        }
        Ok(self.response.lock().clone())
    }

    fn processor_ref(&self) -> String {
        "memory".to_string()
    }
}

/// Chat platform holding attachments in memory and recording sent messages
#[derive(Debug, Default)]
pub struct MemoryChat {
    attachments: DashMap<String, ImageAsset>,
    sent: Mutex<Vec<NotificationMessage>>,
    send_failures: AtomicU32,
}

impl MemoryChat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_attachment(&self, file_id: &str, bytes: Vec<u8>, content_type: &str) {
        self.attachments.insert(
            file_id.to_string(),
            ImageAsset {
                bytes: Bytes::from(bytes),
                content_type: content_type.to_string(),
                source_id: file_id.to_string(),
            },
        );
    }

    /// Fail the next `n` sends
    pub fn fail_next_sends(&self, n: u32) {
        self.send_failures.store(n, Ordering::SeqCst);
    }

    /// Messages delivered so far
    pub fn sent(&self) -> Vec<NotificationMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl ChatPlatform for MemoryChat {
    async fn download_attachment(&self, file_id: &str) -> Result<ImageAsset> {
        self.attachments
            .get(file_id)
            .map(|a| a.clone())
            .ok_or_else(|| Error::validation(format!("attachment {} not found", file_id)))
    }

    async fn send_message(&self, message: &NotificationMessage) -> Result<()> {
        if take_failure(&self.send_failures) {
            return Err(Error::transient("chat", "injected send failure"));
        }
        self.sent.lock().push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sink_failure_injection() {
        let sink = MemorySink::new("primary");
        sink.fail_next(1);
        assert!(sink.put("k", b"1", "text/csv").await.unwrap_err().is_transient());
        sink.put("k", b"2", "text/csv").await.unwrap();
        assert_eq!(sink.get("k"), Some(b"2".to_vec()));
        assert_eq!(sink.content_type("k").as_deref(), Some("text/csv"));
        assert_eq!(sink.puts(), 2);
    }

    #[tokio::test]
    async fn test_chat_missing_attachment_is_permanent() {
        let chat = MemoryChat::new();
        let err = chat.download_attachment("nope").await.unwrap_err();
        assert!(matches!(err, Error::PermanentValidation(_)));
    }
}
