//! Structured-extraction provider trait

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// A document-understanding service that returns entities with confidence
#[async_trait]
pub trait ExtractionService: Send + Sync {
    /// Process one document and return the raw provider response
    async fn process(&self, content: &[u8], mime_type: &str) -> Result<Value>;

    /// Identifies the processor (and version) that produced a response
    fn processor_ref(&self) -> String;
}
