//! Replication of CSV artifacts to two independent sinks

use std::sync::Arc;

use super::retry::RetryPolicy;
use crate::providers::ObjectSink;
use crate::types::{CsvArtifact, EventId, ImageAsset, ProcessedImage, UploadResult};

pub const CSV_CONTENT_TYPE: &str = "text/csv; charset=utf-8";

/// Outcome of one upload round
#[derive(Debug, Clone)]
pub struct UploadReport {
    pub key: String,
    /// Primary first, then secondary
    pub results: Vec<UploadResult>,
}

impl UploadReport {
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }

    /// Names of sinks that did not commit
    pub fn failed_sinks(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.sink.as_str())
            .collect()
    }
}

/// Writes every artifact to both sinks under a key derived from the event id
pub struct DualSinkUploader {
    primary: Arc<dyn ObjectSink>,
    secondary: Arc<dyn ObjectSink>,
    key_prefix: String,
    retry: RetryPolicy,
}

impl DualSinkUploader {
    pub fn new(
        primary: Arc<dyn ObjectSink>,
        secondary: Arc<dyn ObjectSink>,
        key_prefix: String,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            primary,
            secondary,
            key_prefix,
            retry,
        }
    }

    /// `{prefix}{event_id}.csv`
    pub fn object_key(&self, event_id: &EventId) -> String {
        format!("{}{}.csv", self.key_prefix, event_id)
    }

    /// Put the artifact to both sinks concurrently.
    ///
    /// Each sink is retried locally; the report says which ones committed.
    pub async fn upload(&self, event_id: &EventId, artifact: &CsvArtifact) -> UploadReport {
        let key = self.object_key(event_id);
        let (primary, secondary) = futures_util::join!(
            self.put_with_retry(self.primary.as_ref(), &key, &artifact.bytes, CSV_CONTENT_TYPE),
            self.put_with_retry(self.secondary.as_ref(), &key, &artifact.bytes, CSV_CONTENT_TYPE),
        );

        for result in [&primary, &secondary] {
            if result.success {
                tracing::info!(sink = %result.sink, key = %key, attempts = result.attempts, "Upload committed");
            } else {
                tracing::warn!(
                    sink = %result.sink,
                    key = %key,
                    attempts = result.attempts,
                    error = result.error.as_deref().unwrap_or(""),
                    "Upload failed"
                );
            }
        }

        UploadReport {
            key,
            results: vec![primary, secondary],
        }
    }

    async fn put_with_retry(&self, sink: &dyn ObjectSink, key: &str, bytes: &[u8], content_type: &str) -> UploadResult {
        let (result, attempts) = self
            .retry
            .run(&format!("upload to {}", sink.name()), || sink.put(key, bytes, content_type))
            .await;

        UploadResult {
            sink: sink.name().to_string(),
            key: key.to_string(),
            success: result.is_ok(),
            attempts,
            error: result.err().map(|e| e.to_string()),
        }
    }

    /// Keep the source and processed images of a result that needs review.
    ///
    /// Best effort: failures are logged and never fail the task.
    pub async fn archive_review(&self, event_id: &EventId, original: &ImageAsset, processed: &ProcessedImage) {
        let prefix = format!("{}review/{}", self.key_prefix, event_id);
        let original_key = format!("{}/original", prefix);
        let processed_key = format!("{}/processed.png", prefix);

        let (a, b) = futures_util::join!(
            self.primary.put(&original_key, &original.bytes, &original.content_type),
            self.primary.put(&processed_key, &processed.bytes, processed.content_type),
        );
        match (a, b) {
            (Ok(()), Ok(())) => {
                tracing::info!(event_id = %event_id, prefix = %prefix, "Archived images for review")
            }
            (a, b) => {
                for e in [a.err(), b.err()].into_iter().flatten() {
                    tracing::warn!(event_id = %event_id, "Failed to archive review image: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::memory::MemorySink;
    use crate::types::Rotation;
    use bytes::Bytes;
    use std::time::Duration;

    fn artifact() -> CsvArtifact {
        let bytes = b"item,amount\r\nTea,300\r\n".to_vec();
        CsvArtifact {
            checksum: crate::processing::csv_emitter::checksum(&bytes),
            bytes,
            rows: 1,
        }
    }

    fn uploader(primary: &Arc<MemorySink>, secondary: &Arc<MemorySink>, retries: u32) -> DualSinkUploader {
        DualSinkUploader::new(
            primary.clone(),
            secondary.clone(),
            "csv/".to_string(),
            RetryPolicy::new(retries, Duration::from_millis(1)),
        )
    }

    #[tokio::test]
    async fn test_writes_same_bytes_to_both() {
        let (p, s) = (Arc::new(MemorySink::new("gcs")), Arc::new(MemorySink::new("s3")));
        let report = uploader(&p, &s, 0).upload(&EventId::new("evt-9"), &artifact()).await;

        assert!(report.all_succeeded());
        assert_eq!(report.key, "csv/evt-9.csv");
        assert_eq!(p.get("csv/evt-9.csv"), Some(artifact().bytes));
        assert_eq!(s.get("csv/evt-9.csv"), Some(artifact().bytes));
        assert_eq!(p.content_type("csv/evt-9.csv").as_deref(), Some(CSV_CONTENT_TYPE));
    }

    #[tokio::test]
    async fn test_transient_sink_error_retried_locally() {
        let (p, s) = (Arc::new(MemorySink::new("gcs")), Arc::new(MemorySink::new("s3")));
        s.fail_next(2);
        let report = uploader(&p, &s, 3).upload(&EventId::new("evt-9"), &artifact()).await;

        assert!(report.all_succeeded());
        assert_eq!(report.results[0].attempts, 1);
        assert_eq!(report.results[1].attempts, 3);
    }

    #[tokio::test]
    async fn test_partial_failure_reported() {
        let (p, s) = (Arc::new(MemorySink::new("gcs")), Arc::new(MemorySink::new("s3")));
        p.fail_next(5);
        let report = uploader(&p, &s, 1).upload(&EventId::new("evt-9"), &artifact()).await;

        assert!(!report.all_succeeded());
        assert_eq!(report.failed_sinks(), vec!["gcs"]);
        assert!(report.results[0].error.is_some());
        assert_eq!(report.results[0].attempts, 2);
        // The healthy sink still committed
        assert!(s.get("csv/evt-9.csv").is_some());
    }

    #[tokio::test]
    async fn test_review_archive_is_best_effort() {
        let (p, s) = (Arc::new(MemorySink::new("gcs")), Arc::new(MemorySink::new("s3")));
        let uploader = uploader(&p, &s, 0);
        let original = ImageAsset {
            bytes: Bytes::from_static(b"jpeg"),
            content_type: "image/jpeg".to_string(),
            source_id: "f-1".to_string(),
        };
        let processed = ProcessedImage {
            bytes: b"png".to_vec(),
            content_type: "image/png",
            rotation: Rotation::Deg0,
            shadow_removed: false,
        };

        uploader.archive_review(&EventId::new("evt-9"), &original, &processed).await;
        assert_eq!(p.keys(), vec!["csv/review/evt-9/original", "csv/review/evt-9/processed.png"]);
        assert!(s.keys().is_empty());

        p.fail_next(2);
        uploader.archive_review(&EventId::new("evt-10"), &original, &processed).await;
        assert_eq!(p.keys().len(), 2);
    }
}
