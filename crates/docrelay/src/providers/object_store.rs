//! Object storage sink trait and construction from configuration

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::SinkConfig;
use crate::error::Result;

/// A storage backend that accepts keyed objects.
///
/// `put` must be an overwrite: putting the same key twice leaves one object
/// holding the latest bytes.
///
/// Implementations:
/// - `GcsSink`: Google Cloud Storage
/// - `S3Sink`: S3-compatible object storage
/// - `FilesystemSink`: local directory
/// - `MemorySink`: in-process map
#[async_trait]
pub trait ObjectSink: Send + Sync {
    /// Sink name for logs and upload results
    fn name(&self) -> &str;

    /// Store `bytes` under `key`
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()>;

    /// Check if the backend is reachable
    async fn health_check(&self) -> Result<bool>;
}

/// Build a sink from configuration
pub async fn build_sink(name: &str, config: &SinkConfig) -> Result<Arc<dyn ObjectSink>> {
    let sink: Arc<dyn ObjectSink> = match config {
        SinkConfig::Filesystem { root } => {
            Arc::new(super::filesystem::FilesystemSink::new(name, root.clone())?)
        }
        SinkConfig::S3 {
            bucket,
            region,
            endpoint,
            access_key_id,
            secret_access_key,
        } => Arc::new(super::s3::S3Sink::new(
            name,
            super::s3::S3Credentials {
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
            },
            bucket.clone(),
            region.clone(),
            endpoint.clone(),
        )?),
        #[cfg(feature = "gcp")]
        SinkConfig::Gcs { bucket } => Arc::new(super::gcp::GcsSink::new(name, bucket.clone()).await?),
        #[cfg(not(feature = "gcp"))]
        SinkConfig::Gcs { .. } => {
            return Err(crate::error::Error::Config(format!(
                "sink {} uses GCS but the gcp feature is disabled",
                name
            )))
        }
    };

    tracing::info!(sink = name, backend = config.kind(), "Object sink ready");
    Ok(sink)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_filesystem_sink() {
        let dir = tempfile::tempdir().unwrap();
        let sink = build_sink(
            "secondary",
            &SinkConfig::Filesystem {
                root: dir.path().join("out"),
            },
        )
        .await
        .unwrap();
        assert_eq!(sink.name(), "secondary");
        assert!(sink.health_check().await.unwrap());
    }
}
