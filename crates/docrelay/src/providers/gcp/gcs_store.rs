//! Google Cloud Storage object sink

use async_trait::async_trait;

use google_cloud_storage::client::{Client as GcsClient, ClientConfig};
use google_cloud_storage::http::buckets::get::GetBucketRequest;
use google_cloud_storage::http::objects::upload::{Media, UploadObjectRequest, UploadType};

use crate::error::{Error, Result};
use crate::providers::object_store::ObjectSink;

/// Google Cloud Storage bucket sink
///
/// Credentials come from application default credentials
/// (`GOOGLE_APPLICATION_CREDENTIALS` or the metadata server).
pub struct GcsSink {
    name: String,
    client: GcsClient,
    bucket: String,
}

impl GcsSink {
    pub async fn new(name: &str, bucket: String) -> Result<Self> {
        let config = ClientConfig::default()
            .with_auth()
            .await
            .map_err(|e| Error::Config(format!("Failed to create GCS client: {}", e)))?;

        Ok(Self {
            name: name.to_string(),
            client: GcsClient::new(config),
            bucket,
        })
    }
}

#[async_trait]
impl ObjectSink for GcsSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        let mut media = Media::new(key.to_string());
        media.content_type = content_type.to_string().into();

        self.client
            .upload_object(
                &UploadObjectRequest {
                    bucket: self.bucket.clone(),
                    ..Default::default()
                },
                bytes.to_vec(),
                &UploadType::Simple(media),
            )
            .await
            .map_err(|e| Error::transient(self.name.clone(), format!("GCS upload failed: {}", e)))?;

        tracing::debug!(sink = %self.name, bucket = %self.bucket, key, size = bytes.len(), "Stored object");
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        let result = self
            .client
            .get_bucket(&GetBucketRequest {
                bucket: self.bucket.clone(),
                ..Default::default()
            })
            .await;
        Ok(result.is_ok())
    }
}
