//! Google Document AI client
//!
//! Sends one page image to a trained processor through the synchronous
//! `:process` REST endpoint and returns the raw response for the strict
//! normalizer.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use reqwest::StatusCode;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use super::auth::GcpAuth;
use crate::config::ExtractionConfig;
use crate::error::{Error, Result};
use crate::providers::ExtractionService;

/// Document AI processor client
pub struct DocumentAiClient {
    auth: Arc<GcpAuth>,
    http: reqwest::Client,
    /// e.g. "projects/my-project/locations/us/processors/abc123"
    processor_name: String,
    location: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProcessRequest {
    raw_document: RawDocument,
    skip_human_review: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RawDocument {
    content: String,
    mime_type: String,
}

impl DocumentAiClient {
    /// Create a client bound to the configured processor (and version)
    pub fn new(auth: Arc<GcpAuth>, config: &ExtractionConfig) -> Result<Self> {
        if config.processor_id.is_empty() {
            return Err(Error::Config("extraction.processor_id is required".to_string()));
        }
        let processor_name = processor_name(
            auth.project_id(),
            &config.location,
            &config.processor_id,
            config.processor_version.as_deref(),
        );
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            auth,
            http,
            processor_name,
            location: config.location.clone(),
        })
    }

    /// Full resource name of the processor
    pub fn processor_name(&self) -> &str {
        &self.processor_name
    }

    fn endpoint(&self) -> String {
        endpoint(&self.location, &self.processor_name)
    }
}

fn processor_name(project: &str, location: &str, processor_id: &str, version: Option<&str>) -> String {
    let base = format!("projects/{}/locations/{}/processors/{}", project, location, processor_id);
    match version.filter(|v| !v.is_empty()) {
        Some(v) => format!("{}/processorVersions/{}", base, v),
        None => base,
    }
}

fn endpoint(location: &str, processor_name: &str) -> String {
    format!(
        "https://{}-documentai.googleapis.com/v1/{}:process",
        location, processor_name
    )
}

#[async_trait]
impl ExtractionService for DocumentAiClient {
    async fn process(&self, content: &[u8], mime_type: &str) -> Result<serde_json::Value> {
        let token = self.auth.get_token().await?;
        let request = ProcessRequest {
            raw_document: RawDocument {
                content: BASE64.encode(content),
                mime_type: mime_type.to_string(),
            },
            skip_human_review: true,
        };

        tracing::debug!(processor = %self.processor_name, size = content.len(), "Sending to Document AI");

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&token)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::transient("document-ai", format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status == StatusCode::UNAUTHORIZED {
                self.auth.invalidate().await;
                return Err(Error::transient("document-ai", "access token rejected"));
            }
            return Err(Error::from_status("document-ai", status, &body));
        }

        response
            .json()
            .await
            .map_err(|e| Error::validation(format!("Document AI response is not JSON: {}", e)))
    }

    fn processor_ref(&self) -> String {
        self.processor_name.clone()
    }
}
