//! LINE WORKS bot API client
//!
//! Authenticates with a service-account JWT, downloads message attachments
//! (the API answers with a redirect to the file host, which also requires
//! the bearer token) and sends text messages to users or channels.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, redirect, StatusCode};
use serde_json::json;
use std::time::Duration;

use super::chat::ChatPlatform;
use super::token::{self, TokenCache};
use crate::config::ChatConfig;
use crate::error::{Error, Result};
use crate::types::{ImageAsset, NotificationMessage, Recipient};

/// Refresh this long before the token actually expires
const TOKEN_REFRESH_BUFFER_SECS: u64 = 300;
/// Used when the token response carries no usable `expires_in`
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 86_400;
const JWT_LIFETIME_SECS: i64 = 300;
const DOWNLOAD_TIMEOUT_SECS: u64 = 120;

/// LINE WORKS API 2.0 client scoped to one bot
pub struct LineWorksClient {
    config: ChatConfig,
    private_key: String,
    /// API calls; redirects are handled by hand
    api: reqwest::Client,
    /// File host downloads
    files: reqwest::Client,
    tokens: TokenCache,
}

impl LineWorksClient {
    /// Create the client, reading the service-account key from disk
    pub fn new(config: &ChatConfig) -> Result<Self> {
        let private_key = std::fs::read_to_string(&config.private_key_path).map_err(|e| {
            Error::Config(format!(
                "Failed to read LINE WORKS private key {}: {}",
                config.private_key_path.display(),
                e
            ))
        })?;

        let api = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        let files = reqwest::Client::builder()
            .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            config: config.clone(),
            private_key,
            api,
            files,
            tokens: TokenCache::new(),
        })
    }

    fn bot_url(&self, path: &str) -> String {
        format!(
            "{}/bots/{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_id,
            path
        )
    }

    async fn access_token(&self) -> Result<String> {
        self.tokens.get_or_refresh(|| self.request_token()).await
    }

    /// Exchange a signed JWT assertion for an access token
    async fn request_token(&self) -> Result<(String, Duration)> {
        let now = token::unix_now();
        let claims = json!({
            "iss": self.config.client_id,
            "sub": self.config.service_account,
            "iat": now,
            "exp": now + JWT_LIFETIME_SECS,
        });
        let assertion = token::sign_jwt(&claims, &self.private_key)?;

        let response = self
            .api
            .post(&self.config.token_url)
            .form(&[
                ("assertion", assertion.as_str()),
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("scope", self.config.scope.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::transient("lineworks-auth", e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::from_status("lineworks-auth", status, &body));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::transient("lineworks-auth", format!("unreadable token response: {}", e)))?;
        let access_token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::transient("lineworks-auth", "token response has no access_token"))?
            .to_string();

        let lifetime = token::expires_in(body.get("expires_in"), DEFAULT_TOKEN_LIFETIME_SECS);
        let valid_for = Duration::from_secs(lifetime.saturating_sub(TOKEN_REFRESH_BUFFER_SECS));
        tracing::info!(valid_for_secs = valid_for.as_secs(), "Obtained LINE WORKS access token");

        Ok((access_token, valid_for))
    }

    /// Classify a failed API response, dropping the token on 401
    async fn api_error(&self, operation: &str, response: reqwest::Response) -> Error {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED {
            // Expired or revoked token: the next attempt signs a fresh one
            self.tokens.invalidate().await;
            return Error::transient(operation, format!("access token rejected: {}", body));
        }
        Error::from_status(operation, status, &body)
    }
}

#[async_trait]
impl ChatPlatform for LineWorksClient {
    async fn download_attachment(&self, file_id: &str) -> Result<ImageAsset> {
        let token = self.access_token().await?;
        let url = self.bot_url(&format!("attachments/{}", file_id));

        tracing::debug!(file_id, "Resolving attachment download URL");
        let response = self
            .api
            .get(&url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| Error::transient("lineworks-download", e.to_string()))?;

        let response = if response.status() == StatusCode::FOUND {
            let location = response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| Error::transient("lineworks-download", "redirect without Location header"))?
                .to_string();
            self.files
                .get(&location)
                .bearer_auth(&token)
                .send()
                .await
                .map_err(|e| Error::transient("lineworks-download", e.to_string()))?
        } else {
            response
        };

        if !response.status().is_success() {
            return Err(self.api_error("lineworks-download", response).await);
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .filter(|v| !v.is_empty() && v != "application/octet-stream")
            .unwrap_or_else(|| {
                mime_guess::from_path(response.url().path())
                    .first_or_octet_stream()
                    .to_string()
            });

        let bytes: Bytes = response
            .bytes()
            .await
            .map_err(|e| Error::transient("lineworks-download", e.to_string()))?;

        tracing::info!(file_id, size = bytes.len(), content_type = %content_type, "Downloaded attachment");
        Ok(ImageAsset {
            bytes,
            content_type,
            source_id: file_id.to_string(),
        })
    }

    async fn send_message(&self, message: &NotificationMessage) -> Result<()> {
        let token = self.access_token().await?;
        let url = match &message.recipient {
            Recipient::User(id) => self.bot_url(&format!("users/{}/messages", id)),
            Recipient::Channel(id) => self.bot_url(&format!("channels/{}/messages", id)),
        };

        let response = self
            .api
            .post(&url)
            .bearer_auth(&token)
            .json(&message_body(&message.text))
            .send()
            .await
            .map_err(|e| Error::transient("lineworks-message", e.to_string()))?;

        if !response.status().is_success() {
            return Err(self.api_error("lineworks-message", response).await);
        }

        tracing::info!(recipient = message.recipient.id(), status = message.status.as_str(), "Message sent");
        Ok(())
    }
}

fn message_body(text: &str) -> serde_json::Value {
    json!({
        "content": {
            "type": "text",
            "text": text,
        }
    })
}
