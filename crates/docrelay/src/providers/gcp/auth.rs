//! GCP authentication using a service account key
//!
//! Handles OAuth2 token generation for the Document AI REST API.

use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::providers::token::{self, TokenCache};

const SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const JWT_LIFETIME_SECS: i64 = 3600;
/// Refresh this long before the token actually expires
const TOKEN_REFRESH_BUFFER_SECS: u64 = 300;

#[derive(serde::Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    token_uri: String,
}

/// GCP authentication manager
pub struct GcpAuth {
    project_id: String,
    key: ServiceAccountKey,
    http: reqwest::Client,
    tokens: TokenCache,
}

impl GcpAuth {
    /// Create from a service account JSON key file
    pub fn from_service_account(key_path: impl AsRef<Path>, project_id: String) -> Result<Self> {
        let key_path = key_path.as_ref();
        let content = std::fs::read_to_string(key_path).map_err(|e| {
            Error::Config(format!(
                "Failed to read service account key {}: {}",
                key_path.display(),
                e
            ))
        })?;
        let key: ServiceAccountKey = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Invalid service account key format: {}", e)))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            project_id,
            key,
            http,
            tokens: TokenCache::new(),
        })
    }

    /// Get project ID
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Get a valid access token (refreshing if needed)
    pub async fn get_token(&self) -> Result<String> {
        self.tokens.get_or_refresh(|| self.refresh_token()).await
    }

    /// Drop the cached token after the API rejected it
    pub async fn invalidate(&self) {
        self.tokens.invalidate().await;
    }

    /// Exchange a service-account JWT for an access token
    async fn refresh_token(&self) -> Result<(String, Duration)> {
        let now = token::unix_now();
        let claims = serde_json::json!({
            "iss": self.key.client_email,
            "scope": SCOPE,
            "aud": self.key.token_uri,
            "iat": now,
            "exp": now + JWT_LIFETIME_SECS,
        });
        let jwt = token::sign_jwt(&claims, &self.key.private_key)?;

        let response = self
            .http
            .post(&self.key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", jwt.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::transient("gcp-auth", format!("Token exchange request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::from_status("gcp-auth", status, &body));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::transient("gcp-auth", format!("Failed to parse token response: {}", e)))?;
        let access_token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::transient("gcp-auth", "token response has no access_token"))?
            .to_string();
        let lifetime = token::expires_in(body.get("expires_in"), JWT_LIFETIME_SECS as u64);

        Ok((
            access_token,
            Duration::from_secs(lifetime.saturating_sub(TOKEN_REFRESH_BUFFER_SECS)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_key_file_validation() {
        assert!(matches!(
            GcpAuth::from_service_account("/nonexistent.json", "p".into()),
            Err(Error::Config(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"client_email":"a@b.iam","private_key":"k","token_uri":"https://oauth2.googleapis.com/token"}}"#).unwrap();
        let auth = GcpAuth::from_service_account(file.path(), "proj".into()).unwrap();
        assert_eq!(auth.project_id(), "proj");

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        write!(bad, r#"{{"client_email":"a@b.iam"}}"#).unwrap();
        assert!(matches!(
            GcpAuth::from_service_account(bad.path(), "proj".into()),
            Err(Error::Config(_))
        ));
    }
}
