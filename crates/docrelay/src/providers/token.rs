//! OAuth access-token caching and service-account JWT signing
//!
//! Shared by the chat platform client and GCP auth. Both exchange an RS256
//! JWT assertion for a bearer token and cache it until shortly before it
//! expires.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::error::{Error, Result};

#[derive(Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// Cached bearer token with a stated expiry
#[derive(Default)]
pub struct TokenCache {
    token: RwLock<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached token, or call `refresh` for a new one.
    ///
    /// `refresh` yields the token and how long it may be used.
    pub async fn get_or_refresh<F, Fut>(&self, refresh: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(String, Duration)>>,
    {
        {
            let token = self.token.read().await;
            if let Some(cached) = token.as_ref() {
                if cached.expires_at > Instant::now() {
                    return Ok(cached.access_token.clone());
                }
            }
        }

        let mut token = self.token.write().await;
        // Another caller may have refreshed while we waited
        if let Some(cached) = token.as_ref() {
            if cached.expires_at > Instant::now() {
                return Ok(cached.access_token.clone());
            }
        }

        let (access_token, valid_for) = refresh().await?;
        *token = Some(CachedToken {
            access_token: access_token.clone(),
            expires_at: Instant::now() + valid_for,
        });
        Ok(access_token)
    }

    /// Drop the cached token, e.g. after the API rejected it
    pub async fn invalidate(&self) {
        *self.token.write().await = None;
    }
}

/// Seconds since the Unix epoch
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Sign `claims` as an RS256 JWT with a PKCS#8 PEM private key
pub fn sign_jwt(claims: &serde_json::Value, private_key_pem: &str) -> Result<String> {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"RS256","typ":"JWT"}"#.as_bytes());
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
    let signing_input = format!("{}.{}", header, payload);

    // Keys pasted into JSON or env vars often carry literal "\n"
    let private_key = private_key_pem.replace("\\n", "\n");
    let pem = pem::parse(&private_key)
        .map_err(|e| Error::Config(format!("Failed to parse private key PEM: {}", e)))?;
    let key_pair = ring::signature::RsaKeyPair::from_pkcs8(pem.contents())
        .map_err(|e| Error::Config(format!("Failed to parse private key: {}", e)))?;

    let mut signature = vec![0u8; key_pair.public().modulus_len()];
    key_pair
        .sign(
            &ring::signature::RSA_PKCS1_SHA256,
            &ring::rand::SystemRandom::new(),
            signing_input.as_bytes(),
            &mut signature,
        )
        .map_err(|e| Error::internal(format!("Failed to sign JWT: {}", e)))?;

    Ok(format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(&signature)))
}

/// Read `expires_in` that may arrive as a number or a numeric string
pub fn expires_in(value: Option<&serde_json::Value>, default_secs: u64) -> u64 {
    match value {
        Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(default_secs),
        Some(serde_json::Value::String(s)) => s.trim().parse().unwrap_or(default_secs),
        _ => default_secs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_cache_reuses_until_expiry() {
        let cache = TokenCache::new();
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let refresh = move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Ok((format!("token-{}", n), Duration::from_secs(60)))
        };

        assert_eq!(cache.get_or_refresh(refresh).await.unwrap(), "token-0");
        assert_eq!(cache.get_or_refresh(refresh).await.unwrap(), "token-0");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.invalidate().await;
        assert_eq!(cache.get_or_refresh(refresh).await.unwrap(), "token-1");
    }

    #[tokio::test]
    async fn test_expired_token_refreshed() {
        let cache = TokenCache::new();
        let first = cache
            .get_or_refresh(|| async { Ok(("a".to_string(), Duration::ZERO)) })
            .await
            .unwrap();
        let second = cache
            .get_or_refresh(|| async { Ok(("b".to_string(), Duration::ZERO)) })
            .await
            .unwrap();
        assert_eq!((first.as_str(), second.as_str()), ("a", "b"));
    }

    #[tokio::test]
    async fn test_refresh_error_not_cached() {
        let cache = TokenCache::new();
        let err = cache
            .get_or_refresh(|| async { Err(Error::transient("auth", "down")) })
            .await
            .unwrap_err();
        assert!(err.is_transient());
        let ok = cache
            .get_or_refresh(|| async { Ok(("c".to_string(), Duration::from_secs(5))) })
            .await
            .unwrap();
        assert_eq!(ok, "c");
    }

    #[test]
    fn test_invalid_key_is_config_error() {
        let err = sign_jwt(&json!({ "iss": "x" }), "not a pem").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_expires_in_forms() {
        assert_eq!(expires_in(Some(&json!(3600)), 60), 3600);
        assert_eq!(expires_in(Some(&json!("86400")), 60), 86400);
        assert_eq!(expires_in(Some(&json!("soon")), 60), 60);
        assert_eq!(expires_in(None, 60), 60);
    }
}
