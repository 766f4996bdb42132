//! S3-compatible object sink with AWS Signature Version 4

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ring::hmac;
use sha2::{Digest, Sha256};
use std::time::Duration;

use super::object_store::ObjectSink;
use crate::error::{Error, Result};

const SERVICE: &str = "s3";
const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Static access key pair
#[derive(Clone)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

/// Path-style S3 PUT sink
pub struct S3Sink {
    name: String,
    http: reqwest::Client,
    credentials: S3Credentials,
    bucket: String,
    region: String,
    endpoint: reqwest::Url,
}

impl S3Sink {
    /// Create a sink; `endpoint` defaults to the regional AWS endpoint
    pub fn new(
        name: &str,
        credentials: S3Credentials,
        bucket: String,
        region: String,
        endpoint: Option<String>,
    ) -> Result<Self> {
        let endpoint = endpoint.unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", region));
        let endpoint = reqwest::Url::parse(&endpoint)
            .map_err(|e| Error::Config(format!("Invalid S3 endpoint {}: {}", endpoint, e)))?;
        if endpoint.host_str().is_none() {
            return Err(Error::Config(format!("S3 endpoint {} has no host", endpoint)));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            name: name.to_string(),
            http,
            credentials,
            bucket,
            region,
            endpoint,
        })
    }

    fn host(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    fn canonical_uri(&self, key: &str) -> String {
        let base = self.endpoint.path().trim_end_matches('/');
        if key.is_empty() {
            format!("{}/{}", base, uri_encode(&self.bucket, false))
        } else {
            format!("{}/{}/{}", base, uri_encode(&self.bucket, false), uri_encode(key, true))
        }
    }

    fn url(&self, canonical_uri: &str) -> String {
        format!("{}://{}{}", self.endpoint.scheme(), self.host(), canonical_uri)
    }

    fn sign(&self, request: &CanonicalRequest<'_>, now: DateTime<Utc>) -> SignedHeaders {
        sign_request(request, &self.credentials, &self.region, now)
    }
}

#[async_trait]
impl ObjectSink for S3Sink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        let uri = self.canonical_uri(key);
        let host = self.host();
        let payload_hash = hex::encode(Sha256::digest(bytes));
        let signed = self.sign(
            &CanonicalRequest {
                method: "PUT",
                uri: &uri,
                host: &host,
                content_type: Some(content_type),
                payload_hash: &payload_hash,
            },
            Utc::now(),
        );

        let response = self
            .http
            .put(self.url(&uri))
            .header("content-type", content_type)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &signed.amz_date)
            .header("authorization", &signed.authorization)
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| Error::transient(self.name.clone(), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::from_status(&self.name, status, &body));
        }

        tracing::debug!(sink = %self.name, bucket = %self.bucket, key, size = bytes.len(), "Stored object");
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        let uri = self.canonical_uri("");
        let host = self.host();
        let payload_hash = hex::encode(Sha256::digest(b""));
        let signed = self.sign(
            &CanonicalRequest {
                method: "HEAD",
                uri: &uri,
                host: &host,
                content_type: None,
                payload_hash: &payload_hash,
            },
            Utc::now(),
        );

        let response = self
            .http
            .head(self.url(&uri))
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &signed.amz_date)
            .header("authorization", &signed.authorization)
            .send()
            .await;

        Ok(matches!(response, Ok(r) if r.status().is_success()))
    }
}

/// The parts of a request covered by the signature
struct CanonicalRequest<'a> {
    method: &'a str,
    uri: &'a str,
    host: &'a str,
    content_type: Option<&'a str>,
    payload_hash: &'a str,
}

struct SignedHeaders {
    amz_date: String,
    authorization: String,
}

fn sign_request(
    request: &CanonicalRequest<'_>,
    credentials: &S3Credentials,
    region: &str,
    now: DateTime<Utc>,
) -> SignedHeaders {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();

    let mut headers: Vec<(&str, &str)> = Vec::with_capacity(4);
    if let Some(content_type) = request.content_type {
        headers.push(("content-type", content_type));
    }
    headers.push(("host", request.host));
    headers.push(("x-amz-content-sha256", request.payload_hash));
    headers.push(("x-amz-date", &amz_date));

    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{}:{}\n", name, value.trim()))
        .collect();
    let signed_headers = headers.iter().map(|(name, _)| *name).collect::<Vec<_>>().join(";");

    let canonical_request = format!(
        "{}\n{}\n\n{}\n{}\n{}",
        request.method, request.uri, canonical_headers, signed_headers, request.payload_hash
    );

    let scope = format!("{}/{}/{}/aws4_request", date, region, SERVICE);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let key = signing_key(&credentials.secret_access_key, &date, region, SERVICE);
    let signature = hex::encode(hmac::sign(&key, string_to_sign.as_bytes()).as_ref());

    SignedHeaders {
        authorization: format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            credentials.access_key_id, scope, signed_headers, signature
        ),
        amz_date,
    }
}

/// Derive the SigV4 signing key for one day, region and service
fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> hmac::Key {
    let step = |key: &[u8], data: &str| {
        hmac::sign(&hmac::Key::new(hmac::HMAC_SHA256, key), data.as_bytes())
    };
    let k_date = step(format!("AWS4{}", secret).as_bytes(), date);
    let k_region = step(k_date.as_ref(), region);
    let k_service = step(k_region.as_ref(), service);
    let k_signing = step(k_service.as_ref(), "aws4_request");
    hmac::Key::new(hmac::HMAC_SHA256, k_signing.as_ref())
}

/// RFC 3986 percent-encoding of a path, optionally keeping '/'
fn uri_encode(input: &str, keep_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            b'/' if keep_slash => out.push('/'),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
