//! Callback signature verification
//!
//! The platform signs the raw request body with HMAC-SHA256 keyed by the bot
//! secret and sends the Base64 digest in [`SIGNATURE_HEADER`]. Verification
//! runs on the unparsed bytes; the body is only deserialized after it passes.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::hmac;

use crate::error::{Error, Result};

/// Header carrying the Base64 signature
pub const SIGNATURE_HEADER: &str = "X-WORKS-Signature";

/// Compute the Base64 signature of `raw_body`
pub fn sign(raw_body: &[u8], shared_secret: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, shared_secret);
    BASE64.encode(hmac::sign(&key, raw_body).as_ref())
}

/// True iff `header_signature` is the Base64 HMAC-SHA256 of `raw_body`.
///
/// The tag comparison is constant time.
pub fn verify(raw_body: &[u8], header_signature: &[u8], shared_secret: &[u8]) -> bool {
    let key = hmac::Key::new(hmac::HMAC_SHA256, shared_secret);
    verify_with_key(&key, raw_body, header_signature)
}

fn verify_with_key(key: &hmac::Key, raw_body: &[u8], header_signature: &[u8]) -> bool {
    let Ok(tag) = BASE64.decode(header_signature) else {
        return false;
    };
    hmac::verify(key, raw_body, &tag).is_ok()
}

/// Authenticity gate holding the bot secret
#[derive(Clone)]
pub struct SignatureGate {
    key: hmac::Key,
}

impl SignatureGate {
    pub fn new(shared_secret: &str) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, shared_secret.as_bytes()),
        }
    }

    /// Check a callback; a missing header fails like a wrong one
    pub fn check(&self, raw_body: &[u8], header_signature: Option<&[u8]>) -> Result<()> {
        match header_signature {
            Some(sig) if verify_with_key(&self.key, raw_body, sig) => Ok(()),
            _ => Err(Error::Authentication),
        }
    }
}

impl std::fmt::Debug for SignatureGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SignatureGate { .. }")
    }
}
