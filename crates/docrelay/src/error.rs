//! Error types for the relay
//!
//! Every failure is classified into one of the taxonomy buckets that drive
//! retry decisions: authentication, transient dependency, permanent
//! validation (including undecodable images) and resource exhaustion.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Relay errors
#[derive(Debug, Error)]
pub enum Error {
    /// Signature missing or mismatched
    #[error("Authentication failed")]
    Authentication,

    /// Network, timeout, rate-limit or 5xx from an external dependency
    #[error("Transient dependency error ({dependency}): {message}")]
    TransientDependency { dependency: String, message: String },

    /// Input that will never succeed on retry
    #[error("Validation error: {0}")]
    PermanentValidation(String),

    /// The page is not one of the accepted forms
    #[error("Unrecognized document: {0}")]
    UnrecognizedDocument(String),

    /// Image bytes could not be decoded
    #[error("Image decode error: {0}")]
    ImageDecode(String),

    /// Outer attempt or age budget exhausted
    #[error("Retry budget exhausted: {0}")]
    ResourceExhaustion(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Task not found
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// The lease expired and the task was delivered again
    #[error("Lease lost: {0}")]
    LeaseLost(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request error
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a transient dependency error
    pub fn transient(dependency: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientDependency {
            dependency: dependency.into(),
            message: message.into(),
        }
    }

    /// Create a permanent validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::PermanentValidation(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Classify an HTTP status returned by a dependency.
    ///
    /// 408, 429 and 5xx are transient; any other failure status is permanent.
    pub fn from_status(dependency: &str, status: reqwest::StatusCode, body: &str) -> Self {
        let message = format!("{} returned {}: {}", dependency, status, truncate(body, 300));
        if status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
        {
            Self::transient(dependency, message)
        } else {
            Self::PermanentValidation(message)
        }
    }

    /// Whether the failure may succeed on a later attempt
    pub fn is_transient(&self) -> bool {
        match self {
            Error::TransientDependency { .. } | Error::Database(_) | Error::Io(_) => true,
            Error::Http(err) => {
                err.is_timeout()
                    || err.is_connect()
                    || err.status().map(|s| s.is_server_error() || s.as_u16() == 429).unwrap_or(false)
            }
            _ => false,
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(err.to_string())
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::ImageDecode(err.to_string())
    }
}

impl From<csv::Error> for Error {
    fn from(err: csv::Error) -> Self {
        Error::Internal(format!("CSV error: {}", err))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            // Never describe why verification failed
            Error::Authentication => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Unauthorized".to_string(),
            ),
            Error::TransientDependency { .. } | Error::Database(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "unavailable",
                "Service temporarily unavailable".to_string(),
            ),
            Error::PermanentValidation(msg)
            | Error::ImageDecode(msg)
            | Error::UnrecognizedDocument(msg) => {
                (StatusCode::BAD_REQUEST, "validation_error", msg.clone())
            }
            Error::ResourceExhaustion(msg) => {
                (StatusCode::TOO_MANY_REQUESTS, "exhausted", msg.clone())
            }
            Error::Config(msg) => (StatusCode::BAD_REQUEST, "config_error", msg.clone()),
            Error::TaskNotFound(id) => (
                StatusCode::NOT_FOUND,
                "not_found",
                format!("Task not found: {}", id),
            ),
            Error::LeaseLost(msg) => (StatusCode::CONFLICT, "lease_lost", msg.clone()),
            Error::Io(err) => (StatusCode::INTERNAL_SERVER_ERROR, "io_error", err.to_string()),
            Error::Json(err) => (StatusCode::BAD_REQUEST, "json_error", err.to_string()),
            Error::Http(err) => (StatusCode::BAD_GATEWAY, "http_error", err.to_string()),
            Error::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.clone())
            }
        };

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let e = Error::from_status("docai", reqwest::StatusCode::SERVICE_UNAVAILABLE, "");
        assert!(e.is_transient());
        let e = Error::from_status("docai", reqwest::StatusCode::TOO_MANY_REQUESTS, "");
        assert!(e.is_transient());
        let e = Error::from_status("docai", reqwest::StatusCode::NOT_FOUND, "no processor");
        assert!(!e.is_transient());
        assert!(matches!(e, Error::PermanentValidation(_)));
    }

    #[test]
    fn test_permanent_kinds_not_transient() {
        assert!(!Error::Authentication.is_transient());
        assert!(!Error::ImageDecode("bad".into()).is_transient());
        assert!(!Error::UnrecognizedDocument("no title".into()).is_transient());
        assert!(!Error::ResourceExhaustion("5 attempts".into()).is_transient());
        assert!(!Error::LeaseLost("evt-1".into()).is_transient());
    }

    #[test]
    fn test_malformed_request_not_transient() {
        let err = reqwest::Client::new().get("not a url").build().unwrap_err();
        assert!(!Error::Http(err).is_transient());
    }

    #[tokio::test]
    async fn test_refused_connection_is_transient() {
        let err = reqwest::Client::new()
            .get("http://127.0.0.1:1/")
            .send()
            .await
            .unwrap_err();
        assert!(err.is_connect());
        assert!(Error::Http(err).is_transient());
    }

    #[test]
    fn test_auth_response_is_generic() {
        let resp = Error::Authentication.into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("領収書です", 2), "領収");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
