//! Google Cloud Platform provider implementations
//!
//! - Document AI for structured extraction
//! - Google Cloud Storage as an object sink (feature `gcp`)

mod auth;
mod document_ai;
#[cfg(feature = "gcp")]
mod gcs_store;

pub use auth::GcpAuth;
pub use document_ai::DocumentAiClient;
#[cfg(feature = "gcp")]
pub use gcs_store::GcsSink;
