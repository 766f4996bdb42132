//! Provider abstractions for the chat platform, extraction service and
//! object storage
//!
//! Each external dependency sits behind a trait so the pipeline can run
//! against cloud backends in production and in-memory fakes in tests.

pub mod chat;
pub mod extraction_service;
pub mod filesystem;
pub mod gcp;
pub mod lineworks;
pub mod memory;
pub mod object_store;
pub mod s3;
pub mod token;

pub use chat::ChatPlatform;
pub use extraction_service::ExtractionService;
pub use object_store::{build_sink, ObjectSink};
