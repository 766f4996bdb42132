//! docrelay: chat-delivered document images to CSV records
//!
//! A signed chat callback is verified and durably queued before it is
//! acknowledged. Workers then download the photographed page, correct its
//! orientation and lighting, extract records through Document AI, emit a
//! CSV, replicate it to two independent object stores and tell the sender
//! how it went, exactly once.

pub mod config;
pub mod error;
pub mod extraction;
pub mod ingestion;
pub mod processing;
pub mod providers;
pub mod server;
pub mod storage;
pub mod types;

pub use config::RelayConfig;
pub use error::{Error, Result};
pub use types::{
    document::{CsvArtifact, ExtractedDocument, ProcessedImage},
    event::{ChatEvent, EventId, TaskPayload},
    task::{QueuedTask, TaskStage, TaskStatus},
};
