//! Core types for the relay

pub mod document;
pub mod event;
pub mod task;

pub use document::{
    CsvArtifact, ExtractedDocument, Field, ImageAsset, NotificationMessage, ProcessedImage,
    Record, Rotation, TerminalStatus, UploadResult,
};
pub use event::{ChatEvent, EventId, Recipient, TaskPayload};
pub use task::{QueuedTask, TaskStage, TaskStatus};
