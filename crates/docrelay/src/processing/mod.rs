//! Background processing: durable queue, per-task pipeline and worker pool

pub mod csv_emitter;
pub mod notifier;
pub mod pipeline;
pub mod preprocess;
pub mod retry;
pub mod task_queue;
pub mod uploader;
mod worker;

pub use notifier::{FailureReason, Notifier};
pub use pipeline::{Pipeline, PipelineOutput, ReplayCheck, StageFailure};
pub use retry::RetryPolicy;
pub use task_queue::{EnqueueOutcome, InFlightTask, TaskQueue};
pub use uploader::{DualSinkUploader, UploadReport, CSV_CONTENT_TYPE};
pub use worker::{ProcessingWorker, TaskOutcome};
