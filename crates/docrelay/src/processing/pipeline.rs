//! Per-task processing stages
//!
//! download -> preprocess -> extract -> emit CSV -> upload to both sinks.
//! Every failure is reported with the stage it happened in so the worker
//! can pick the right terminal message.

use std::sync::Arc;

use super::csv_emitter;
use super::preprocess;
use super::retry::RetryPolicy;
use super::task_queue::TaskQueue;
use super::uploader::{DualSinkUploader, UploadReport};
use crate::config::PreprocessConfig;
use crate::error::Error;
use crate::extraction::DocumentExtractor;
use crate::providers::ChatPlatform;
use crate::types::{Rotation, TaskPayload, TaskStage};

/// Error raised by a stage
#[derive(Debug)]
pub struct StageFailure {
    pub stage: TaskStage,
    pub error: Error,
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed: {}", self.stage.as_str(), self.error)
    }
}

/// How a run's CSV compares with the one an earlier attempt uploaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayCheck {
    /// No earlier attempt reached the upload stage
    FirstUpload,
    /// Byte-identical to the earlier upload
    Identical,
    /// Differs from the earlier upload
    Diverged { previous: String },
}

impl ReplayCheck {
    fn compare(previous: Option<String>, checksum: &str) -> Self {
        match previous {
            None => ReplayCheck::FirstUpload,
            Some(previous) if previous == checksum => ReplayCheck::Identical,
            Some(previous) => ReplayCheck::Diverged { previous },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReplayCheck::FirstUpload => "first_upload",
            ReplayCheck::Identical => "identical",
            ReplayCheck::Diverged { .. } => "diverged",
        }
    }
}

/// Committed result of a successful run
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub key: String,
    /// Form title, when the schema reads one
    pub title: Option<String>,
    pub rows: usize,
    pub checksum: String,
    pub replay: ReplayCheck,
    /// Low confidence, or output that changed between attempts
    pub needs_review: bool,
    pub rotation: Rotation,
    pub shadow_removed: bool,
    pub uploads: UploadReport,
}

pub struct Pipeline {
    chat: Arc<dyn ChatPlatform>,
    extractor: DocumentExtractor,
    uploader: DualSinkUploader,
    preprocess: PreprocessConfig,
    download_retry: RetryPolicy,
    archive_review_images: bool,
}

impl Pipeline {
    pub fn new(
        chat: Arc<dyn ChatPlatform>,
        extractor: DocumentExtractor,
        uploader: DualSinkUploader,
        preprocess: PreprocessConfig,
        download_retry: RetryPolicy,
        archive_review_images: bool,
    ) -> Self {
        Self {
            chat,
            extractor,
            uploader,
            preprocess,
            download_retry,
            archive_review_images,
        }
    }

    /// Run all stages for one task, recording progress in the queue
    pub async fn run(&self, payload: &TaskPayload, queue: &TaskQueue) -> std::result::Result<PipelineOutput, StageFailure> {
        let event_id = &payload.event_id;

        enter(queue, payload, TaskStage::Downloading).await?;
        let (asset, _) = self
            .download_retry
            .run("attachment download", || self.chat.download_attachment(&payload.file_id))
            .await;
        let asset = asset.map_err(at(TaskStage::Downloading))?;

        enter(queue, payload, TaskStage::Preprocessing).await?;
        let config = self.preprocess.clone();
        let bytes = asset.bytes.clone();
        let processed = tokio::task::spawn_blocking(move || preprocess::preprocess(&bytes, &config))
            .await
            .map_err(|e| Error::internal(format!("Preprocessing task panicked: {}", e)))
            .and_then(|r| r)
            .map_err(at(TaskStage::Preprocessing))?;
        tracing::info!(
            rotation = processed.rotation.degrees(),
            shadow_removed = processed.shadow_removed,
            "Image preprocessed"
        );

        enter(queue, payload, TaskStage::Extracting).await?;
        let document = match self.extractor.extract(&processed).await {
            Ok(document) => document,
            Err(error) => {
                if matches!(error, Error::UnrecognizedDocument(_)) && self.archive_review_images {
                    self.uploader.archive_review(event_id, &asset, &processed).await;
                }
                return Err(at(TaskStage::Extracting)(error));
            }
        };

        enter(queue, payload, TaskStage::Emitting).await?;
        let artifact = csv_emitter::emit(&document).map_err(at(TaskStage::Emitting))?;

        enter(queue, payload, TaskStage::Uploading).await?;
        let previous = queue
            .swap_checksum(event_id, &artifact.checksum)
            .await
            .map_err(at(TaskStage::Uploading))?;
        let replay = ReplayCheck::compare(previous, &artifact.checksum);
        if let ReplayCheck::Diverged { previous } = &replay {
            // Both sinks are overwritten below, so they still agree with each other
            tracing::warn!(
                previous = %previous,
                checksum = %artifact.checksum,
                "CSV differs from an earlier attempt's upload, flagging for review"
            );
        }
        let needs_review = document.needs_review || matches!(replay, ReplayCheck::Diverged { .. });

        let uploads = self.uploader.upload(event_id, &artifact).await;
        if !uploads.all_succeeded() {
            // Redelivery re-puts the same key, so the healthy sink just gets overwritten
            return Err(StageFailure {
                stage: TaskStage::Uploading,
                error: Error::transient(
                    "sinks",
                    format!("upload failed at {}", uploads.failed_sinks().join(", ")),
                ),
            });
        }

        if needs_review && self.archive_review_images {
            self.uploader.archive_review(event_id, &asset, &processed).await;
        }

        Ok(PipelineOutput {
            key: uploads.key.clone(),
            title: document.title,
            rows: artifact.rows,
            checksum: artifact.checksum,
            replay,
            needs_review,
            rotation: processed.rotation,
            shadow_removed: processed.shadow_removed,
            uploads,
        })
    }
}

fn at(stage: TaskStage) -> impl Fn(Error) -> StageFailure {
    move |error| StageFailure { stage, error }
}

async fn enter(queue: &TaskQueue, payload: &TaskPayload, stage: TaskStage) -> std::result::Result<(), StageFailure> {
    tracing::debug!(stage = stage.as_str(), "Entering stage");
    queue
        .set_stage(&payload.event_id, stage)
        .await
        .map_err(at(stage))
}
