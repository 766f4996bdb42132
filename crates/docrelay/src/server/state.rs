//! Application state for the relay server

use std::sync::Arc;
use std::time::Duration;

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::extraction::DocumentExtractor;
use crate::ingestion::{CallbackAcceptor, SignatureGate};
use crate::processing::{DualSinkUploader, Notifier, Pipeline, ProcessingWorker, RetryPolicy, TaskQueue};
use crate::providers::gcp::{DocumentAiClient, GcpAuth};
use crate::providers::lineworks::LineWorksClient;
use crate::providers::{build_sink, ChatPlatform, ObjectSink};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: RelayConfig,
    /// Durable task queue
    queue: Arc<TaskQueue>,
    /// Signature gate plus enqueue
    acceptor: CallbackAcceptor,
    /// Sinks probed by the readiness check
    primary: Arc<dyn ObjectSink>,
    secondary: Arc<dyn ObjectSink>,
}

impl AppState {
    /// Build every component from configuration.
    ///
    /// Returns the state and the worker pool; the caller decides where the
    /// worker runs.
    pub async fn new(config: RelayConfig) -> Result<(Self, Arc<ProcessingWorker>)> {
        tracing::info!("Initializing relay state...");

        let queue = Arc::new(TaskQueue::open(&config.queue)?);
        let stats = queue.stats().await?;
        tracing::info!(
            pending = stats.pending,
            leased = stats.leased,
            dead_letter = stats.dead_letter,
            "Task queue ready"
        );

        let primary = build_sink("primary", &config.primary_sink).await?;
        let secondary = build_sink("secondary", &config.secondary_sink).await?;
        tracing::info!(
            "Sinks initialized (primary: {}, secondary: {})",
            config.primary_sink.kind(),
            config.secondary_sink.kind()
        );

        let chat: Arc<dyn ChatPlatform> = Arc::new(LineWorksClient::new(&config.chat)?);
        tracing::info!("Chat client initialized (bot {})", config.chat.bot_id);

        let gcp = config
            .gcp
            .as_ref()
            .ok_or_else(|| Error::Config("gcp section is required for Document AI".to_string()))?;
        let auth = Arc::new(GcpAuth::from_service_account(
            &gcp.service_account_key_path,
            gcp.project_id.clone(),
        )?);
        let document_ai = Arc::new(DocumentAiClient::new(auth, &config.extraction)?);
        tracing::info!("Document AI client initialized ({})", document_ai.processor_name());

        let extractor = DocumentExtractor::new(
            document_ai,
            config.extraction.schema.clone(),
            RetryPolicy::new(
                config.extraction.max_retries,
                Duration::from_millis(config.extraction.initial_backoff_ms),
            ),
        );
        let uploader = DualSinkUploader::new(
            primary.clone(),
            secondary.clone(),
            config.upload.key_prefix.clone(),
            RetryPolicy::new(
                config.upload.max_retries,
                Duration::from_millis(config.upload.initial_backoff_ms),
            ),
        );
        let chat_retry = config.chat.retry_policy();
        let pipeline = Pipeline::new(
            chat.clone(),
            extractor,
            uploader,
            config.preprocess.clone(),
            chat_retry,
            config.upload.archive_review_images,
        );
        let worker = Arc::new(ProcessingWorker::new(
            queue.clone(),
            Arc::new(pipeline),
            Arc::new(Notifier::new(chat, chat_retry)),
            &config.worker,
        ));

        let state = Self::from_parts(config, queue, primary, secondary);
        Ok((state, worker))
    }

    /// Assemble state around an existing queue and sinks
    pub fn from_parts(
        config: RelayConfig,
        queue: Arc<TaskQueue>,
        primary: Arc<dyn ObjectSink>,
        secondary: Arc<dyn ObjectSink>,
    ) -> Self {
        let acceptor = CallbackAcceptor::new(
            SignatureGate::new(&config.chat.bot_secret),
            queue.clone(),
            Duration::from_millis(config.server.ack_deadline_ms),
        );
        Self {
            inner: Arc::new(AppStateInner {
                config,
                queue,
                acceptor,
                primary,
                secondary,
            }),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.inner.queue
    }

    pub fn acceptor(&self) -> &CallbackAcceptor {
        &self.inner.acceptor
    }

    /// Queue answers and both sinks are reachable
    pub async fn is_ready(&self) -> bool {
        if !self.inner.queue.is_healthy().await {
            return false;
        }
        for sink in [&self.inner.primary, &self.inner.secondary] {
            match sink.health_check().await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(sink = sink.name(), "Sink reports unhealthy");
                    return false;
                }
                Err(e) => {
                    tracing::warn!(sink = sink.name(), "Sink health check failed: {}", e);
                    return false;
                }
            }
        }
        true
    }
}
