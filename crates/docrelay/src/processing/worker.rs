//! Background worker pool
//!
//! A dispatcher leases tasks from the durable queue and runs each through
//! the [`Pipeline`] on its own tokio task, bounded by a semaphore. The
//! worker owns the terminal transitions: every task ends committed, failed
//! or dead-lettered with exactly one message to the user. The message is
//! claimed in the queue before it is sent, and every write is fenced on the
//! lease, so a delivery whose lease expired mid-run can no longer report.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::Instrument;

use super::notifier::{FailureReason, Notifier};
use super::pipeline::{Pipeline, StageFailure};
use super::task_queue::TaskQueue;
use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::types::{QueuedTask, TaskStage, TerminalStatus};

/// How one delivery of a task ended
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Outputs committed and the user notified
    Succeeded,
    /// Released for redelivery after the given delay
    Retrying(Duration),
    /// Permanent failure, user notified
    Failed,
    /// Budget exhausted, user notified
    DeadLettered,
    /// The lease expired mid-run and a newer delivery owns the task
    LeaseLost,
}

/// Worker pool processing queued tasks
pub struct ProcessingWorker {
    queue: Arc<TaskQueue>,
    pipeline: Arc<Pipeline>,
    notifier: Arc<Notifier>,
    concurrency: usize,
    task_timeout: Duration,
}

impl ProcessingWorker {
    pub fn new(queue: Arc<TaskQueue>, pipeline: Arc<Pipeline>, notifier: Arc<Notifier>, config: &WorkerConfig) -> Self {
        let concurrency = config
            .concurrency
            .unwrap_or_else(|| num_cpus::get().min(8))
            .max(1);

        tracing::info!(
            "Worker configured: {} concurrent tasks, {}s timeout",
            concurrency,
            config.task_timeout_secs
        );

        Self {
            queue,
            pipeline,
            notifier,
            concurrency,
            task_timeout: Duration::from_secs(config.task_timeout_secs),
        }
    }

    /// Dispatch tasks until the process exits
    pub async fn run(self: Arc<Self>) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut purge = tokio::time::interval(Duration::from_secs(3600));
        tracing::info!("Processing worker started");

        loop {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                tracing::error!("Worker semaphore closed, stopping dispatcher");
                return;
            };

            match self.queue.lease().await {
                Ok(Some(task)) => {
                    let worker = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        worker.process(task).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = self.queue.wait_for_work() => {}
                        _ = purge.tick() => {
                            if let Err(e) = self.queue.purge_ledger().await {
                                tracing::warn!("Ledger purge failed: {}", e);
                            }
                        }
                    }
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!("Failed to lease task: {}", e);
                    tokio::time::sleep(Duration::from_millis(self.queue.config().poll_interval_ms)).await;
                }
            }
        }
    }

    /// Run one leased task to its outcome for this delivery.
    ///
    /// Queue bookkeeping errors are logged; the lease then expires and the
    /// task is delivered again.
    pub async fn process(&self, task: QueuedTask) -> Option<TaskOutcome> {
        let span = tracing::info_span!(
            "task",
            event_id = %task.event_id,
            trace_id = %task.payload.trace_id,
            attempt = task.attempts
        );

        async {
            match self.handle(&task).await {
                Ok(outcome) => {
                    tracing::info!(outcome = ?outcome, "Task delivery finished");
                    Some(outcome)
                }
                Err(Error::LeaseLost(lease)) => {
                    tracing::warn!(lease = %lease, "Lease expired mid-run, leaving the task to its newer delivery");
                    Some(TaskOutcome::LeaseLost)
                }
                Err(e) => {
                    tracing::error!("Task bookkeeping failed, lease will expire: {}", e);
                    None
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn handle(&self, task: &QueuedTask) -> Result<TaskOutcome> {
        // An earlier delivery claimed the message: finish without a second one
        if let Some(notified) = task.notified {
            tracing::info!(notified = notified.as_str(), "Outcome already reported, finalizing");
            return match notified {
                TerminalStatus::Success => {
                    self.queue.complete(task).await?;
                    Ok(TaskOutcome::Succeeded)
                }
                TerminalStatus::Failure => {
                    self.queue.fail(task, "finalized after redelivery").await?;
                    Ok(TaskOutcome::Failed)
                }
            };
        }

        if let Some(reason) = self.queue.budget_exhausted(task, Utc::now()) {
            let error = Error::ResourceExhaustion(reason);
            return self.dead_letter(task, &error).await;
        }

        let run = timeout(self.task_timeout, self.pipeline.run(&task.payload, &self.queue)).await;
        let failure = match run {
            Ok(Ok(output)) => {
                self.queue.claim_notification(task, TerminalStatus::Success).await?;
                let sent = self
                    .notifier
                    .notify_success(
                        &task.payload.recipient,
                        &task.event_id,
                        output.title.as_deref(),
                        output.rows,
                        &output.key,
                        output.needs_review,
                    )
                    .await;
                match sent {
                    Ok(()) => {
                        self.queue.complete(task).await?;
                        tracing::info!(
                            key = %output.key,
                            rows = output.rows,
                            checksum = %output.checksum,
                            replay = output.replay.as_str(),
                            needs_review = output.needs_review,
                            "Task committed"
                        );
                        return Ok(TaskOutcome::Succeeded);
                    }
                    // Uploads are idempotent, so a redelivery can safely redo them
                    Err(e) => {
                        self.queue.release_notification(task).await?;
                        StageFailure {
                            stage: TaskStage::Notified,
                            error: if e.is_transient() {
                                e
                            } else {
                                Error::transient("chat", e.to_string())
                            },
                        }
                    }
                }
            }
            Ok(Err(failure)) => failure,
            Err(_) => StageFailure {
                stage: self.current_stage(task),
                error: Error::transient(
                    "worker",
                    format!("attempt timed out after {}s", self.task_timeout.as_secs()),
                ),
            },
        };

        tracing::warn!(stage = failure.stage.as_str(), "Stage failed: {}", failure.error);

        if failure.error.is_transient() {
            if self.queue.is_last_attempt(task) {
                let error = Error::ResourceExhaustion(format!(
                    "last attempt failed at {}: {}",
                    failure.stage.as_str(),
                    failure.error
                ));
                return self.dead_letter(task, &error).await;
            }
            let delay = self.queue.retry_later(task, &failure.to_string()).await?;
            return Ok(TaskOutcome::Retrying(delay));
        }

        let reason = FailureReason::classify(&failure.error, failure.stage);
        self.report_failure(task, reason).await?;
        self.queue.fail(task, &failure.to_string()).await?;
        Ok(TaskOutcome::Failed)
    }

    async fn dead_letter(&self, task: &QueuedTask, error: &Error) -> Result<TaskOutcome> {
        self.report_failure(task, FailureReason::RetriesExhausted).await?;
        self.queue.dead_letter(task, &error.to_string()).await?;
        Ok(TaskOutcome::DeadLettered)
    }

    /// Claim and send the failure message; an undeliverable one is logged
    /// and the task is finalized anyway
    async fn report_failure(&self, task: &QueuedTask, reason: FailureReason) -> Result<()> {
        self.queue.claim_notification(task, TerminalStatus::Failure).await?;
        match self
            .notifier
            .notify_failure(&task.payload.recipient, &task.event_id, reason)
            .await
        {
            Ok(()) => Ok(()),
            Err(_) => {
                tracing::error!(reason = reason.as_str(), "Failure notification lost");
                self.queue.release_notification(task).await
            }
        }
    }

    fn current_stage(&self, task: &QueuedTask) -> TaskStage {
        self.queue
            .in_flight()
            .into_iter()
            .find(|t| t.event_id == task.event_id)
            .map(|t| t.stage)
            .unwrap_or(TaskStage::Received)
    }
}
