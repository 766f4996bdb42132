//! Durable task queue with leases, backoff and dead-lettering
//!
//! Tasks are persisted to SQLite so that nothing acknowledged to the chat
//! platform is lost on restart. Delivery is at-least-once: a lease that is
//! never acknowledged expires and the task becomes deliverable again.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::Notify;

use super::retry::backoff_delay;
use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::storage::{TaskDb, TaskStats};
use crate::types::{EventId, QueuedTask, TaskPayload, TaskStage, TaskStatus, TerminalStatus};

/// Result of offering a payload to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new task was created
    Enqueued,
    /// A task with this event id already exists
    Duplicate,
}

/// A task currently held by a worker
#[derive(Debug, Clone, Serialize)]
pub struct InFlightTask {
    pub event_id: EventId,
    pub stage: TaskStage,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
}

/// Durable queue over [`TaskDb`]
pub struct TaskQueue {
    db: TaskDb,
    config: QueueConfig,
    /// Wakes the dispatcher when work arrives
    work_available: Notify,
    /// Live stage of leased tasks
    in_flight: DashMap<EventId, InFlightTask>,
}

impl TaskQueue {
    pub fn new(db: TaskDb, config: QueueConfig) -> Self {
        Self {
            db,
            config,
            work_available: Notify::new(),
            in_flight: DashMap::new(),
        }
    }

    /// Open the database named in the configuration
    pub fn open(config: &QueueConfig) -> Result<Self> {
        let db = TaskDb::new(&config.database_path)?;
        tracing::info!(path = %config.database_path.display(), "Task database opened");
        Ok(Self::new(db, config.clone()))
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Run a database call off the async runtime
    async fn with_db<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&TaskDb) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| Error::internal(format!("Database task panicked: {}", e)))?
    }

    /// Durably store a payload; commits before returning
    pub async fn enqueue(&self, payload: TaskPayload) -> Result<EnqueueOutcome> {
        let event_id = payload.event_id.clone();
        let inserted = self
            .with_db(move |db| db.insert_task(&payload, Utc::now()))
            .await?;

        if inserted {
            tracing::info!(event_id = %event_id, "Task enqueued");
            self.work_available.notify_one();
            Ok(EnqueueOutcome::Enqueued)
        } else {
            tracing::info!(event_id = %event_id, "Duplicate delivery, task already exists");
            Ok(EnqueueOutcome::Duplicate)
        }
    }

    /// Lease the next deliverable task, if any
    pub async fn lease(&self) -> Result<Option<QueuedTask>> {
        let now = Utc::now();
        let lease_until = now + chrono::Duration::seconds(self.config.lease_secs as i64);
        let task = self.with_db(move |db| db.lease_next(now, lease_until)).await?;

        if let Some(task) = &task {
            self.in_flight.insert(
                task.event_id.clone(),
                InFlightTask {
                    event_id: task.event_id.clone(),
                    stage: TaskStage::Received,
                    attempt: task.attempts,
                    started_at: now,
                },
            );
        }
        Ok(task)
    }

    /// Sleep until a task may be deliverable: an enqueue, the earliest
    /// `visible_at`, or the poll interval, whichever comes first
    pub async fn wait_for_work(&self) {
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        let wait = match self.with_db(|db| db.next_visible_at()).await {
            Ok(Some(at)) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO).min(poll),
            Ok(None) => poll,
            Err(e) => {
                tracing::warn!("Failed to read next visible task: {}", e);
                poll
            }
        };
        if wait.is_zero() {
            return;
        }

        tokio::select! {
            _ = self.work_available.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }

    /// Record the stage reached by a leased task
    pub async fn set_stage(&self, event_id: &EventId, stage: TaskStage) -> Result<()> {
        if let Some(mut entry) = self.in_flight.get_mut(event_id) {
            entry.stage = stage;
        }
        let id = event_id.clone();
        self.with_db(move |db| db.update_stage(&id, stage)).await
    }

    /// Acknowledge a task whose outputs are committed and reported
    pub async fn complete(&self, task: &QueuedTask) -> Result<()> {
        self.finish(task, TaskStatus::Succeeded, None).await
    }

    /// Finalize a task that failed permanently
    pub async fn fail(&self, task: &QueuedTask, error: &str) -> Result<()> {
        self.finish(task, TaskStatus::Failed, Some(error)).await
    }

    /// Move a task to the dead-letter set
    pub async fn dead_letter(&self, task: &QueuedTask, error: &str) -> Result<()> {
        tracing::warn!(event_id = %task.event_id, error, "Task dead-lettered");
        self.finish(task, TaskStatus::DeadLettered, Some(error)).await
    }

    async fn finish(&self, task: &QueuedTask, status: TaskStatus, error: Option<&str>) -> Result<()> {
        self.release_in_flight(task);
        let id = task.event_id.clone();
        let attempt = task.attempts;
        let error = error.map(str::to_string);
        self.with_db(move |db| db.finish(&id, attempt, status, error.as_deref()))
            .await
    }

    /// Release a lease for redelivery after the backoff for its attempt.
    ///
    /// Returns the delay applied.
    pub async fn retry_later(&self, task: &QueuedTask, error: &str) -> Result<Duration> {
        let delay = self.backoff_for(task.attempts);
        let visible_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));

        self.release_in_flight(task);
        let id = task.event_id.clone();
        let attempt = task.attempts;
        let error = error.to_string();
        self.with_db(move |db| db.reschedule(&id, attempt, visible_at, &error))
            .await?;

        tracing::info!(
            event_id = %task.event_id,
            attempt = task.attempts,
            delay_ms = delay.as_millis() as u64,
            "Task scheduled for redelivery"
        );
        Ok(delay)
    }

    /// A newer lease of the same task keeps its entry
    fn release_in_flight(&self, task: &QueuedTask) {
        self.in_flight
            .remove_if(&task.event_id, |_, live| live.attempt == task.attempts);
    }

    /// `min(min_backoff * 2^(attempt-1), max_backoff)`
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        backoff_delay(
            Duration::from_millis(self.config.min_backoff_ms),
            Duration::from_millis(self.config.max_backoff_ms),
            attempt.max(1),
        )
    }

    /// Why a leased task must not run, if its budget is spent
    pub fn budget_exhausted(&self, task: &QueuedTask, now: DateTime<Utc>) -> Option<String> {
        if task.attempts > self.config.max_attempts {
            return Some(format!(
                "delivery attempt {} exceeds the limit of {}",
                task.attempts, self.config.max_attempts
            ));
        }
        let age = now.signed_duration_since(task.enqueued_at);
        if age.num_seconds() > self.config.max_task_age_secs as i64 {
            return Some(format!(
                "task age {}s exceeds the limit of {}s",
                age.num_seconds(),
                self.config.max_task_age_secs
            ));
        }
        None
    }

    /// Whether a failure on this attempt leaves no further deliveries
    pub fn is_last_attempt(&self, task: &QueuedTask) -> bool {
        task.attempts >= self.config.max_attempts
    }

    /// Claim the terminal notification for this lease before sending it.
    ///
    /// Fails with [`Error::LeaseLost`] when the lease has moved on or the
    /// outcome was already claimed.
    pub async fn claim_notification(&self, task: &QueuedTask, outcome: TerminalStatus) -> Result<()> {
        let id = task.event_id.clone();
        let attempt = task.attempts;
        self.with_db(move |db| db.claim_notification(&id, attempt, outcome))
            .await
    }

    /// Undo a claim whose message was not delivered
    pub async fn release_notification(&self, task: &QueuedTask) -> Result<()> {
        let id = task.event_id.clone();
        let attempt = task.attempts;
        self.with_db(move |db| db.release_notification(&id, attempt))
            .await
    }

    /// Record the checksum of the CSV about to be uploaded; returns the
    /// checksum an earlier attempt uploaded, if any
    pub async fn swap_checksum(&self, event_id: &EventId, checksum: &str) -> Result<Option<String>> {
        let id = event_id.clone();
        let checksum = checksum.to_string();
        self.with_db(move |db| db.swap_checksum(&id, &checksum)).await
    }

    /// Give a failed or dead-lettered task a fresh delivery budget
    pub async fn requeue(&self, event_id: &EventId) -> Result<()> {
        let id = event_id.clone();
        let requeued = self.with_db(move |db| db.requeue(&id, Utc::now())).await?;
        if !requeued {
            return Err(Error::TaskNotFound(format!(
                "{} (only failed or dead-lettered tasks can be requeued)",
                event_id
            )));
        }
        tracing::info!(event_id = %event_id, "Task requeued");
        self.work_available.notify_one();
        Ok(())
    }

    pub async fn get(&self, event_id: &EventId) -> Result<Option<QueuedTask>> {
        let id = event_id.clone();
        self.with_db(move |db| db.get(&id)).await
    }

    pub async fn stats(&self) -> Result<TaskStats> {
        self.with_db(|db| db.stats()).await
    }

    /// Most recent dead-lettered tasks
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<QueuedTask>> {
        self.with_db(move |db| db.list_by_status(TaskStatus::DeadLettered, limit))
            .await
    }

    /// Tasks currently held by workers
    pub fn in_flight(&self) -> Vec<InFlightTask> {
        self.in_flight.iter().map(|e| e.value().clone()).collect()
    }

    /// Drop finished rows older than the ledger retention
    pub async fn purge_ledger(&self) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.ledger_retention_secs as i64);
        let removed = self.with_db(move |db| db.purge_terminal(cutoff)).await?;
        if removed > 0 {
            tracing::info!(removed, "Purged finished tasks from the ledger");
        }
        Ok(removed)
    }

    /// Check the database answers
    pub async fn is_healthy(&self) -> bool {
        self.stats().await.is_ok()
    }
}
