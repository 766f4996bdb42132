//! SQLite database backing the durable task queue
//!
//! One row per event id. Rows in a terminal status are kept as the
//! deduplication and notification ledger until purged.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::{
    document::TerminalStatus, EventId, QueuedTask, TaskPayload, TaskStage, TaskStatus,
};

const TASK_COLUMNS: &str = "event_id, payload, attempts, status, stage, enqueued_at, \
                            visible_at, last_error, notified, checksum, updated_at";

/// Counts per task status
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskStats {
    pub pending: u64,
    pub leased: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dead_letter: u64,
}

/// SQLite-based task database
#[derive(Clone)]
pub struct TaskDb {
    conn: Arc<Mutex<Connection>>,
}

impl TaskDb {
    /// Create or open the database at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::Database(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.migrate()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("Failed to open in-memory database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.migrate()?;
        Ok(db)
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=FULL;
            PRAGMA busy_timeout=5000;
        "#).map_err(|e| Error::Database(format!("Failed to set pragmas: {}", e)))?;

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS tasks (
                event_id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                stage TEXT NOT NULL,
                enqueued_at TEXT NOT NULL,
                visible_at INTEGER NOT NULL,
                last_error TEXT,
                notified TEXT,
                checksum TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_status_visible ON tasks(status, visible_at);
        "#).map_err(|e| Error::Database(format!("Failed to create tables: {}", e)))?;

        // Databases created before the checksum ledger
        let has_checksum = conn
            .prepare("SELECT 1 FROM pragma_table_info('tasks') WHERE name = 'checksum'")?
            .exists([])?;
        if !has_checksum {
            conn.execute_batch("ALTER TABLE tasks ADD COLUMN checksum TEXT;")
                .map_err(|e| Error::Database(format!("Failed to add checksum column: {}", e)))?;
        }

        Ok(())
    }

    /// Insert a new pending task. Returns false if the event id already exists.
    pub fn insert_task(&self, payload: &TaskPayload, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock();
        let payload_json = serde_json::to_string(payload)?;

        let inserted = conn.execute(
            "INSERT INTO tasks (event_id, payload, attempts, status, stage, enqueued_at, visible_at, updated_at)
             VALUES (?1, ?2, 0, ?3, ?4, ?5, ?6, ?5)
             ON CONFLICT(event_id) DO NOTHING",
            params![
                payload.event_id.as_str(),
                payload_json,
                TaskStatus::Pending.as_str(),
                TaskStage::Received.as_str(),
                now,
                now.timestamp_millis(),
            ],
        )?;

        Ok(inserted == 1)
    }

    /// Lease the next visible task.
    ///
    /// Pending tasks and leased tasks whose lease expired are both eligible.
    /// The attempt counter is incremented as part of the lease.
    pub fn lease_next(&self, now: DateTime<Utc>, lease_until: DateTime<Utc>) -> Result<Option<QueuedTask>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let candidate: Option<String> = tx
            .query_row(
                "SELECT event_id FROM tasks
                 WHERE status IN (?1, ?2) AND visible_at <= ?3
                 ORDER BY visible_at, enqueued_at
                 LIMIT 1",
                params![
                    TaskStatus::Pending.as_str(),
                    TaskStatus::Leased.as_str(),
                    now.timestamp_millis()
                ],
                |row| row.get(0),
            )
            .optional()?;

        let Some(event_id) = candidate else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE tasks
             SET attempts = attempts + 1, status = ?2, stage = ?3, visible_at = ?4, updated_at = ?5
             WHERE event_id = ?1",
            params![
                event_id,
                TaskStatus::Leased.as_str(),
                TaskStage::Received.as_str(),
                lease_until.timestamp_millis(),
                now,
            ],
        )?;

        let task = tx.query_row(
            &format!("SELECT {} FROM tasks WHERE event_id = ?1", TASK_COLUMNS),
            params![event_id],
            row_to_task,
        )?;

        tx.commit()?;
        Ok(Some(task))
    }

    /// Earliest visibility time among deliverable tasks
    pub fn next_visible_at(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let ms: Option<i64> = conn.query_row(
            "SELECT MIN(visible_at) FROM tasks WHERE status IN (?1, ?2)",
            params![TaskStatus::Pending.as_str(), TaskStatus::Leased.as_str()],
            |row| row.get(0),
        )?;
        Ok(ms.and_then(DateTime::<Utc>::from_timestamp_millis))
    }

    /// Record the stage reached by the current attempt
    pub fn update_stage(&self, event_id: &EventId, stage: TaskStage) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE tasks SET stage = ?2, updated_at = ?3 WHERE event_id = ?1",
            params![event_id.as_str(), stage.as_str(), Utc::now()],
        )?;
        Ok(())
    }

    /// Return a leased task to pending, visible again at `visible_at`.
    ///
    /// Every write made on behalf of a lease is fenced on `attempt`, the
    /// attempt counter the lease was granted with. Once the lease has
    /// expired and the task was leased again, the stale holder's writes
    /// change nothing and fail with [`Error::LeaseLost`].
    pub fn reschedule(&self, event_id: &EventId, attempt: u32, visible_at: DateTime<Utc>, error: &str) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE tasks
             SET status = ?2, stage = ?3, visible_at = ?4, last_error = ?5, updated_at = ?6
             WHERE event_id = ?1 AND status = ?7 AND attempts = ?8",
            params![
                event_id.as_str(),
                TaskStatus::Pending.as_str(),
                TaskStage::Received.as_str(),
                visible_at.timestamp_millis(),
                error,
                Utc::now(),
                TaskStatus::Leased.as_str(),
                attempt,
            ],
        )?;
        lease_held(changed, event_id, attempt)
    }

    /// Move a leased task to a terminal status
    pub fn finish(&self, event_id: &EventId, attempt: u32, status: TaskStatus, error: Option<&str>) -> Result<()> {
        debug_assert!(status.is_terminal());
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE tasks
             SET status = ?2, stage = ?3, last_error = COALESCE(?4, last_error), updated_at = ?5
             WHERE event_id = ?1 AND status = ?6 AND attempts = ?7",
            params![
                event_id.as_str(),
                status.as_str(),
                TaskStage::Notified.as_str(),
                error,
                Utc::now(),
                TaskStatus::Leased.as_str(),
                attempt,
            ],
        )?;
        lease_held(changed, event_id, attempt)
    }

    /// Claim the right to send the terminal notification.
    ///
    /// Succeeds for at most one lease of a task: the outcome is written
    /// only while the ledger is empty and the lease is still held.
    pub fn claim_notification(&self, event_id: &EventId, attempt: u32, outcome: TerminalStatus) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE tasks SET notified = ?2, updated_at = ?3
             WHERE event_id = ?1 AND notified IS NULL AND status = ?4 AND attempts = ?5",
            params![
                event_id.as_str(),
                outcome.as_str(),
                Utc::now(),
                TaskStatus::Leased.as_str(),
                attempt,
            ],
        )?;
        lease_held(changed, event_id, attempt)
    }

    /// Give up a claim whose message could not be delivered
    pub fn release_notification(&self, event_id: &EventId, attempt: u32) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE tasks SET notified = NULL, updated_at = ?2
             WHERE event_id = ?1 AND status = ?3 AND attempts = ?4",
            params![event_id.as_str(), Utc::now(), TaskStatus::Leased.as_str(), attempt],
        )?;
        lease_held(changed, event_id, attempt)
    }

    /// Store the checksum of the CSV about to be written, returning the one
    /// recorded by an earlier attempt
    pub fn swap_checksum(&self, event_id: &EventId, checksum: &str) -> Result<Option<String>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let previous: Option<Option<String>> = tx
            .query_row(
                "SELECT checksum FROM tasks WHERE event_id = ?1",
                params![event_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(previous) = previous else {
            return Err(Error::TaskNotFound(event_id.to_string()));
        };

        tx.execute(
            "UPDATE tasks SET checksum = ?2, updated_at = ?3 WHERE event_id = ?1",
            params![event_id.as_str(), checksum, Utc::now()],
        )?;
        tx.commit()?;
        Ok(previous)
    }

    /// Get a task by event id
    pub fn get(&self, event_id: &EventId) -> Result<Option<QueuedTask>> {
        let conn = self.conn.lock();
        let task = conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE event_id = ?1", TASK_COLUMNS),
                params![event_id.as_str()],
                row_to_task,
            )
            .optional()?;
        Ok(task)
    }

    /// List tasks in a status, most recently updated first
    pub fn list_by_status(&self, status: TaskStatus, limit: usize) -> Result<Vec<QueuedTask>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE status = ?1 ORDER BY updated_at DESC LIMIT ?2",
            TASK_COLUMNS
        ))?;
        let tasks = stmt
            .query_map(params![status.as_str(), limit as i64], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    /// Reset a failed or dead-lettered task for a fresh delivery budget.
    ///
    /// Clears the notification ledger so the new outcome is reported.
    pub fn requeue(&self, event_id: &EventId, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE tasks
             SET status = ?2, stage = ?3, attempts = 0, visible_at = ?4, notified = NULL, updated_at = ?5
             WHERE event_id = ?1 AND status IN (?6, ?7)",
            params![
                event_id.as_str(),
                TaskStatus::Pending.as_str(),
                TaskStage::Received.as_str(),
                now.timestamp_millis(),
                now,
                TaskStatus::Failed.as_str(),
                TaskStatus::DeadLettered.as_str(),
            ],
        )?;
        Ok(changed == 1)
    }

    /// Delete terminal rows last touched before `cutoff`
    pub fn purge_terminal(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM tasks WHERE status IN (?1, ?2, ?3) AND updated_at < ?4",
            params![
                TaskStatus::Succeeded.as_str(),
                TaskStatus::Failed.as_str(),
                TaskStatus::DeadLettered.as_str(),
                cutoff,
            ],
        )?;
        Ok(removed)
    }

    /// Task counts per status
    pub fn stats(&self) -> Result<TaskStats> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut stats = TaskStats::default();
        for row in rows {
            let (status, count) = row?;
            let count = count as u64;
            match TaskStatus::parse(&status) {
                Some(TaskStatus::Pending) => stats.pending = count,
                Some(TaskStatus::Leased) => stats.leased = count,
                Some(TaskStatus::Succeeded) => stats.succeeded = count,
                Some(TaskStatus::Failed) => stats.failed = count,
                Some(TaskStatus::DeadLettered) => stats.dead_letter = count,
                None => tracing::warn!("Unknown task status in database: {}", status),
            }
        }
        Ok(stats)
    }
}

fn lease_held(changed: usize, event_id: &EventId, attempt: u32) -> Result<()> {
    if changed == 0 {
        return Err(Error::LeaseLost(format!("{} (attempt {})", event_id, attempt)));
    }
    Ok(())
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn row_to_task(row: &Row) -> rusqlite::Result<QueuedTask> {
    let payload_json: String = row.get(1)?;
    let payload: TaskPayload = serde_json::from_str(&payload_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;

    let status: String = row.get(3)?;
    let status = TaskStatus::parse(&status)
        .ok_or_else(|| conversion_error(3, format!("unknown status {}", status)))?;

    let stage: String = row.get(4)?;
    let stage = TaskStage::parse(&stage)
        .ok_or_else(|| conversion_error(4, format!("unknown stage {}", stage)))?;

    let visible_ms: i64 = row.get(6)?;
    let visible_at = DateTime::<Utc>::from_timestamp_millis(visible_ms)
        .ok_or_else(|| conversion_error(6, format!("invalid timestamp {}", visible_ms)))?;

    let notified: Option<String> = row.get(8)?;

    Ok(QueuedTask {
        event_id: EventId::new(row.get::<_, String>(0)?),
        payload,
        attempts: row.get::<_, i64>(2)? as u32,
        status,
        stage,
        enqueued_at: row.get(5)?,
        visible_at,
        last_error: row.get(7)?,
        notified: notified.as_deref().and_then(TerminalStatus::parse),
        checksum: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Recipient;
    use chrono::Duration;

    fn payload(id: &str) -> TaskPayload {
        TaskPayload {
            event_id: EventId::new(id),
            file_id: format!("file-{}", id),
            recipient: Recipient::User("user-1".to_string()),
            trace_id: "trace".to_string(),
        }
    }

    #[test]
    fn test_insert_is_idempotent() {
        let db = TaskDb::in_memory().unwrap();
        let now = Utc::now();
        assert!(db.insert_task(&payload("evt-1"), now).unwrap());
        assert!(!db.insert_task(&payload("evt-1"), now).unwrap());
        assert_eq!(db.stats().unwrap().pending, 1);
    }

    #[test]
    fn test_lease_increments_attempts_and_hides_task() {
        let db = TaskDb::in_memory().unwrap();
        let now = Utc::now();
        db.insert_task(&payload("evt-1"), now).unwrap();

        let task = db.lease_next(now, now + Duration::seconds(30)).unwrap().unwrap();
        assert_eq!(task.attempts, 1);
        assert_eq!(task.status, TaskStatus::Leased);
        assert_eq!(task.payload, payload("evt-1"));

        // Still under lease
        assert!(db.lease_next(now, now + Duration::seconds(30)).unwrap().is_none());

        // Lease expired: redelivered
        let later = now + Duration::seconds(31);
        let again = db.lease_next(later, later + Duration::seconds(30)).unwrap().unwrap();
        assert_eq!(again.attempts, 2);
    }

    #[test]
    fn test_reschedule_respects_visibility() {
        let db = TaskDb::in_memory().unwrap();
        let now = Utc::now();
        let id = EventId::new("evt-1");
        db.insert_task(&payload("evt-1"), now).unwrap();
        db.lease_next(now, now + Duration::seconds(30)).unwrap().unwrap();

        db.reschedule(&id, 1, now + Duration::seconds(10), "sink down").unwrap();
        assert!(db.lease_next(now + Duration::seconds(5), now + Duration::seconds(60)).unwrap().is_none());
        assert_eq!(
            db.next_visible_at().unwrap().map(|t| t.timestamp_millis()),
            Some((now + Duration::seconds(10)).timestamp_millis())
        );

        let task = db
            .lease_next(now + Duration::seconds(10), now + Duration::seconds(60))
            .unwrap()
            .unwrap();
        assert_eq!(task.last_error.as_deref(), Some("sink down"));
    }

    #[test]
    fn test_finish_and_ledger() {
        let db = TaskDb::in_memory().unwrap();
        let now = Utc::now();
        let id = EventId::new("evt-1");
        db.insert_task(&payload("evt-1"), now).unwrap();
        db.lease_next(now, now + Duration::seconds(30)).unwrap();

        db.claim_notification(&id, 1, TerminalStatus::Success).unwrap();
        db.finish(&id, 1, TaskStatus::Succeeded, None).unwrap();

        let task = db.get(&id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.stage, TaskStage::Notified);
        assert_eq!(task.notified, Some(TerminalStatus::Success));

        // Terminal tasks are never leased again
        let later = now + Duration::hours(1);
        assert!(db.lease_next(later, later).unwrap().is_none());
    }

    #[test]
    fn test_requeue_dead_letter_only() {
        let db = TaskDb::in_memory().unwrap();
        let now = Utc::now();
        let id = EventId::new("evt-1");
        db.insert_task(&payload("evt-1"), now).unwrap();
        assert!(!db.requeue(&id, now).unwrap());

        db.lease_next(now, now + Duration::seconds(30)).unwrap();
        db.claim_notification(&id, 1, TerminalStatus::Failure).unwrap();
        db.finish(&id, 1, TaskStatus::DeadLettered, Some("exhausted")).unwrap();
        assert_eq!(db.list_by_status(TaskStatus::DeadLettered, 10).unwrap().len(), 1);

        assert!(db.requeue(&id, now).unwrap());
        let task = db.get(&id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        assert_eq!(task.notified, None);
    }

    #[test]
    fn test_purge_terminal() {
        let db = TaskDb::in_memory().unwrap();
        let now = Utc::now();
        db.insert_task(&payload("evt-1"), now).unwrap();
        db.lease_next(now, now + Duration::seconds(30)).unwrap().unwrap();
        db.insert_task(&payload("evt-2"), now).unwrap();
        db.finish(&EventId::new("evt-1"), 1, TaskStatus::Succeeded, None).unwrap();

        let removed = db.purge_terminal(Utc::now() + Duration::seconds(1)).unwrap();
        assert_eq!(removed, 1);
        assert!(db.get(&EventId::new("evt-1")).unwrap().is_none());
        assert!(db.get(&EventId::new("evt-2")).unwrap().is_some());
    }

    #[test]
    fn test_stale_lease_writes_are_rejected() {
        let db = TaskDb::in_memory().unwrap();
        let now = Utc::now();
        let id = EventId::new("evt-1");
        db.insert_task(&payload("evt-1"), now).unwrap();

        let first = db.lease_next(now, now).unwrap().unwrap();
        let second = db.lease_next(now, now + Duration::seconds(30)).unwrap().unwrap();
        assert_eq!((first.attempts, second.attempts), (1, 2));

        let stale = first.attempts;
        assert!(matches!(
            db.claim_notification(&id, stale, TerminalStatus::Success),
            Err(Error::LeaseLost(_))
        ));
        assert!(matches!(
            db.finish(&id, stale, TaskStatus::Succeeded, None),
            Err(Error::LeaseLost(_))
        ));
        assert!(matches!(
            db.reschedule(&id, stale, now, "late"),
            Err(Error::LeaseLost(_))
        ));

        let task = db.get(&id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Leased);
        assert_eq!(task.notified, None);

        db.claim_notification(&id, second.attempts, TerminalStatus::Success).unwrap();
        db.finish(&id, second.attempts, TaskStatus::Succeeded, None).unwrap();
    }

    #[test]
    fn test_notification_claimed_once() {
        let db = TaskDb::in_memory().unwrap();
        let now = Utc::now();
        let id = EventId::new("evt-1");
        db.insert_task(&payload("evt-1"), now).unwrap();
        db.lease_next(now, now + Duration::seconds(30)).unwrap();

        db.claim_notification(&id, 1, TerminalStatus::Success).unwrap();
        assert!(db.claim_notification(&id, 1, TerminalStatus::Failure).is_err());
        assert_eq!(db.get(&id).unwrap().unwrap().notified, Some(TerminalStatus::Success));

        // A released claim can be taken again
        db.release_notification(&id, 1).unwrap();
        db.claim_notification(&id, 1, TerminalStatus::Failure).unwrap();
        assert_eq!(db.get(&id).unwrap().unwrap().notified, Some(TerminalStatus::Failure));
    }

    #[test]
    fn test_swap_checksum_returns_previous() {
        let db = TaskDb::in_memory().unwrap();
        let id = EventId::new("evt-1");
        db.insert_task(&payload("evt-1"), Utc::now()).unwrap();

        assert_eq!(db.swap_checksum(&id, "aaa").unwrap(), None);
        assert_eq!(db.swap_checksum(&id, "bbb").unwrap().as_deref(), Some("aaa"));
        assert_eq!(db.get(&id).unwrap().unwrap().checksum.as_deref(), Some("bbb"));
        assert!(matches!(
            db.swap_checksum(&EventId::new("evt-missing"), "ccc"),
            Err(Error::TaskNotFound(_))
        ));
    }

    #[test]
    fn test_migrate_adds_checksum_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE tasks (
                    event_id TEXT PRIMARY KEY, payload TEXT NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 0, status TEXT NOT NULL,
                    stage TEXT NOT NULL, enqueued_at TEXT NOT NULL,
                    visible_at INTEGER NOT NULL, last_error TEXT, notified TEXT,
                    updated_at TEXT NOT NULL
                );",
            )
            .unwrap();
        }

        let db = TaskDb::new(&path).unwrap();
        db.insert_task(&payload("evt-1"), Utc::now()).unwrap();
        assert_eq!(db.swap_checksum(&EventId::new("evt-1"), "aaa").unwrap(), None);
    }
}
