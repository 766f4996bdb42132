//! Durable task records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::{EventId, TaskPayload};
use super::document::TerminalStatus;

/// Queue state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for (re)delivery
    Pending,
    /// Held by a worker until the lease expires
    Leased,
    /// Committed at both sinks and notified
    Succeeded,
    /// Permanent failure, notified
    Failed,
    /// Retry budget exhausted, notified
    #[serde(rename = "dead_letter")]
    DeadLettered,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Leased => "leased",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::DeadLettered => "dead_letter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "leased" => Some(TaskStatus::Leased),
            "succeeded" => Some(TaskStatus::Succeeded),
            "failed" => Some(TaskStatus::Failed),
            "dead_letter" => Some(TaskStatus::DeadLettered),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::DeadLettered
        )
    }
}

/// Pipeline stage reached by the latest attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStage {
    Received,
    Downloading,
    Preprocessing,
    Extracting,
    Emitting,
    Uploading,
    Notified,
}

impl TaskStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStage::Received => "received",
            TaskStage::Downloading => "downloading",
            TaskStage::Preprocessing => "preprocessing",
            TaskStage::Extracting => "extracting",
            TaskStage::Emitting => "emitting",
            TaskStage::Uploading => "uploading",
            TaskStage::Notified => "notified",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "received" => Some(TaskStage::Received),
            "downloading" => Some(TaskStage::Downloading),
            "preprocessing" => Some(TaskStage::Preprocessing),
            "extracting" => Some(TaskStage::Extracting),
            "emitting" => Some(TaskStage::Emitting),
            "uploading" => Some(TaskStage::Uploading),
            "notified" => Some(TaskStage::Notified),
            _ => None,
        }
    }
}

/// A task as stored in the durable queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    pub event_id: EventId,
    pub payload: TaskPayload,
    /// Deliveries so far, including the current lease
    pub attempts: u32,
    pub status: TaskStatus,
    pub stage: TaskStage,
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the task may be leased again
    pub visible_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Terminal notification claimed for this task. Set before the message
    /// is sent, so a redelivery never sends a second one.
    pub notified: Option<TerminalStatus>,
    /// Checksum of the CSV last written to the sinks
    pub checksum: Option<String>,
    pub updated_at: DateTime<Utc>,
}
