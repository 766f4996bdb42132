//! Task inspection and operator endpoints

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::processing::InFlightTask;
use crate::server::state::AppState;
use crate::storage::TaskStats;
use crate::types::{EventId, QueuedTask};

#[derive(Debug, Serialize)]
pub struct QueueStatsResponse {
    pub counts: TaskStats,
    pub in_flight: Vec<InFlightTask>,
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Serialize)]
pub struct DeadLetterResponse {
    pub tasks: Vec<QueuedTask>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct RequeueResponse {
    pub event_id: String,
    pub message: String,
}

/// GET /api/tasks/stats - Counts per status and live stages
pub async fn queue_stats(State(state): State<AppState>) -> Result<Json<QueueStatsResponse>> {
    let counts = state.queue().stats().await?;
    Ok(Json(QueueStatsResponse {
        counts,
        in_flight: state.queue().in_flight(),
    }))
}

/// GET /api/tasks/dead-letter - Most recent dead-lettered tasks
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<DeadLetterResponse>> {
    let tasks = state.queue().dead_letters(query.limit.min(500)).await?;
    Ok(Json(DeadLetterResponse {
        total: tasks.len(),
        tasks,
    }))
}

/// GET /api/tasks/:event_id - One task with its stage and last error
pub async fn get_task(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<Json<QueuedTask>> {
    let task = state
        .queue()
        .get(&EventId::new(event_id.clone()))
        .await?
        .ok_or(Error::TaskNotFound(event_id))?;
    Ok(Json(task))
}

/// POST /api/tasks/:event_id/requeue - Give a finished failure a new budget
pub async fn requeue_task(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<Json<RequeueResponse>> {
    let id = EventId::new(event_id);
    state.queue().requeue(&id).await?;
    Ok(Json(RequeueResponse {
        message: format!("Task requeued. Use /api/tasks/{} to follow it.", id),
        event_id: id.to_string(),
    }))
}
