//! API routes for the relay server

pub mod callback;
pub mod tasks;

use axum::{
    routing::{get, post},
    Router,
};

use crate::server::state::AppState;

/// Build the operator API routes
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/tasks/stats", get(tasks::queue_stats))
        .route("/tasks/dead-letter", get(tasks::list_dead_letters))
        .route("/tasks/:event_id", get(tasks::get_task))
        .route("/tasks/:event_id/requeue", post(tasks::requeue_task))
        .route("/info", get(info))
}

/// API info endpoint
async fn info() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "name": "docrelay",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Chat-delivered document images to CSV with dual-sink replication",
        "endpoints": {
            "POST /callback": "Chat platform callback (signed)",
            "GET /api/tasks/stats": "Queue counts and in-flight stages",
            "GET /api/tasks/dead-letter": "Dead-lettered tasks",
            "GET /api/tasks/:event_id": "Task status, stage and last error",
            "POST /api/tasks/:event_id/requeue": "Requeue a failed or dead-lettered task"
        }
    }))
}
