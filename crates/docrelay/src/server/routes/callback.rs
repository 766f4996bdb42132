//! Chat platform callback endpoint

use axum::{extract::State, http::HeaderMap, Json};
use bytes::Bytes;
use serde::Serialize;

use crate::error::Result;
use crate::ingestion::{AcceptOutcome, SIGNATURE_HEADER};
use crate::server::state::AppState;

/// Acknowledgement body
#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

/// POST /callback - Verify, enqueue and acknowledge a platform event
///
/// 200 once the task is durable (or the event needs no work), 401 on a bad
/// signature, 503 when the queue could not take it in time.
pub async fn receive_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CallbackResponse>> {
    let signature = headers.get(SIGNATURE_HEADER).map(|v| v.as_bytes());
    let outcome = state.acceptor().accept(&body, signature).await?;

    let response = match outcome {
        AcceptOutcome::Enqueued(id) => CallbackResponse {
            status: "enqueued",
            event_id: Some(id.to_string()),
            reason: None,
        },
        AcceptOutcome::Duplicate(id) => CallbackResponse {
            status: "duplicate",
            event_id: Some(id.to_string()),
            reason: None,
        },
        AcceptOutcome::Ignored(reason) => CallbackResponse {
            status: "ignored",
            event_id: None,
            reason: Some(reason),
        },
    };
    Ok(Json(response))
}
