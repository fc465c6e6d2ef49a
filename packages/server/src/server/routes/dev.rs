//! Operator endpoints: queue depth, DLQ listing, DLQ rehydration.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::kernel::queue::{QueueDriver, TOPIC_STEP_DLQ, TOPIC_STEP_READY};
use crate::kernel::recovery;
use crate::server::app::AppState;

const DLQ_LIST_LIMIT: usize = 50;
const REHYDRATE_CEILING: usize = 500;

fn internal_error(e: impl std::fmt::Display) -> Response {
    error!(error = %e, "dev endpoint failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": e.to_string()})),
    )
        .into_response()
}

/// `GET /dev/queue` - counts and backlog age for the step topic.
pub async fn queue_stats(State(state): State<AppState>) -> Response {
    let counts = match state.deps.queue.counts(TOPIC_STEP_READY).await {
        Ok(counts) => counts,
        Err(e) => return internal_error(e),
    };
    let oldest_age_ms = match state.deps.queue.oldest_age_ms(TOPIC_STEP_READY).await {
        Ok(age) => age,
        Err(e) => return internal_error(e),
    };
    Json(json!({
        "topic": TOPIC_STEP_READY,
        "counts": counts,
        "oldestAgeMs": oldest_age_ms,
    }))
    .into_response()
}

/// `GET /dev/dlq` - dead-lettered step jobs with their final errors.
pub async fn list_dlq(State(state): State<AppState>) -> Response {
    let items = match state
        .deps
        .queue
        .list_dlq(TOPIC_STEP_READY, DLQ_LIST_LIMIT)
        .await
    {
        Ok(items) => items,
        Err(e) => return internal_error(e),
    };
    Json(json!({
        "topic": TOPIC_STEP_DLQ,
        "count": items.len(),
        "items": items,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct RehydrateRequest {
    #[serde(default)]
    pub max: i64,
}

/// `POST /dev/dlq/rehydrate` - re-admit up to `max` dead-lettered jobs,
/// clamped to [0, 500].
pub async fn rehydrate_dlq(
    State(state): State<AppState>,
    Json(request): Json<RehydrateRequest>,
) -> Response {
    let max = request.max.clamp(0, REHYDRATE_CEILING as i64) as usize;
    match recovery::rehydrate_dlq(&state.deps, TOPIC_STEP_READY, max).await {
        Ok(moved) => Json(json!({"moved": moved})).into_response(),
        Err(e) => internal_error(e),
    }
}
