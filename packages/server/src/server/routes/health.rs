//! Liveness, readiness, and Prometheus metrics endpoints.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::kernel::metrics::refresh_process_gauges;
use crate::kernel::queue::{QueueDriver, TOPIC_STEP_READY};
use crate::server::app::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    queue: QueueHealth,
    worker: WorkerHealth,
}

#[derive(Serialize)]
pub struct QueueHealth {
    driver: String,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
pub struct WorkerHealth {
    live: bool,
}

/// Health check endpoint
///
/// Checks:
/// - Queue driver reachability (a counts query round-trip)
/// - Worker heartbeat freshness
///
/// Returns 200 OK when both are healthy, 503 Service Unavailable otherwise.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let queue_health = match state.deps.queue.counts(TOPIC_STEP_READY).await {
        Ok(_) => QueueHealth {
            driver: state.deps.queue.name().to_owned(),
            status: "ok".to_owned(),
            error: None,
        },
        Err(e) => QueueHealth {
            driver: state.deps.queue.name().to_owned(),
            status: "error".to_owned(),
            error: Some(e.to_string()),
        },
    };

    let worker_live = state.deps.heartbeat.is_live();
    let is_healthy = queue_health.status == "ok" && worker_live;

    let status_code = if is_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: if is_healthy { "healthy" } else { "unhealthy" }.to_owned(),
            queue: queue_health,
            worker: WorkerHealth { live: worker_live },
        }),
    )
}

/// Process liveness: answering at all is the signal.
pub async fn live() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

/// Readiness: the worker heartbeat must be fresh. Disabled via
/// `HEALTH_CHECK_ENABLED=false`.
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    if !state.deps.config.health_check_enabled {
        return (
            StatusCode::OK,
            Json(serde_json::json!({"status": "ok", "checks": "disabled"})),
        );
    }
    if state.deps.heartbeat.is_live() {
        (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "stale worker heartbeat"})),
        )
    }
}

/// Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> Response {
    let queue_depth = state
        .deps
        .queue
        .counts(TOPIC_STEP_READY)
        .await
        .map(|c| c.pending + c.processing)
        .unwrap_or(0);
    refresh_process_gauges(state.started_at, queue_depth);

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}
