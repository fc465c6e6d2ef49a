//! Router assembly and shared request state.

use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::Value;
use tower_http::trace::TraceLayer;

use crate::kernel::CoreDeps;

use super::routes::{dev, health, runs};

/// A completed idempotent response, kept so replays can return the original
/// body with the replay headers attached.
#[derive(Clone)]
pub struct StoredResponse {
    pub status: u16,
    pub body: Value,
    pub stored_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AppState {
    pub deps: Arc<CoreDeps>,
    pub replays: Arc<DashMap<String, StoredResponse>>,
    pub metrics: PrometheusHandle,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(deps: Arc<CoreDeps>, metrics: PrometheusHandle) -> Self {
        Self {
            deps,
            replays: Arc::new(DashMap::new()),
            metrics,
            started_at: Instant::now(),
        }
    }
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/runs", post(runs::create_run))
        .route("/runs/:run_id", get(runs::get_run))
        .route("/runs/:run_id/steps/:step_id/retry", post(runs::retry_step))
        .route("/dev/queue", get(dev::queue_stats))
        .route("/dev/dlq", get(dev::list_dlq))
        .route("/dev/dlq/rehydrate", post(dev::rehydrate_dlq))
        .route("/health", get(health::health))
        .route("/health/live", get(health::live))
        .route("/health/ready", get(health::ready))
        .route("/metrics", get(health::metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
