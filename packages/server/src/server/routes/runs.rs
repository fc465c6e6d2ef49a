//! Run creation, inspection, and step retry.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{AppendHeaders, IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;
use uuid::Uuid;

use crate::common::idempotency::is_valid_client_key;
use crate::kernel::model::event;
use crate::kernel::queue::{EnqueueOptions, QueueDriver, TOPIC_STEP_READY};
use crate::kernel::store::Store;
use crate::kernel::{recovery, StepReadyEnvelope};

use crate::server::app::{AppState, StoredResponse};

const IDEMPOTENCY_HEADER: &str = "x-idempotency-key";

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub plan: PlanSpec,
}

#[derive(Debug, Deserialize)]
pub struct PlanSpec {
    pub goal: String,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

#[derive(Debug, Deserialize)]
pub struct StepSpec {
    pub name: String,
    pub tool: String,
    #[serde(default = "empty_object")]
    pub inputs: Value,
}

fn empty_object() -> Value {
    json!({})
}

enum IdempotencyKey {
    None,
    Valid(String),
    Invalid,
}

fn read_idempotency_key(headers: &HeaderMap) -> IdempotencyKey {
    match headers.get(IDEMPOTENCY_HEADER) {
        None => IdempotencyKey::None,
        Some(raw) => match raw.to_str() {
            Ok(key) if is_valid_client_key(key) => IdempotencyKey::Valid(key.to_owned()),
            _ => IdempotencyKey::Invalid,
        },
    }
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": message})),
    )
        .into_response()
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    error!(error = %e, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": e.to_string()})),
    )
        .into_response()
}

fn replayed_response(stored: &StoredResponse) -> Response {
    let status = StatusCode::from_u16(stored.status).unwrap_or(StatusCode::OK);
    (
        status,
        AppendHeaders([
            ("x-idempotency-replayed", "true".to_owned()),
            (
                "x-idempotency-original-date",
                stored.stored_at.to_rfc3339(),
            ),
        ]),
        Json(stored.body.clone()),
    )
        .into_response()
}

/// `POST /runs` - accept a plan, create the run and its steps, and enqueue
/// every step. Steps with unmet dependencies re-enter the queue until their
/// prerequisites finish.
pub async fn create_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateRunRequest>,
) -> Response {
    let key = match read_idempotency_key(&headers) {
        IdempotencyKey::Invalid => return bad_request("invalid idempotency key"),
        other => other,
    };
    if let IdempotencyKey::Valid(key) = &key {
        if let Some(stored) = state.replays.get(&format!("POST /runs:{key}")) {
            return replayed_response(&stored);
        }
    }

    if request.plan.steps.is_empty() {
        return bad_request("plan requires at least one step");
    }
    let mut seen = std::collections::HashSet::new();
    for step in &request.plan.steps {
        if !seen.insert(step.name.as_str()) {
            return bad_request("step names must be unique within a plan");
        }
    }

    let deps = &state.deps;
    let run = match deps
        .store
        .create_run(&request.plan.goal, json!({}))
        .await
    {
        Ok(run) => run,
        Err(e) => return internal_error(e),
    };
    if let Err(e) = deps
        .store
        .record_event(run.id, event::RUN_CREATED, json!({"goal": request.plan.goal}), None)
        .await
    {
        return internal_error(e);
    }

    for spec in &request.plan.steps {
        let step = match deps
            .store
            .create_step(run.id, &spec.name, &spec.tool, spec.inputs.clone(), None)
            .await
        {
            Ok(step) => step,
            Err(e) => return internal_error(e),
        };
        let envelope = StepReadyEnvelope::new(run.id, step.id, step.idempotency_key.clone());
        let payload = match serde_json::to_value(&envelope) {
            Ok(payload) => payload,
            Err(e) => return internal_error(e),
        };
        if let Err(e) = deps
            .queue
            .enqueue(TOPIC_STEP_READY, payload, EnqueueOptions::default())
            .await
        {
            return internal_error(e);
        }
    }

    let body = json!({"id": run.id, "status": run.status});
    if let IdempotencyKey::Valid(key) = key {
        state.replays.insert(
            format!("POST /runs:{key}"),
            StoredResponse {
                status: StatusCode::CREATED.as_u16(),
                body: body.clone(),
                stored_at: chrono::Utc::now(),
            },
        );
    }
    (StatusCode::CREATED, Json(body)).into_response()
}

/// `GET /runs/:run_id` - run status with its steps. Terminal step states
/// are always visible here.
pub async fn get_run(State(state): State<AppState>, Path(run_id): Path<Uuid>) -> Response {
    let run = match state.deps.store.get_run(run_id).await {
        Ok(Some(run)) => run,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "run not found"})),
            )
                .into_response()
        }
        Err(e) => return internal_error(e),
    };
    let steps = match state.deps.store.list_steps_by_run(run_id).await {
        Ok(steps) => steps,
        Err(e) => return internal_error(e),
    };
    Json(json!({"run": run, "steps": steps})).into_response()
}

/// `POST /runs/:run_id/steps/:step_id/retry` - idempotent recovery: reset
/// the step to queued and re-enqueue it.
pub async fn retry_step(
    State(state): State<AppState>,
    Path((run_id, step_id)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
) -> Response {
    let key = match read_idempotency_key(&headers) {
        IdempotencyKey::Invalid => return bad_request("invalid idempotency key"),
        other => other,
    };
    let replay_key = format!("POST /runs/{run_id}/steps/{step_id}/retry");
    if let IdempotencyKey::Valid(key) = &key {
        if let Some(stored) = state.replays.get(&format!("{replay_key}:{key}")) {
            return replayed_response(&stored);
        }
    }

    match state.deps.store.get_step(step_id).await {
        Ok(Some(step)) if step.run_id == run_id => {}
        Ok(_) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "step not found"})),
            )
                .into_response()
        }
        Err(e) => return internal_error(e),
    }

    if let Err(e) = recovery::retry_step(&state.deps, run_id, step_id).await {
        return internal_error(e);
    }

    let body = json!({"ok": true, "stepId": step_id});
    if let IdempotencyKey::Valid(key) = key {
        state.replays.insert(
            format!("{replay_key}:{key}"),
            StoredResponse {
                status: StatusCode::OK.as_u16(),
                body: body.clone(),
                stored_at: chrono::Utc::now(),
            },
        );
    }
    (StatusCode::OK, Json(body)).into_response()
}
