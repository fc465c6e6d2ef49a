//! Control-surface tests driven through the axum router.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use stepflow_core::kernel::{
    CoreDeps, HandlerRegistry, MemoryQueue, MemoryStore, QueueDriver, StepWorker,
    StepWorkerConfig, Store,
};
use stepflow_core::server::{build_app, AppState};
use stepflow_core::Config;

static METRICS: OnceLock<PrometheusHandle> = OnceLock::new();

fn metrics_handle() -> PrometheusHandle {
    METRICS
        .get_or_init(|| stepflow_core::kernel::metrics::install().expect("install recorder"))
        .clone()
}

async fn test_app() -> (Router, Arc<CoreDeps>) {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let queue: Arc<dyn QueueDriver> = Arc::new(MemoryQueue::new(8, None, CancellationToken::new()));
    let deps = Arc::new(CoreDeps::new(
        store,
        queue,
        Arc::new(HandlerRegistry::with_builtins()),
        Arc::new(Config::default()),
    ));
    let worker = StepWorker::new(deps.clone(), StepWorkerConfig::default());
    worker.start().await.unwrap();
    (build_app(AppState::new(deps.clone(), metrics_handle())), deps)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn echo_plan() -> Value {
    json!({
        "plan": {
            "goal": "demo",
            "steps": [{"name": "echo", "tool": "test:echo", "inputs": {"foo": "bar"}}],
        }
    })
}

#[tokio::test]
async fn create_run_returns_created() {
    let (app, _deps) = test_app().await;
    let response = app.oneshot(post_json("/runs", echo_plan())).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert!(body.get("id").is_some());
    assert_eq!(body["status"], json!("queued"));
}

#[tokio::test]
async fn create_run_replays_idempotent_requests() {
    let (app, _deps) = test_app().await;
    let mut first = post_json("/runs", echo_plan());
    first
        .headers_mut()
        .insert("x-idempotency-key", "req-1".parse().unwrap());
    let first = app.clone().oneshot(first).await.unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    assert!(first.headers().get("x-idempotency-replayed").is_none());
    let first_body = body_json(first).await;

    let mut second = post_json("/runs", echo_plan());
    second
        .headers_mut()
        .insert("x-idempotency-key", "req-1".parse().unwrap());
    let second = app.clone().oneshot(second).await.unwrap();
    assert_eq!(second.status(), StatusCode::CREATED);
    assert_eq!(
        second.headers().get("x-idempotency-replayed").unwrap(),
        "true"
    );
    assert!(second
        .headers()
        .get("x-idempotency-original-date")
        .is_some());
    let second_body = body_json(second).await;
    assert_eq!(first_body["id"], second_body["id"]);

    // A different key creates a fresh run.
    let mut third = post_json("/runs", echo_plan());
    third
        .headers_mut()
        .insert("x-idempotency-key", "req-2".parse().unwrap());
    let third = app.oneshot(third).await.unwrap();
    let third_body = body_json(third).await;
    assert_ne!(first_body["id"], third_body["id"]);
}

#[tokio::test]
async fn create_run_rejects_invalid_idempotency_key() {
    let (app, _deps) = test_app().await;
    let mut request = post_json("/runs", echo_plan());
    request
        .headers_mut()
        .insert("x-idempotency-key", "not valid!".parse().unwrap());
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn create_run_rejects_empty_plan() {
    let (app, _deps) = test_app().await;
    let response = app
        .oneshot(post_json("/runs", json!({"plan": {"goal": "empty", "steps": []}})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn create_run_rejects_duplicate_step_names() {
    let (app, _deps) = test_app().await;
    let plan = json!({
        "plan": {
            "goal": "dup",
            "steps": [
                {"name": "a", "tool": "test:echo", "inputs": {}},
                {"name": "a", "tool": "test:echo", "inputs": {}},
            ],
        }
    });
    let response = app.oneshot(post_json("/runs", plan)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn get_run_exposes_terminal_steps() {
    let (app, _deps) = test_app().await;
    let created = app.clone().oneshot(post_json("/runs", echo_plan())).await.unwrap();
    let run_id = body_json(created).await["id"].as_str().unwrap().to_owned();

    tokio::time::sleep(Duration::from_millis(200)).await;

    let response = app.oneshot(get(&format!("/runs/{run_id}"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["run"]["status"], json!("succeeded"));
    assert_eq!(body["steps"][0]["status"], json!("succeeded"));
}

#[tokio::test]
async fn get_unknown_run_is_404() {
    let (app, _deps) = test_app().await;
    let response = app
        .oneshot(get(&format!("/runs/{}", uuid::Uuid::new_v4())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn retry_route_requires_existing_step() {
    let (app, _deps) = test_app().await;
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!(
                    "/runs/{}/steps/{}/retry",
                    uuid::Uuid::new_v4(),
                    uuid::Uuid::new_v4()
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn retry_route_readmits_step() {
    let (app, deps) = test_app().await;
    let created = app.clone().oneshot(post_json("/runs", echo_plan())).await.unwrap();
    let run_id = body_json(created).await["id"].as_str().unwrap().to_owned();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let run_uuid: uuid::Uuid = run_id.parse().unwrap();
    let steps = deps.store.list_steps_by_run(run_uuid).await.unwrap();
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/runs/{run_id}/steps/{}/retry", steps[0].id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ok"], json!(true));
}

#[tokio::test]
async fn dev_queue_reports_counts() {
    let (app, _deps) = test_app().await;
    let response = app.oneshot(get("/dev/queue")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["topic"], json!("step.ready"));
    assert!(body["counts"].get("pending").is_some());
    assert!(body["counts"].get("dlq").is_some());
}

#[tokio::test]
async fn dev_dlq_lists_and_rehydrates() {
    let (app, _deps) = test_app().await;
    let response = app.clone().oneshot(get("/dev/dlq")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["topic"], json!("step.dlq"));
    assert_eq!(body["count"], json!(0));

    let response = app
        .oneshot(post_json("/dev/dlq/rehydrate", json!({"max": 99_999})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["moved"], json!(0));
}

#[tokio::test]
async fn health_endpoints_respond() {
    let (app, _deps) = test_app().await;
    let live = app.clone().oneshot(get("/health/live")).await.unwrap();
    assert_eq!(live.status(), StatusCode::OK);

    let ready = app.clone().oneshot(get("/health/ready")).await.unwrap();
    assert_eq!(ready.status(), StatusCode::OK);

    let health = app.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);

    let metrics = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(metrics.status(), StatusCode::OK);
    let bytes = to_bytes(metrics.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("worker_uptime_seconds"));
}
