//! Worker loop: consumes `step.ready`, races the runner against the step
//! timeout, and emits outbox rows for downstream fan-out.
//!
//! The envelope inbox guard sits in front of the runner so a duplicate
//! delivery is swallowed before any side effect. The guard key is always
//! released in the tail of the message handler, success or failure.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use metrics::counter;
use serde_json::{json, Value};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::deps::CoreDeps;
use super::error::QueueError;
use super::inbox::Inbox;
use super::metrics::{WORKER_ERRORS_TOTAL, WORKER_PROCESSED_TOTAL};
use super::model::{event, OutboxEnvelope, StepReadyEnvelope, StepStatus};
use super::queue::{JobHandler, QueueDriver, TOPIC_OUTBOX, TOPIC_STEP_READY};
use super::runner::StepRunner;
use super::store::Store;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);
const LIVENESS_WINDOW_MS: i64 = 12_000;

/// Worker liveness tracker. When disabled (memory driver, single process)
/// liveness is unconditionally true.
pub struct Heartbeat {
    enabled: bool,
    last_beat_ms: AtomicI64,
}

impl Heartbeat {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            last_beat_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    pub fn touch(&self) {
        self.last_beat_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        if !self.enabled {
            return true;
        }
        Utc::now().timestamp_millis() - self.last_beat_ms.load(Ordering::SeqCst)
            < LIVENESS_WINDOW_MS
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

#[derive(Debug, Clone)]
pub struct StepWorkerConfig {
    pub step_timeout: Duration,
    pub worker_id: String,
}

impl Default for StepWorkerConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_millis(30_000),
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

pub struct StepWorker {
    deps: Arc<CoreDeps>,
    runner: Arc<StepRunner>,
    config: StepWorkerConfig,
}

impl StepWorker {
    pub fn new(deps: Arc<CoreDeps>, config: StepWorkerConfig) -> Self {
        let runner = Arc::new(StepRunner::new(deps.clone()));
        Self {
            deps,
            runner,
            config,
        }
    }

    /// Subscribe to `step.ready` and start the heartbeat task.
    pub async fn start(&self) -> Result<(), QueueError> {
        info!(
            worker_id = %self.config.worker_id,
            step_timeout_ms = self.config.step_timeout.as_millis() as u64,
            driver = self.deps.queue.name(),
            "step worker starting"
        );

        if self.deps.heartbeat.enabled() {
            let deps = self.deps.clone();
            let worker_id = self.config.worker_id.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
                loop {
                    ticker.tick().await;
                    deps.heartbeat.touch();
                    if let Err(e) = deps.queue.record_heartbeat(&worker_id).await {
                        warn!(error = %e, "failed to record heartbeat");
                    }
                }
            });
        }

        let deps = self.deps.clone();
        let runner = self.runner.clone();
        let step_timeout = self.config.step_timeout;
        let handler: JobHandler = Arc::new(move |payload| {
            let deps = deps.clone();
            let runner = runner.clone();
            Box::pin(async move { process_message(deps, runner, step_timeout, payload).await })
        });

        self.deps.queue.subscribe(TOPIC_STEP_READY, handler).await
    }
}

async fn process_message(
    deps: Arc<CoreDeps>,
    runner: Arc<StepRunner>,
    step_timeout: Duration,
    payload: Value,
) -> Result<()> {
    let envelope: StepReadyEnvelope = serde_json::from_value(payload)
        .map_err(|e| anyhow!("malformed step.ready envelope: {e}"))?;
    let span = info_span!(
        "step_ready",
        run_id = %envelope.run_id,
        step_id = %envelope.step_id,
        retry_count = envelope.retry_count(),
    );
    handle_envelope(deps, runner, step_timeout, envelope)
        .instrument(span)
        .await
}

async fn handle_envelope(
    deps: Arc<CoreDeps>,
    runner: Arc<StepRunner>,
    step_timeout: Duration,
    envelope: StepReadyEnvelope,
) -> Result<()> {
    let run_id = envelope.run_id;
    let step_id = envelope.step_id;

    // Envelope-level duplicate guard. The step is fetched first because the
    // derived key incorporates its name and inputs.
    let step = deps.store.get_step(step_id).await?;
    let guard_key = match &step {
        Some(step) => Inbox::envelope_key(&envelope, step),
        None => format!("{run_id}:{step_id}"),
    };
    if !deps.inbox().acquire(&guard_key).await? {
        record_duplicate(&deps, run_id, step_id, &guard_key).await;
        return Ok(());
    }

    // A settled step makes this delivery a duplicate even though the guard
    // key was already released by the delivery that completed it.
    if step.as_ref().is_some_and(|s| s.status.is_sink()) {
        record_duplicate(&deps, run_id, step_id, &guard_key).await;
        deps.inbox().release(&guard_key).await;
        return Ok(());
    }

    // The runner executes in its own task so a lost race does not drop it
    // mid-flight: the execution lease is released when the task finishes,
    // and a cooperative handler returns promptly once the token fires.
    let cancel = CancellationToken::new();
    let exec = {
        let runner = runner.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { runner.run_step(run_id, step_id, cancel).await })
    };
    let outcome: Result<()> = match timeout(step_timeout, exec).await {
        Ok(joined) => joined.unwrap_or_else(|e| Err(anyhow!("step task panicked: {e}"))),
        Err(_elapsed) => Err(anyhow!("step timeout")),
    };

    let outcome = match outcome {
        Ok(()) => {
            emit_outbox_for_result(&deps, run_id, step_id).await;
            counter!(WORKER_PROCESSED_TOTAL).increment(1);
            Ok(())
        }
        Err(e) => {
            if e.to_string() == "step timeout" {
                // Persist timed_out before waking the handler so a late
                // handler error cannot win the write race.
                let timeout_ms = step_timeout.as_millis() as u64;
                if let Err(mark_err) = runner.mark_step_timed_out(run_id, step_id, timeout_ms).await
                {
                    warn!(error = %mark_err, "failed to mark step timed out");
                }
                cancel.cancel();
            }
            add_outbox(
                &deps,
                OutboxEnvelope {
                    run_id,
                    event_type: event::STEP_FAILED.to_owned(),
                    payload: Some(json!({"error": e.to_string()})),
                    step_id: Some(step_id),
                    attempt: envelope.attempt,
                },
            )
            .await;
            counter!(WORKER_ERRORS_TOTAL).increment(1);
            // Rethrow so the queue driver schedules a retry.
            Err(e)
        }
    };

    deps.inbox().release(&guard_key).await;
    outcome
}

async fn record_duplicate(deps: &Arc<CoreDeps>, run_id: Uuid, step_id: Uuid, key: &str) {
    info!(key = %key, "inbox.duplicate.ignored");
    if let Err(e) = deps
        .store
        .record_event(
            run_id,
            event::INBOX_DUPLICATE,
            json!({"key": key}),
            Some(step_id),
        )
        .await
    {
        warn!(error = %e, "failed to record duplicate event");
    }
}

/// On the success path the outbox row reflects the step's actual terminal
/// state; a redelivered message for a failed step must not announce success.
async fn emit_outbox_for_result(deps: &Arc<CoreDeps>, run_id: Uuid, step_id: Uuid) {
    match deps.store.get_step(step_id).await {
        Ok(Some(step)) if step.status == StepStatus::Succeeded => {
            add_outbox(
                deps,
                OutboxEnvelope {
                    run_id,
                    event_type: event::STEP_SUCCEEDED.to_owned(),
                    payload: None,
                    step_id: Some(step_id),
                    attempt: 1,
                },
            )
            .await;
        }
        Ok(_) => {
            debug!(step_id = %step_id, "no success outbox row for non-succeeded step");
        }
        Err(e) => {
            warn!(step_id = %step_id, error = %e, "failed to read step for outbox emission");
        }
    }
}

/// Outbox append failures are logged and swallowed; the relay plus queue
/// redelivery cover the gap.
async fn add_outbox(deps: &Arc<CoreDeps>, envelope: OutboxEnvelope) {
    let payload = match serde_json::to_value(&envelope) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "failed to serialize outbox envelope");
            return;
        }
    };
    if let Err(e) = deps.store.outbox_add(TOPIC_OUTBOX, payload).await {
        warn!(run_id = %envelope.run_id, error = %e, "failed to append outbox row");
    }
}
