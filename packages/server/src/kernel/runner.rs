//! Step dispatch state machine.
//!
//! `run_step` drives one step through its gates: load, execution lease,
//! dependency check, policy enforcement, handler selection, execution, and
//! the resulting run transition. Terminal step states are monotonic: once a
//! step is `timed_out` or `cancelled`, a late handler result must not
//! overwrite it. The execution lease is always released, whatever path the
//! dispatch takes.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use chrono::Utc;
use metrics::{counter, histogram};
use serde_json::{json, Value};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::deps::CoreDeps;
use super::inbox::Inbox;
use super::metrics::{STEPS_TOTAL, STEP_DURATION_SECONDS};
use super::model::{
    event, RunPatch, RunStatus, Step, StepPatch, StepReadyEnvelope, StepStatus,
};
use super::queue::{EnqueueOptions, QueueDriver, TOPIC_STEP_READY};
use super::store::Store;

/// Delay before re-checking a step whose dependencies are not yet terminal.
const DEPENDENCY_RECHECK_DELAY: Duration = Duration::from_secs(2);

/// How a dispatch concluded, for metrics labels and control flow.
enum Outcome {
    /// Dependencies unmet; the step was re-enqueued with a delay.
    Waiting,
    /// Policy denied the tool. Deterministic, not retried.
    Denied,
    /// Handler finished without error.
    Succeeded,
    /// Handler (or handler selection) failed; the error is rethrown so the
    /// queue driver schedules a retry.
    Failed(anyhow::Error),
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Waiting => "waiting",
            Outcome::Denied => "denied",
            Outcome::Succeeded => "succeeded",
            Outcome::Failed(_) => "failed",
        }
    }
}

pub struct StepRunner {
    deps: Arc<CoreDeps>,
}

impl StepRunner {
    pub fn new(deps: Arc<CoreDeps>) -> Self {
        Self { deps }
    }

    /// Execute one step to a conclusion. Errors returned here are the
    /// queue's signal to retry the delivery. `cancel` is handed to the
    /// handler; it fires when the worker's timeout race gives up on this
    /// execution.
    pub async fn run_step(
        &self,
        run_id: Uuid,
        step_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<()> {
        let step = self
            .deps
            .store
            .get_step(step_id)
            .await?
            .ok_or_else(|| anyhow!("step not found: {step_id}"))?;

        if step.status.is_sink() {
            // Redelivery of a completed (or cancelled) step; the terminal
            // state is a sink and the handler must not run again.
            debug!(step_id = %step_id, status = ?step.status, "step already settled, skipping");
            return Ok(());
        }

        let lease = Inbox::execution_lease_key(step_id);
        if !self.deps.inbox().acquire(&lease).await? {
            info!(step_id = %step_id, "concurrent delivery for step in flight, skipping duplicate");
            return Ok(());
        }

        let started = Instant::now();
        let outcome = self.dispatch(run_id, &step, cancel).await;

        match &outcome {
            Ok(outcome) => {
                histogram!(STEP_DURATION_SECONDS, "tool" => step.tool.clone(), "status" => outcome.label())
                    .record(started.elapsed().as_secs_f64());
                counter!(STEPS_TOTAL, "status" => outcome.label()).increment(1);
            }
            Err(_) => {
                counter!(STEPS_TOTAL, "status" => "error").increment(1);
            }
        }

        self.deps.inbox().release(&lease).await;

        match outcome? {
            Outcome::Failed(e) => Err(e),
            _ => Ok(()),
        }
    }

    /// Transition a non-terminal step to `timed_out` and fail its run.
    ///
    /// Called by the worker when the timeout race fires. Already-terminal
    /// steps and runs are left untouched.
    pub async fn mark_step_timed_out(
        &self,
        run_id: Uuid,
        step_id: Uuid,
        timeout_ms: u64,
    ) -> Result<()> {
        let store = &self.deps.store;

        if let Some(step) = store.get_step(step_id).await? {
            if !step.status.is_terminal() {
                let mut outputs = step.outputs.clone();
                if let Value::Object(map) = &mut outputs {
                    map.insert("error".into(), json!("timeout"));
                    map.insert("timeoutMs".into(), json!(timeout_ms));
                } else {
                    outputs = json!({"error": "timeout", "timeoutMs": timeout_ms});
                }
                store
                    .update_step(
                        step_id,
                        StepPatch {
                            status: Some(StepStatus::TimedOut),
                            outputs: Some(outputs),
                            ended_at: Some(Some(Utc::now())),
                            ..Default::default()
                        },
                    )
                    .await?;
                store
                    .record_event(
                        run_id,
                        event::STEP_TIMEOUT,
                        json!({"timeoutMs": timeout_ms}),
                        Some(step_id),
                    )
                    .await?;
            }
        }

        self.fail_run(
            run_id,
            json!({"reason": "timeout", "stepId": step_id, "timeoutMs": timeout_ms}),
        )
        .await
    }

    /// Phases 3-6 of the dispatch; runs under the execution lease.
    async fn dispatch(
        &self,
        run_id: Uuid,
        step: &Step,
        cancel: CancellationToken,
    ) -> Result<Outcome> {
        let store = &self.deps.store;

        if step.status == StepStatus::Queued {
            store
                .update_step(
                    step.id,
                    StepPatch {
                        status: Some(StepStatus::Ready),
                        ..Default::default()
                    },
                )
                .await?;
        }

        // Dependency gate: every named sibling must be succeeded or
        // cancelled before this step may run.
        let wanted = step.depends_on();
        if !wanted.is_empty() {
            let siblings = store.list_steps_by_run(run_id).await?;
            let unmet: Vec<String> = wanted
                .into_iter()
                .filter(|name| {
                    !siblings
                        .iter()
                        .any(|s| &s.name == name && s.status.satisfies_dependency())
                })
                .collect();
            if !unmet.is_empty() {
                let envelope = StepReadyEnvelope::new(run_id, step.id, step.idempotency_key.clone());
                self.deps
                    .queue
                    .enqueue(
                        TOPIC_STEP_READY,
                        serde_json::to_value(&envelope)?,
                        EnqueueOptions::delayed(DEPENDENCY_RECHECK_DELAY),
                    )
                    .await?;
                store
                    .record_event(
                        run_id,
                        event::STEP_WAITING,
                        json!({"reason": "deps_not_ready", "deps": unmet}),
                        Some(step.id),
                    )
                    .await?;
                debug!(step_id = %step.id, "dependencies not ready, re-enqueued");
                return Ok(Outcome::Waiting);
            }
        }

        // Policy gate: an empty allow-list means no restriction.
        if let Some(allowed) = step.tools_allowed() {
            if !allowed.contains(&step.tool) {
                warn!(step_id = %step.id, tool = %step.tool, "tool denied by policy");
                store
                    .update_step(
                        step.id,
                        StepPatch {
                            status: Some(StepStatus::Failed),
                            outputs: Some(json!({
                                "error": "policy: tool not allowed",
                                "tool": step.tool,
                                "toolsAllowed": allowed,
                            })),
                            ended_at: Some(Some(Utc::now())),
                            ..Default::default()
                        },
                    )
                    .await?;
                store
                    .record_event(
                        run_id,
                        event::POLICY_DENIED,
                        json!({"tool": step.tool}),
                        Some(step.id),
                    )
                    .await?;
                store
                    .record_event(
                        run_id,
                        event::STEP_FAILED,
                        json!({"error": "policy: tool not allowed"}),
                        Some(step.id),
                    )
                    .await?;
                self.fail_run(run_id, json!({"reason": "policy_denied"})).await?;
                return Ok(Outcome::Denied);
            }
        }

        // Handler selection.
        let Some(handler) = self.deps.registry.find(&step.tool) else {
            store
                .update_step(
                    step.id,
                    StepPatch {
                        status: Some(StepStatus::Failed),
                        outputs: Some(json!({"error": "no handler for tool", "tool": step.tool})),
                        ended_at: Some(Some(Utc::now())),
                        ..Default::default()
                    },
                )
                .await?;
            store
                .record_event(
                    run_id,
                    event::STEP_FAILED,
                    json!({"error": "no handler for tool", "tool": step.tool}),
                    Some(step.id),
                )
                .await?;
            return Ok(Outcome::Failed(anyhow!("no handler for tool {}", step.tool)));
        };

        // The step and its run are now running. A terminal step being
        // re-executed by the queue's retry chain keeps its recorded state;
        // the handler still runs so retry accounting can reach the DLQ.
        let now = Utc::now();
        if !step.status.is_terminal() {
            store
                .update_step(
                    step.id,
                    StepPatch {
                        status: Some(StepStatus::Running),
                        started_at: Some(step.started_at.unwrap_or(now)),
                        ..Default::default()
                    },
                )
                .await?;
            let run = store
                .get_run(run_id)
                .await?
                .ok_or_else(|| anyhow!("run not found: {run_id}"))?;
            if run.status == RunStatus::Queued {
                store
                    .update_run(
                        run_id,
                        RunPatch {
                            status: Some(RunStatus::Running),
                            started_at: Some(run.started_at.unwrap_or(now)),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
            store
                .record_event(
                    run_id,
                    event::STEP_STARTED,
                    json!({"tool": step.tool}),
                    Some(step.id),
                )
                .await?;
        } else {
            debug!(step_id = %step.id, status = ?step.status, "re-executing terminal step for retry accounting");
        }

        match handler.execute(run_id, step, cancel).await {
            Ok(outputs) => self.complete_step(run_id, step, outputs).await,
            Err(e) => self.fail_step(run_id, step, e).await,
        }
    }

    async fn complete_step(&self, run_id: Uuid, step: &Step, outputs: Value) -> Result<Outcome> {
        let store = &self.deps.store;

        // A timeout or cancel may have landed while the handler ran; that
        // state wins. A leftover `failed` from an earlier attempt is the one
        // terminal state a successful retry may overwrite.
        let current = store
            .get_step(step.id)
            .await?
            .ok_or_else(|| anyhow!("step not found: {}", step.id))?;
        if current.status.is_terminal() && current.status != StepStatus::Failed {
            info!(step_id = %step.id, status = ?current.status, "handler finished after terminal transition, preserving it");
            return Ok(Outcome::Succeeded);
        }

        store
            .update_step(
                step.id,
                StepPatch {
                    status: Some(StepStatus::Succeeded),
                    outputs: Some(outputs),
                    ended_at: Some(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await?;
        store
            .record_event(
                run_id,
                event::STEP_SUCCEEDED,
                json!({"tool": step.tool}),
                Some(step.id),
            )
            .await?;

        if store.count_remaining_steps(run_id).await? == 0 {
            let run = self
                .deps
                .store
                .get_run(run_id)
                .await?
                .ok_or_else(|| anyhow!("run not found: {run_id}"))?;
            // A cancelled run stays cancelled even when its last step lands.
            if !run.status.is_terminal() {
                store
                    .update_run(
                        run_id,
                        RunPatch {
                            status: Some(RunStatus::Succeeded),
                            ended_at: Some(Some(Utc::now())),
                            ..Default::default()
                        },
                    )
                    .await?;
                store
                    .record_event(run_id, event::RUN_SUCCEEDED, json!({}), None)
                    .await?;
            }
        }

        Ok(Outcome::Succeeded)
    }

    async fn fail_step(&self, run_id: Uuid, step: &Step, error: anyhow::Error) -> Result<Outcome> {
        let store = &self.deps.store;

        // `timed_out`, `cancelled`, and `succeeded` take precedence over a
        // late handler error; only a live or previously-failed step may be
        // marked failed.
        let current = store
            .get_step(step.id)
            .await?
            .ok_or_else(|| anyhow!("step not found: {}", step.id))?;
        if !current.status.is_terminal() || current.status == StepStatus::Failed {
            store
                .update_step(
                    step.id,
                    StepPatch {
                        status: Some(StepStatus::Failed),
                        outputs: Some(json!({"error": error.to_string()})),
                        ended_at: Some(Some(Utc::now())),
                        ..Default::default()
                    },
                )
                .await?;
            store
                .record_event(
                    run_id,
                    event::STEP_FAILED,
                    json!({"error": error.to_string()}),
                    Some(step.id),
                )
                .await?;
        }

        self.fail_run(run_id, json!({"reason": "step failed", "stepId": step.id}))
            .await?;

        Ok(Outcome::Failed(error))
    }

    /// Fail the run unless it already reached a terminal state.
    async fn fail_run(&self, run_id: Uuid, payload: Value) -> Result<()> {
        let store = &self.deps.store;
        let run = store
            .get_run(run_id)
            .await?
            .ok_or_else(|| anyhow!("run not found: {run_id}"))?;
        if run.status.is_terminal() {
            return Ok(());
        }
        store
            .update_run(
                run_id,
                RunPatch {
                    status: Some(RunStatus::Failed),
                    ended_at: Some(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await?;
        store
            .record_event(run_id, event::RUN_FAILED, payload, None)
            .await?;
        Ok(())
    }
}
