//! Recovery operations: step retry and DLQ rehydration.
//!
//! `retry_step` is idempotent: repeating it with the step already queued
//! re-enqueues at most one more delivery, and the inbox guards cover any
//! resulting duplicate execution.

use anyhow::{anyhow, ensure, Result};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::deps::CoreDeps;
use super::model::{event, RunPatch, RunStatus, StepPatch, StepReadyEnvelope, StepStatus};
use super::queue::{EnqueueOptions, QueueDriver, TOPIC_STEP_READY};
use super::store::Store;

/// Reset a step to `queued` and re-admit it to the queue. A terminal-failed
/// run is resumed alongside it.
pub async fn retry_step(deps: &CoreDeps, run_id: Uuid, step_id: Uuid) -> Result<()> {
    let step = deps
        .store
        .get_step(step_id)
        .await?
        .ok_or_else(|| anyhow!("step not found: {step_id}"))?;
    ensure!(
        step.run_id == run_id,
        "step {step_id} does not belong to run {run_id}"
    );

    deps.store
        .update_step(
            step_id,
            StepPatch {
                status: Some(StepStatus::Queued),
                outputs: Some(json!({})),
                ended_at: Some(None),
                ..Default::default()
            },
        )
        .await?;

    let run = deps
        .store
        .get_run(run_id)
        .await?
        .ok_or_else(|| anyhow!("run not found: {run_id}"))?;
    if run.status == RunStatus::Failed {
        deps.store
            .update_run(
                run_id,
                RunPatch {
                    status: Some(RunStatus::Queued),
                    ended_at: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        deps.store
            .record_event(run_id, event::RUN_RESUMED, json!({}), None)
            .await?;
    }

    deps.store
        .record_event(
            run_id,
            event::STEP_RETRY,
            json!({"stepId": step_id}),
            Some(step_id),
        )
        .await?;

    let envelope = StepReadyEnvelope::new(run_id, step_id, step.idempotency_key.clone());
    deps.queue
        .enqueue(
            TOPIC_STEP_READY,
            serde_json::to_value(&envelope)?,
            EnqueueOptions::default(),
        )
        .await?;

    info!(run_id = %run_id, step_id = %step_id, "step re-admitted for retry");
    Ok(())
}

/// Move up to `max` dead-lettered jobs on the topic back to pending.
pub async fn rehydrate_dlq(deps: &CoreDeps, topic: &str, max: usize) -> Result<usize> {
    let moved = deps.queue.rehydrate_dlq(topic, max).await?;
    if moved > 0 {
        info!(topic = %topic, moved, "rehydrated dlq jobs");
    }
    Ok(moved)
}
