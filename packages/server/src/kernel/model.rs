//! Domain model for runs, steps, events, and queue jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "run_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "step_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Queued,
    Ready,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::TimedOut | StepStatus::Cancelled
        )
    }

    /// Whether a dependency in this status unblocks its dependents.
    /// A cancelled prerequisite counts as satisfied.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, StepStatus::Succeeded | StepStatus::Cancelled)
    }

    /// States where a redelivery is a pure duplicate: the effect already
    /// happened (or was cancelled) and re-execution is forbidden. Failed and
    /// timed-out steps are NOT sinks; the queue's retry chain re-executes
    /// them until it exhausts its attempts.
    pub fn is_sink(&self) -> bool {
        matches!(self, StepStatus::Succeeded | StepStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "queue_job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Dlq,
}

// ============================================================================
// Run and Step
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub status: RunStatus,
    pub goal: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub run_id: Uuid,
    /// Unique within its run.
    pub name: String,
    /// Handler selector, e.g. `git:clone` or `test:echo`.
    pub tool: String,
    pub inputs: Value,
    pub outputs: Value,
    pub status: StepStatus,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Step {
    /// Step names this step depends on, read from `inputs._dependsOn`.
    pub fn depends_on(&self) -> Vec<String> {
        match self.inputs.get("_dependsOn") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Tool allow-list read from `inputs._policy.tools_allowed`.
    ///
    /// `None` (absent or empty list) means no restriction.
    pub fn tools_allowed(&self) -> Option<Vec<String>> {
        let list = self.inputs.get("_policy")?.get("tools_allowed")?.as_array()?;
        if list.is_empty() {
            return None;
        }
        Some(
            list.iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect(),
        )
    }
}

/// Partial update for a run. `ended_at` uses a nested Option so callers can
/// distinguish "leave alone" from "set to null".
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone, Default)]
pub struct StepPatch {
    pub status: Option<StepStatus>,
    pub outputs: Option<Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<Option<DateTime<Utc>>>,
}

// ============================================================================
// Events
// ============================================================================

/// Append-only record of a domain event.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: Option<Uuid>,
    pub event_type: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// The closed set of event types appended by the core.
pub mod event {
    pub const RUN_CREATED: &str = "run.created";
    pub const RUN_SUCCEEDED: &str = "run.succeeded";
    pub const RUN_FAILED: &str = "run.failed";
    pub const RUN_RESUMED: &str = "run.resumed";
    pub const STEP_STARTED: &str = "step.started";
    pub const STEP_SUCCEEDED: &str = "step.succeeded";
    pub const STEP_FAILED: &str = "step.failed";
    pub const STEP_TIMEOUT: &str = "step.timeout";
    pub const STEP_WAITING: &str = "step.waiting";
    pub const STEP_RETRY: &str = "step.retry";
    pub const POLICY_DENIED: &str = "policy.denied";
    pub const INBOX_DUPLICATE: &str = "inbox.duplicate.ignored";
}

// ============================================================================
// Outbox
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRow {
    pub id: Uuid,
    pub topic: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Queue jobs and envelopes
// ============================================================================

/// A job record as owned by a queue driver.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: Uuid,
    pub topic: String,
    pub payload: Value,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub dlq: u64,
}

fn default_attempt() -> u32 {
    1
}

/// Envelope carried on the `step.ready` (and `step.dlq`) topics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReadyEnvelope {
    pub run_id: Uuid,
    pub step_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// 1-based delivery counter, injected by the driver at delivery time.
    #[serde(rename = "__attempt", default = "default_attempt")]
    pub attempt: u32,
}

impl StepReadyEnvelope {
    pub fn new(run_id: Uuid, step_id: Uuid, idempotency_key: Option<String>) -> Self {
        Self {
            run_id,
            step_id,
            idempotency_key,
            attempt: 1,
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.attempt.saturating_sub(1)
    }
}

/// Envelope carried on the `outbox` fan-out topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEnvelope {
    pub run_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<Uuid>,
    #[serde(rename = "__attempt", default = "default_attempt")]
    pub attempt: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step_with_inputs(inputs: Value) -> Step {
        Step {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            name: "s".into(),
            tool: "test:echo".into(),
            inputs,
            outputs: json!({}),
            status: StepStatus::Queued,
            idempotency_key: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    #[test]
    fn depends_on_reads_underscore_field() {
        let step = step_with_inputs(json!({"_dependsOn": ["a", "b"], "x": 1}));
        assert_eq!(step.depends_on(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn depends_on_defaults_empty() {
        assert!(step_with_inputs(json!({})).depends_on().is_empty());
        assert!(step_with_inputs(json!({"_dependsOn": "notalist"}))
            .depends_on()
            .is_empty());
    }

    #[test]
    fn empty_policy_list_means_no_restriction() {
        let step = step_with_inputs(json!({"_policy": {"tools_allowed": []}}));
        assert!(step.tools_allowed().is_none());
    }

    #[test]
    fn policy_list_is_read() {
        let step = step_with_inputs(json!({"_policy": {"tools_allowed": ["git:clone"]}}));
        assert_eq!(step.tools_allowed(), Some(vec!["git:clone".to_string()]));
    }

    #[test]
    fn envelope_serializes_camel_case_with_dunder_attempt() {
        let env = StepReadyEnvelope::new(Uuid::new_v4(), Uuid::new_v4(), None);
        let value = serde_json::to_value(&env).unwrap();
        assert!(value.get("runId").is_some());
        assert!(value.get("stepId").is_some());
        assert_eq!(value.get("__attempt"), Some(&json!(1)));
        assert!(value.get("idempotencyKey").is_none());
    }

    #[test]
    fn envelope_attempt_defaults_to_one() {
        let env: StepReadyEnvelope = serde_json::from_value(json!({
            "runId": Uuid::new_v4(),
            "stepId": Uuid::new_v4(),
        }))
        .unwrap();
        assert_eq!(env.attempt, 1);
        assert_eq!(env.retry_count(), 0);
    }

    #[test]
    fn cancelled_dependency_counts_as_satisfied() {
        assert!(StepStatus::Cancelled.satisfies_dependency());
        assert!(StepStatus::Succeeded.satisfies_dependency());
        assert!(!StepStatus::Failed.satisfies_dependency());
        assert!(!StepStatus::Running.satisfies_dependency());
    }

    #[test]
    fn terminal_states() {
        assert!(StepStatus::TimedOut.is_terminal());
        assert!(!StepStatus::Ready.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }
}
