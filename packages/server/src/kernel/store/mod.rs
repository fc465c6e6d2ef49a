//! Durable storage for runs, steps, events, inbox, and outbox.
//!
//! The store owns all persistent state except queue jobs, which belong to
//! the queue driver. Operations are typed; no queue logic lives here.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::error::StoreError;
use super::model::{EventRecord, OutboxRow, Run, RunPatch, Step, StepPatch};

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_run(&self, goal: &str, metadata: Value) -> Result<Run, StoreError>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError>;

    /// Apply a partial update. Unknown `run_id` is an invariant violation.
    async fn update_run(&self, run_id: Uuid, patch: RunPatch) -> Result<(), StoreError>;

    async fn create_step(
        &self,
        run_id: Uuid,
        name: &str,
        tool: &str,
        inputs: Value,
        idempotency_key: Option<String>,
    ) -> Result<Step, StoreError>;

    async fn get_step(&self, step_id: Uuid) -> Result<Option<Step>, StoreError>;

    /// Apply a partial update. Unknown `step_id` is an invariant violation.
    async fn update_step(&self, step_id: Uuid, patch: StepPatch) -> Result<(), StoreError>;

    async fn list_steps_by_run(&self, run_id: Uuid) -> Result<Vec<Step>, StoreError>;

    /// Count steps of the run whose status is not terminal.
    async fn count_remaining_steps(&self, run_id: Uuid) -> Result<u64, StoreError>;

    /// Append a domain event. Events for a given step are appended in call
    /// order.
    async fn record_event(
        &self,
        run_id: Uuid,
        event_type: &str,
        payload: Value,
        step_id: Option<Uuid>,
    ) -> Result<(), StoreError>;

    async fn list_events_by_run(&self, run_id: Uuid) -> Result<Vec<EventRecord>, StoreError>;

    /// Atomic mark-if-new: returns `true` iff the key was absent and has now
    /// been inserted. At most one concurrent caller observes `true` for a
    /// given key.
    async fn inbox_mark_if_new(&self, key: &str) -> Result<bool, StoreError>;

    async fn inbox_delete(&self, key: &str) -> Result<(), StoreError>;

    async fn outbox_add(&self, topic: &str, payload: Value) -> Result<OutboxRow, StoreError>;

    /// Unsent rows ordered by `created_at` ascending.
    async fn outbox_list_unsent(&self, limit: usize) -> Result<Vec<OutboxRow>, StoreError>;

    async fn outbox_mark_sent(&self, id: Uuid) -> Result<(), StoreError>;
}
