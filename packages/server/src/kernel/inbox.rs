//! Idempotency inbox: the process-wide de-duplication guard.
//!
//! Wraps the store's atomic `mark-if-new` primitive. Two key families are
//! used: the envelope key (client-supplied or derived from the step's
//! identity and inputs) guards whole deliveries, and the `step-exec:` lease
//! guards against two workers executing the same step concurrently.

use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use crate::common::idempotency::derive_step_key;
use crate::kernel::error::StoreError;
use crate::kernel::model::{Step, StepReadyEnvelope};
use crate::kernel::store::Store;

#[derive(Clone)]
pub struct Inbox {
    store: Arc<dyn Store>,
}

impl Inbox {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Returns `true` iff the key was new; at most one concurrent caller
    /// observes `true` for a given key.
    pub async fn acquire(&self, key: &str) -> Result<bool, StoreError> {
        self.store.inbox_mark_if_new(key).await
    }

    /// Release a key. Failures are logged, never re-thrown: a lingering key
    /// only delays redelivery, while an error here would mask the real
    /// outcome of the guarded action.
    pub async fn release(&self, key: &str) {
        if let Err(e) = self.store.inbox_delete(key).await {
            warn!(key = %key, error = %e, "failed to release inbox key");
        }
    }

    /// Second-layer lease guarding concurrent executions of one step.
    pub fn execution_lease_key(step_id: Uuid) -> String {
        format!("step-exec:{step_id}")
    }

    /// Envelope-level key: the envelope's `idempotencyKey` when present,
    /// otherwise derived from the step's run, name, and inputs.
    pub fn envelope_key(envelope: &StepReadyEnvelope, step: &Step) -> String {
        match &envelope.idempotency_key {
            Some(key) => key.clone(),
            None => derive_step_key(step.run_id, &step.name, &step.inputs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::model::StepStatus;
    use crate::kernel::store::MemoryStore;
    use chrono::Utc;
    use serde_json::json;

    fn step(run_id: Uuid) -> Step {
        Step {
            id: Uuid::new_v4(),
            run_id,
            name: "echo".into(),
            tool: "test:echo".into(),
            inputs: json!({"foo": "bar"}),
            outputs: json!({}),
            status: StepStatus::Queued,
            idempotency_key: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    #[test]
    fn envelope_key_prefers_supplied_key() {
        let run_id = Uuid::new_v4();
        let step = step(run_id);
        let mut env = StepReadyEnvelope::new(run_id, step.id, Some("client-key".into()));
        assert_eq!(Inbox::envelope_key(&env, &step), "client-key");

        env.idempotency_key = None;
        let derived = Inbox::envelope_key(&env, &step);
        assert!(derived.starts_with(&format!("{run_id}:echo:")));
    }

    #[tokio::test]
    async fn acquire_release_cycle() {
        let inbox = Inbox::new(Arc::new(MemoryStore::new()));
        assert!(inbox.acquire("k").await.unwrap());
        assert!(!inbox.acquire("k").await.unwrap());
        inbox.release("k").await;
        assert!(inbox.acquire("k").await.unwrap());
    }
}
