//! In-process store for tests and single-node deployments.
//!
//! All state lives behind one async mutex; `inbox_mark_if_new` is atomic
//! because the check and insert happen under the same lock.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::Store;
use crate::kernel::error::StoreError;
use crate::kernel::model::{
    EventRecord, OutboxRow, Run, RunPatch, RunStatus, Step, StepPatch, StepStatus,
};

#[derive(Default)]
struct Inner {
    runs: HashMap<Uuid, Run>,
    steps: HashMap<Uuid, Step>,
    events: Vec<EventRecord>,
    inbox: HashSet<String>,
    outbox: Vec<OutboxRow>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_run(&self, goal: &str, metadata: Value) -> Result<Run, StoreError> {
        let run = Run {
            id: Uuid::new_v4(),
            status: RunStatus::Queued,
            goal: goal.to_owned(),
            metadata,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        };
        self.inner.lock().await.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError> {
        Ok(self.inner.lock().await.runs.get(&run_id).cloned())
    }

    async fn update_run(&self, run_id: Uuid, patch: RunPatch) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| StoreError::not_found("run", run_id))?;
        if let Some(status) = patch.status {
            run.status = status;
        }
        if let Some(started_at) = patch.started_at {
            run.started_at = Some(started_at);
        }
        if let Some(ended_at) = patch.ended_at {
            run.ended_at = ended_at;
        }
        Ok(())
    }

    async fn create_step(
        &self,
        run_id: Uuid,
        name: &str,
        tool: &str,
        inputs: Value,
        idempotency_key: Option<String>,
    ) -> Result<Step, StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.runs.contains_key(&run_id) {
            return Err(StoreError::not_found("run", run_id));
        }
        let step = Step {
            id: Uuid::new_v4(),
            run_id,
            name: name.to_owned(),
            tool: tool.to_owned(),
            inputs,
            outputs: Value::Object(Default::default()),
            status: StepStatus::Queued,
            idempotency_key,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        };
        inner.steps.insert(step.id, step.clone());
        Ok(step)
    }

    async fn get_step(&self, step_id: Uuid) -> Result<Option<Step>, StoreError> {
        Ok(self.inner.lock().await.steps.get(&step_id).cloned())
    }

    async fn update_step(&self, step_id: Uuid, patch: StepPatch) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let step = inner
            .steps
            .get_mut(&step_id)
            .ok_or_else(|| StoreError::not_found("step", step_id))?;
        if let Some(status) = patch.status {
            step.status = status;
        }
        if let Some(outputs) = patch.outputs {
            step.outputs = outputs;
        }
        if let Some(started_at) = patch.started_at {
            step.started_at = Some(started_at);
        }
        if let Some(ended_at) = patch.ended_at {
            step.ended_at = ended_at;
        }
        Ok(())
    }

    async fn list_steps_by_run(&self, run_id: Uuid) -> Result<Vec<Step>, StoreError> {
        let inner = self.inner.lock().await;
        let mut steps: Vec<Step> = inner
            .steps
            .values()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.created_at);
        Ok(steps)
    }

    async fn count_remaining_steps(&self, run_id: Uuid) -> Result<u64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .steps
            .values()
            .filter(|s| s.run_id == run_id && !s.status.is_terminal())
            .count() as u64)
    }

    async fn record_event(
        &self,
        run_id: Uuid,
        event_type: &str,
        payload: Value,
        step_id: Option<Uuid>,
    ) -> Result<(), StoreError> {
        self.inner.lock().await.events.push(EventRecord {
            id: Uuid::new_v4(),
            run_id,
            step_id,
            event_type: event_type.to_owned(),
            payload,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_events_by_run(&self, run_id: Uuid) -> Result<Vec<EventRecord>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .events
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn inbox_mark_if_new(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.inner.lock().await.inbox.insert(key.to_owned()))
    }

    async fn inbox_delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.lock().await.inbox.remove(key);
        Ok(())
    }

    async fn outbox_add(&self, topic: &str, payload: Value) -> Result<OutboxRow, StoreError> {
        let row = OutboxRow {
            id: Uuid::new_v4(),
            topic: topic.to_owned(),
            payload,
            created_at: Utc::now(),
            sent_at: None,
        };
        self.inner.lock().await.outbox.push(row.clone());
        Ok(row)
    }

    async fn outbox_list_unsent(&self, limit: usize) -> Result<Vec<OutboxRow>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .outbox
            .iter()
            .filter(|r| r.sent_at.is_none())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn outbox_mark_sent(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .outbox
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::not_found("outbox row", id))?;
        if row.sent_at.is_none() {
            row.sent_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn inbox_mark_if_new_is_first_wins() {
        let store = MemoryStore::new();
        assert!(store.inbox_mark_if_new("k").await.unwrap());
        assert!(!store.inbox_mark_if_new("k").await.unwrap());
        store.inbox_delete("k").await.unwrap();
        assert!(store.inbox_mark_if_new("k").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_mark_if_new_admits_exactly_one() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(
                async move { store.inbox_mark_if_new("race").await },
            ));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn count_remaining_ignores_terminal_steps() {
        let store = MemoryStore::new();
        let run = store.create_run("goal", json!({})).await.unwrap();
        let a = store
            .create_step(run.id, "a", "test:echo", json!({}), None)
            .await
            .unwrap();
        store
            .create_step(run.id, "b", "test:echo", json!({}), None)
            .await
            .unwrap();
        assert_eq!(store.count_remaining_steps(run.id).await.unwrap(), 2);

        store
            .update_step(
                a.id,
                StepPatch {
                    status: Some(StepStatus::Succeeded),
                    ended_at: Some(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(store.count_remaining_steps(run.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn update_unknown_step_is_fatal() {
        let store = MemoryStore::new();
        let err = store
            .update_step(Uuid::new_v4(), StepPatch::default())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn outbox_mark_sent_hides_row_from_unsent_list() {
        let store = MemoryStore::new();
        let row = store.outbox_add("outbox", json!({"x": 1})).await.unwrap();
        assert_eq!(store.outbox_list_unsent(10).await.unwrap().len(), 1);
        store.outbox_mark_sent(row.id).await.unwrap();
        assert!(store.outbox_list_unsent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn patch_can_clear_ended_at() {
        let store = MemoryStore::new();
        let run = store.create_run("goal", json!({})).await.unwrap();
        let step = store
            .create_step(run.id, "a", "test:fail", json!({}), None)
            .await
            .unwrap();
        store
            .update_step(
                step.id,
                StepPatch {
                    status: Some(StepStatus::Failed),
                    ended_at: Some(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .update_step(
                step.id,
                StepPatch {
                    status: Some(StepStatus::Queued),
                    ended_at: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let step = store.get_step(step.id).await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Queued);
        assert!(step.ended_at.is_none());
    }
}
