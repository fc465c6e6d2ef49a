//! PostgreSQL-backed store.
//!
//! The inbox's atomic mark-if-new maps to `INSERT ... ON CONFLICT DO
//! NOTHING`; the database's uniqueness constraint on `inbox.key` is the
//! cross-process mutex.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use super::Store;
use crate::kernel::error::StoreError;
use crate::kernel::model::{EventRecord, OutboxRow, Run, RunPatch, Step, StepPatch};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn create_run(&self, goal: &str, metadata: Value) -> Result<Run, StoreError> {
        let run = sqlx::query_as::<_, Run>(
            r#"
            INSERT INTO runs (id, status, goal, metadata, created_at)
            VALUES ($1, 'queued', $2, $3, NOW())
            RETURNING id, status, goal, metadata, created_at, started_at, ended_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(goal)
        .bind(&metadata)
        .fetch_one(&self.pool)
        .await?;

        Ok(run)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError> {
        let run = sqlx::query_as::<_, Run>(
            r#"
            SELECT id, status, goal, metadata, created_at, started_at, ended_at
            FROM runs
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(run)
    }

    async fn update_run(&self, run_id: Uuid, patch: RunPatch) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = COALESCE($2, status),
                started_at = COALESCE($3, started_at),
                ended_at = CASE WHEN $4 THEN $5 ELSE ended_at END
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(patch.status)
        .bind(patch.started_at)
        .bind(patch.ended_at.is_some())
        .bind(patch.ended_at.flatten())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("run", run_id));
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
        let step = sqlx::query_as::<_, Step>(
            r#"
            INSERT INTO steps (id, run_id, name, tool, inputs, outputs, status, idempotency_key, created_at)
            VALUES ($1, $2, $3, $4, $5, '{}'::jsonb, 'queued', $6, NOW())
            RETURNING id, run_id, name, tool, inputs, outputs, status, idempotency_key,
                      created_at, started_at, ended_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(run_id)
        .bind(name)
        .bind(tool)
        .bind(&inputs)
        .bind(idempotency_key)
        .fetch_one(&self.pool)
        .await?;

        Ok(step)
    }

    async fn get_step(&self, step_id: Uuid) -> Result<Option<Step>, StoreError> {
        let step = sqlx::query_as::<_, Step>(
            r#"
            SELECT id, run_id, name, tool, inputs, outputs, status, idempotency_key,
                   created_at, started_at, ended_at
            FROM steps
            WHERE id = $1
            "#,
        )
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(step)
    }

    async fn update_step(&self, step_id: Uuid, patch: StepPatch) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE steps
            SET status = COALESCE($2, status),
                outputs = COALESCE($3, outputs),
                started_at = COALESCE($4, started_at),
                ended_at = CASE WHEN $5 THEN $6 ELSE ended_at END
            WHERE id = $1
            "#,
        )
        .bind(step_id)
        .bind(patch.status)
        .bind(patch.outputs)
        .bind(patch.started_at)
        .bind(patch.ended_at.is_some())
        .bind(patch.ended_at.flatten())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("step", step_id));
        }
        Ok(())
    }

    async fn list_steps_by_run(&self, run_id: Uuid) -> Result<Vec<Step>, StoreError> {
        let steps = sqlx::query_as::<_, Step>(
            r#"
            SELECT id, run_id, name, tool, inputs, outputs, status, idempotency_key,
                   created_at, started_at, ended_at
            FROM steps
            WHERE run_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(steps)
    }

    async fn count_remaining_steps(&self, run_id: Uuid) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM steps
            WHERE run_id = $1
              AND status NOT IN ('succeeded', 'failed', 'timed_out', 'cancelled')
            "#,
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count as u64)
    }

    async fn record_event(
        &self,
        run_id: Uuid,
        event_type: &str,
        payload: Value,
        step_id: Option<Uuid>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO events (id, run_id, step_id, event_type, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(run_id)
        .bind(step_id)
        .bind(event_type)
        .bind(&payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_events_by_run(&self, run_id: Uuid) -> Result<Vec<EventRecord>, StoreError> {
        let events = sqlx::query_as::<_, EventRecord>(
            r#"
            SELECT id, run_id, step_id, event_type, payload, created_at
            FROM events
            WHERE run_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    async fn inbox_mark_if_new(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO inbox (key, created_at)
            VALUES ($1, NOW())
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn inbox_delete(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM inbox WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn outbox_add(&self, topic: &str, payload: Value) -> Result<OutboxRow, StoreError> {
        let row = sqlx::query_as::<_, OutboxRow>(
            r#"
            INSERT INTO outbox (id, topic, payload, created_at)
            VALUES ($1, $2, $3, NOW())
            RETURNING id, topic, payload, created_at, sent_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(topic)
        .bind(&payload)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn outbox_list_unsent(&self, limit: usize) -> Result<Vec<OutboxRow>, StoreError> {
        let rows = sqlx::query_as::<_, OutboxRow>(
            r#"
            SELECT id, topic, payload, created_at, sent_at
            FROM outbox
            WHERE sent_at IS NULL
            ORDER BY created_at
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn outbox_mark_sent(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET sent_at = NOW()
            WHERE id = $1 AND sent_at IS NULL
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        // A second mark of the same row is a no-op, not an error; the relay
        // may race itself across processes.
        let _ = result;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::model::StepStatus;

    async fn test_pool() -> Option<PgPool> {
        let url = std::env::var("DATABASE_URL").ok()?;
        PgPool::connect(&url).await.ok()
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn inbox_round_trip() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let store = PostgresStore::new(pool);
        let key = format!("test:{}", Uuid::new_v4());
        assert!(store.inbox_mark_if_new(&key).await.unwrap());
        assert!(!store.inbox_mark_if_new(&key).await.unwrap());
        store.inbox_delete(&key).await.unwrap();
        assert!(store.inbox_mark_if_new(&key).await.unwrap());
        store.inbox_delete(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn step_lifecycle_round_trip() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let store = PostgresStore::new(pool);
        let run = store
            .create_run("integration", serde_json::json!({}))
            .await
            .unwrap();
        let step = store
            .create_step(run.id, "echo", "test:echo", serde_json::json!({}), None)
            .await
            .unwrap();
        assert_eq!(store.count_remaining_steps(run.id).await.unwrap(), 1);

        store
            .update_step(
                step.id,
                StepPatch {
                    status: Some(StepStatus::Succeeded),
                    ended_at: Some(Some(chrono::Utc::now())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(store.count_remaining_steps(run.id).await.unwrap(), 0);
    }
}
