//! PostgreSQL-backed queue driver.
//!
//! Jobs live in a single `queue_jobs` table; dead-lettered jobs move to
//! `queue_dlq`. Claiming uses `FOR UPDATE SKIP LOCKED` inside a transaction
//! that flips the row to `processing` and stamps `locked_until` and
//! `worker_id`, so parallel workers never double-claim. A sweep on the same
//! cadence re-pends rows whose lock expired.
//!
//! Retry backoff: `min(2^(attempt - 1) seconds, 30s)` applied via `run_at`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{inject_attempt, EnqueueOptions, JobHandler, QueueDriver, DEFAULT_MAX_ATTEMPTS};
use crate::kernel::error::QueueError;
use crate::kernel::model::{QueueCounts, QueueJob};

const RETRY_CAP_SECS: i64 = 30;

fn retry_delay_secs(attempt: i32) -> i64 {
    1i64.checked_shl(attempt.saturating_sub(1).clamp(0, 30) as u32)
        .unwrap_or(RETRY_CAP_SECS)
        .min(RETRY_CAP_SECS)
}

#[derive(Debug, Clone)]
pub struct PostgresQueueConfig {
    /// How often the consumer polls for claimable jobs.
    pub poll_interval: Duration,
    /// Claim lease; must exceed the longest expected handler time.
    pub lock_duration: Duration,
    /// Jobs claimed per poll.
    pub batch_size: i64,
}

impl Default for PostgresQueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            lock_duration: Duration::from_secs(60),
            batch_size: 10,
        }
    }
}

struct PgInner {
    pool: PgPool,
    worker_id: String,
    config: PostgresQueueConfig,
    soft_limit: Option<u64>,
    delivery_slots: Arc<Semaphore>,
    subscribers: DashMap<String, ()>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct PostgresQueue {
    inner: Arc<PgInner>,
}

impl PostgresQueue {
    pub fn new(
        pool: PgPool,
        config: PostgresQueueConfig,
        concurrency: usize,
        soft_limit: Option<u64>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(PgInner {
                pool,
                worker_id: format!("worker-{}", Uuid::new_v4()),
                config,
                soft_limit,
                delivery_slots: Arc::new(Semaphore::new(concurrency.max(1))),
                subscribers: DashMap::new(),
                shutdown,
            }),
        }
    }

    /// Re-pend jobs whose claim lease expired (crashed or wedged worker).
    async fn sweep_expired(inner: &PgInner, topic: &str) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'pending',
                locked_until = NULL,
                worker_id = NULL,
                updated_at = NOW()
            WHERE topic = $1
              AND status = 'processing'
              AND locked_until < NOW()
            "#,
        )
        .bind(topic)
        .execute(&inner.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn claim(inner: &PgInner, topic: &str) -> Result<Vec<QueueJob>, QueueError> {
        let jobs = sqlx::query_as::<_, QueueJob>(
            r#"
            WITH next_jobs AS (
                SELECT id
                FROM queue_jobs
                WHERE topic = $1
                  AND status = 'pending'
                  AND run_at <= NOW()
                ORDER BY run_at, created_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queue_jobs
            SET status = 'processing',
                locked_until = NOW() + ($3 || ' milliseconds')::INTERVAL,
                worker_id = $4,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_jobs)
            RETURNING id, topic, payload, status, attempts, max_attempts,
                      created_at, updated_at, locked_until, worker_id, error
            "#,
        )
        .bind(topic)
        .bind(inner.config.batch_size)
        .bind(inner.config.lock_duration.as_millis().to_string())
        .bind(&inner.worker_id)
        .fetch_all(&inner.pool)
        .await?;

        Ok(jobs)
    }

    async fn run_consumer(inner: Arc<PgInner>, topic: String, handler: JobHandler) {
        loop {
            if inner.shutdown.is_cancelled() {
                break;
            }

            if let Err(e) = Self::sweep_expired(&inner, &topic).await {
                warn!(topic = %topic, error = %e, "lease sweep failed");
            }

            let jobs = match Self::claim(&inner, &topic).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!(topic = %topic, error = %e, "failed to claim jobs");
                    tokio::select! {
                        _ = inner.shutdown.cancelled() => break,
                        _ = sleep(Duration::from_secs(1)) => {}
                    }
                    continue;
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = sleep(inner.config.poll_interval) => {}
                }
                continue;
            }

            debug!(topic = %topic, count = jobs.len(), "claimed jobs");
            for job in jobs {
                let permit = match inner.delivery_slots.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let inner = inner.clone();
                let topic = topic.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    Self::deliver(inner, topic, handler, job).await;
                    drop(permit);
                });
            }
        }
        debug!(topic = %topic, "postgres queue consumer stopped");
    }

    async fn deliver(inner: Arc<PgInner>, topic: String, handler: JobHandler, job: QueueJob) {
        let attempt = job.attempts + 1;
        let delivered = inject_attempt(&job.payload, attempt);
        let result = handler(delivered).await;

        let outcome = match result {
            Ok(()) => Self::mark_completed(&inner, job.id).await,
            Err(handler_err) => {
                if attempt >= job.max_attempts {
                    warn!(
                        topic = %topic,
                        job_id = %job.id,
                        attempts = attempt,
                        error = %handler_err,
                        "job exhausted attempts, moving to dlq"
                    );
                    Self::move_to_dlq(&inner, job.id, attempt, &handler_err.to_string()).await
                } else {
                    let delay_secs = retry_delay_secs(attempt);
                    debug!(
                        topic = %topic,
                        job_id = %job.id,
                        attempt,
                        delay_secs,
                        "job failed, scheduling retry"
                    );
                    Self::schedule_retry(&inner, job.id, attempt, delay_secs, &handler_err.to_string())
                        .await
                }
            }
        };

        if let Err(e) = outcome {
            // The lease sweep re-pends the row once locked_until expires,
            // so a lost status write degrades to a redelivery.
            warn!(topic = %topic, job_id = %job.id, error = %e, "failed to persist job outcome");
        }
    }

    async fn mark_completed(inner: &PgInner, job_id: Uuid) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'completed',
                locked_until = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&inner.pool)
        .await?;
        Ok(())
    }

    async fn schedule_retry(
        inner: &PgInner,
        job_id: Uuid,
        attempts: i32,
        delay_secs: i64,
        error: &str,
    ) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'pending',
                attempts = $2,
                error = $3,
                run_at = NOW() + ($4 || ' seconds')::INTERVAL,
                locked_until = NULL,
                worker_id = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(attempts)
        .bind(error)
        .bind(delay_secs.to_string())
        .execute(&inner.pool)
        .await?;
        Ok(())
    }

    async fn move_to_dlq(
        inner: &PgInner,
        job_id: Uuid,
        attempts: i32,
        error: &str,
    ) -> Result<(), QueueError> {
        let mut tx = inner.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO queue_dlq (id, topic, payload, status, attempts, max_attempts,
                                   created_at, updated_at, error)
            SELECT id, topic, payload, 'dlq', $2, max_attempts, created_at, NOW(), $3
            FROM queue_jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(attempts)
        .bind(error)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM queue_jobs WHERE id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl QueueDriver for PostgresQueue {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn enqueue(
        &self,
        topic: &str,
        payload: Value,
        opts: EnqueueOptions,
    ) -> Result<(), QueueError> {
        if let Some(limit) = self.inner.soft_limit {
            let depth: i64 = sqlx::query_scalar(
                r#"
                SELECT COUNT(*)
                FROM queue_jobs
                WHERE topic = $1 AND status IN ('pending', 'processing')
                "#,
            )
            .bind(topic)
            .fetch_one(&self.inner.pool)
            .await?;
            if depth as u64 >= limit {
                return Err(QueueError::Saturated {
                    topic: topic.to_owned(),
                    depth: depth as u64,
                    limit,
                });
            }
        }

        let delay_ms = opts.delay.map(|d| d.as_millis() as i64).unwrap_or(0);
        sqlx::query(
            r#"
            INSERT INTO queue_jobs (id, topic, payload, status, attempts, max_attempts,
                                    run_at, created_at, updated_at)
            VALUES ($1, $2, $3, 'pending', 0, $4,
                    NOW() + ($5 || ' milliseconds')::INTERVAL, NOW(), NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(topic)
        .bind(&payload)
        .bind(opts.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1))
        .bind(delay_ms.to_string())
        .execute(&self.inner.pool)
        .await?;

        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: JobHandler) -> Result<(), QueueError> {
        if self.inner.subscribers.insert(topic.to_owned(), ()).is_some() {
            return Err(QueueError::backend(anyhow::anyhow!(
                "topic {topic} already has a subscriber"
            )));
        }
        tokio::spawn(Self::run_consumer(
            self.inner.clone(),
            topic.to_owned(),
            handler,
        ));
        Ok(())
    }

    async fn counts(&self, topic: &str) -> Result<QueueCounts, QueueError> {
        let row: (i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending' AND run_at <= NOW()),
                COUNT(*) FILTER (WHERE status = 'pending' AND run_at > NOW()),
                COUNT(*) FILTER (WHERE status = 'processing'),
                COUNT(*) FILTER (WHERE status = 'completed'),
                COUNT(*) FILTER (WHERE status = 'pending' AND attempts > 0)
            FROM queue_jobs
            WHERE topic = $1
            "#,
        )
        .bind(topic)
        .fetch_one(&self.inner.pool)
        .await?;

        let dlq: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_dlq WHERE topic = $1")
            .bind(topic)
            .fetch_one(&self.inner.pool)
            .await?;

        Ok(QueueCounts {
            pending: row.0 as u64,
            delayed: row.1 as u64,
            processing: row.2 as u64,
            completed: row.3 as u64,
            failed: row.4 as u64,
            dlq: dlq as u64,
        })
    }

    async fn list_dlq(&self, topic: &str, limit: usize) -> Result<Vec<QueueJob>, QueueError> {
        let jobs = sqlx::query_as::<_, QueueJob>(
            r#"
            SELECT id, topic, payload, status, attempts, max_attempts,
                   created_at, updated_at, locked_until, worker_id, error
            FROM queue_dlq
            WHERE topic = $1
            ORDER BY updated_at DESC
            LIMIT $2
            "#,
        )
        .bind(topic)
        .bind(limit as i64)
        .fetch_all(&self.inner.pool)
        .await?;

        Ok(jobs)
    }

    async fn rehydrate_dlq(&self, topic: &str, max: usize) -> Result<usize, QueueError> {
        let mut tx = self.inner.pool.begin().await?;
        let result = sqlx::query(
            r#"
            WITH moved AS (
                DELETE FROM queue_dlq
                WHERE id IN (
                    SELECT id FROM queue_dlq
                    WHERE topic = $1
                    ORDER BY updated_at
                    LIMIT $2
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING id, topic, payload, max_attempts, created_at
            )
            INSERT INTO queue_jobs (id, topic, payload, status, attempts, max_attempts,
                                    run_at, created_at, updated_at)
            SELECT id, topic, payload, 'pending', 0, max_attempts, NOW(), created_at, NOW()
            FROM moved
            "#,
        )
        .bind(topic)
        .bind(max as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(result.rows_affected() as usize)
    }

    async fn oldest_age_ms(&self, topic: &str) -> Result<Option<i64>, QueueError> {
        let oldest: Option<chrono::DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT MIN(created_at)
            FROM queue_jobs
            WHERE topic = $1 AND status = 'pending' AND run_at <= NOW()
            "#,
        )
        .bind(topic)
        .fetch_one(&self.inner.pool)
        .await?;

        Ok(oldest.map(|created| (Utc::now() - created).num_milliseconds().max(0)))
    }

    fn has_subscribers(&self, topic: &str) -> bool {
        self.inner.subscribers.contains_key(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use serde_json::json;

    #[test]
    fn retry_delay_doubles_from_one_second() {
        assert_eq!(retry_delay_secs(1), 1);
        assert_eq!(retry_delay_secs(2), 2);
        assert_eq!(retry_delay_secs(3), 4);
        assert_eq!(retry_delay_secs(20), 30);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn enqueue_deliver_round_trip() {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return;
        };
        let pool = PgPool::connect(&url).await.unwrap();
        let queue = PostgresQueue::new(
            pool,
            PostgresQueueConfig {
                poll_interval: Duration::from_millis(100),
                ..Default::default()
            },
            4,
            None,
            CancellationToken::new(),
        );
        let topic = format!("it-{}", Uuid::new_v4());
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let handler: JobHandler = Arc::new(move |_| {
            let seen = seen.clone();
            Box::pin(async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        queue.subscribe(&topic, handler).await.unwrap();
        queue
            .enqueue(&topic, json!({"k": 1}), EnqueueOptions::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.counts(&topic).await.unwrap().completed, 1);
    }
}
