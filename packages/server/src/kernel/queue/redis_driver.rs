//! Redis-backed queue driver.
//!
//! Key space per topic (namespace `sf`):
//! - `sf:{topic}:pending` - list of claimable job records (LPUSH / RPOP)
//! - `sf:{topic}:delayed` - sorted set scored by ready time in epoch millis
//! - `sf:{topic}:stats` - hash with cumulative `completed` / `failed`
//! - `sf:dlq:{topic}` - list of dead-lettered job records
//!
//! A mover task promotes due members of the delayed set into the pending
//! list; the consumer polls the pending list. Retry backoff:
//! `min(1000 * 2^attempt ms, 30s)`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{inject_attempt, EnqueueOptions, JobHandler, QueueDriver, DEFAULT_MAX_ATTEMPTS};
use crate::kernel::error::QueueError;
use crate::kernel::model::{JobStatus, QueueCounts, QueueJob};

const NAMESPACE: &str = "sf";
const RETRY_CAP_MS: i64 = 30_000;
const MOVER_BATCH: isize = 100;
const HEARTBEAT_TTL_SECS: u64 = 10;

fn retry_delay_ms(attempt: i32) -> i64 {
    1000i64
        .saturating_mul(1i64 << attempt.clamp(0, 30))
        .min(RETRY_CAP_MS)
}

struct RedisInner {
    manager: ConnectionManager,
    poll_interval: Duration,
    soft_limit: Option<u64>,
    delivery_slots: Arc<Semaphore>,
    subscribers: DashMap<String, ()>,
    in_flight: DashMap<String, Arc<AtomicU64>>,
    shutdown: CancellationToken,
}

impl RedisInner {
    fn pending_key(&self, topic: &str) -> String {
        format!("{NAMESPACE}:{topic}:pending")
    }

    fn delayed_key(&self, topic: &str) -> String {
        format!("{NAMESPACE}:{topic}:delayed")
    }

    fn stats_key(&self, topic: &str) -> String {
        format!("{NAMESPACE}:{topic}:stats")
    }

    fn dlq_key(&self, topic: &str) -> String {
        format!("{NAMESPACE}:dlq:{topic}")
    }

    fn in_flight(&self, topic: &str) -> Arc<AtomicU64> {
        self.in_flight
            .entry(topic.to_owned())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }
}

#[derive(Clone)]
pub struct RedisQueue {
    inner: Arc<RedisInner>,
}

impl RedisQueue {
    pub async fn connect(
        url: &str,
        concurrency: usize,
        soft_limit: Option<u64>,
        shutdown: CancellationToken,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            inner: Arc::new(RedisInner {
                manager,
                poll_interval: Duration::from_millis(250),
                soft_limit,
                delivery_slots: Arc::new(Semaphore::new(concurrency.max(1))),
                subscribers: DashMap::new(),
                in_flight: DashMap::new(),
                shutdown,
            }),
        })
    }

    /// Promote due delayed jobs into the pending list.
    async fn move_due_jobs(inner: &RedisInner, topic: &str) -> Result<(), QueueError> {
        let mut con = inner.manager.clone();
        let delayed_key = inner.delayed_key(topic);
        let pending_key = inner.pending_key(topic);
        let now_ms = Utc::now().timestamp_millis();

        let due: Vec<String> = con
            .zrangebyscore_limit(&delayed_key, 0i64, now_ms, 0, MOVER_BATCH)
            .await?;
        for member in due {
            // ZREM returning 1 means this process won the member; only the
            // winner pushes it, so concurrent movers cannot double-deliver.
            let removed: i64 = con.zrem(&delayed_key, &member).await?;
            if removed == 1 {
                con.lpush::<_, _, ()>(&pending_key, &member).await?;
            }
        }
        Ok(())
    }

    async fn run_mover(inner: Arc<RedisInner>, topic: String) {
        loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                _ = sleep(inner.poll_interval) => {}
            }
            if let Err(e) = Self::move_due_jobs(&inner, &topic).await {
                warn!(topic = %topic, error = %e, "failed to promote delayed jobs");
            }
        }
    }

    async fn run_consumer(inner: Arc<RedisInner>, topic: String, handler: JobHandler) {
        let pending_key = inner.pending_key(topic.as_str());
        loop {
            if inner.shutdown.is_cancelled() {
                break;
            }

            let mut con = inner.manager.clone();
            let popped: Result<Option<String>, redis::RedisError> =
                con.rpop(&pending_key, None).await;

            match popped {
                Ok(Some(raw)) => {
                    let job: QueueJob = match serde_json::from_str(&raw) {
                        Ok(job) => job,
                        Err(e) => {
                            error!(topic = %topic, error = %e, "unparseable job record, dropping to dlq");
                            let mut con = inner.manager.clone();
                            let _: Result<(), _> =
                                con.lpush(inner.dlq_key(&topic), &raw).await;
                            continue;
                        }
                    };
                    let permit = match inner.delivery_slots.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let inner = inner.clone();
                    let topic = topic.clone();
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        Self::deliver(inner, topic, handler, job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    tokio::select! {
                        _ = inner.shutdown.cancelled() => break,
                        _ = sleep(inner.poll_interval) => {}
                    }
                }
                Err(e) => {
                    warn!(topic = %topic, error = %e, "failed to pop pending job");
                    tokio::select! {
                        _ = inner.shutdown.cancelled() => break,
                        _ = sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
        debug!(topic = %topic, "redis queue consumer stopped");
    }

    async fn deliver(inner: Arc<RedisInner>, topic: String, handler: JobHandler, mut job: QueueJob) {
        let counter = inner.in_flight(&topic);
        counter.fetch_add(1, Ordering::SeqCst);

        let attempt = job.attempts + 1;
        let delivered = inject_attempt(&job.payload, attempt);
        let result = handler(delivered).await;

        let mut con = inner.manager.clone();
        let stats_key = inner.stats_key(&topic);
        match result {
            Ok(()) => {
                if let Err(e) = con.hincr::<_, _, _, ()>(&stats_key, "completed", 1).await {
                    warn!(topic = %topic, error = %e, "failed to bump completed counter");
                }
            }
            Err(handler_err) => {
                if let Err(e) = con.hincr::<_, _, _, ()>(&stats_key, "failed", 1).await {
                    warn!(topic = %topic, error = %e, "failed to bump failed counter");
                }
                job.attempts = attempt;
                job.error = Some(handler_err.to_string());
                job.updated_at = Utc::now();

                let outcome = if job.attempts >= job.max_attempts {
                    warn!(
                        topic = %topic,
                        job_id = %job.id,
                        attempts = job.attempts,
                        error = %handler_err,
                        "job exhausted attempts, moving to dlq"
                    );
                    job.status = JobStatus::Dlq;
                    match serde_json::to_string(&job) {
                        Ok(raw) => con.lpush::<_, _, ()>(inner.dlq_key(&topic), raw).await,
                        Err(e) => {
                            error!(job_id = %job.id, error = %e, "failed to serialize dlq job");
                            Ok(())
                        }
                    }
                } else {
                    let delay_ms = retry_delay_ms(job.attempts);
                    let ready_at = Utc::now().timestamp_millis() + delay_ms;
                    debug!(
                        topic = %topic,
                        job_id = %job.id,
                        attempt = job.attempts,
                        delay_ms,
                        "job failed, scheduling retry"
                    );
                    job.status = JobStatus::Pending;
                    match serde_json::to_string(&job) {
                        Ok(raw) => {
                            con.zadd::<_, _, _, ()>(inner.delayed_key(&topic), raw, ready_at)
                                .await
                        }
                        Err(e) => {
                            error!(job_id = %job.id, error = %e, "failed to serialize retry job");
                            Ok(())
                        }
                    }
                };
                if let Err(e) = outcome {
                    // The pop already consumed the record; all we can do is
                    // log the loss loudly.
                    error!(topic = %topic, job_id = %job.id, error = %e, "failed to reschedule job");
                }
            }
        }

        counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl QueueDriver for RedisQueue {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn enqueue(
        &self,
        topic: &str,
        payload: Value,
        opts: EnqueueOptions,
    ) -> Result<(), QueueError> {
        let mut con = self.inner.manager.clone();
        let pending_key = self.inner.pending_key(topic);
        let delayed_key = self.inner.delayed_key(topic);

        if let Some(limit) = self.inner.soft_limit {
            let pending: u64 = con.llen(&pending_key).await?;
            let delayed: u64 = con.zcard(&delayed_key).await?;
            let depth = pending + delayed;
            if depth >= limit {
                return Err(QueueError::Saturated {
                    topic: topic.to_owned(),
                    depth,
                    limit,
                });
            }
        }

        let now = Utc::now();
        let job = QueueJob {
            id: Uuid::new_v4(),
            topic: topic.to_owned(),
            payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: opts.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1),
            created_at: now,
            updated_at: now,
            locked_until: None,
            worker_id: None,
            error: None,
        };
        let raw = serde_json::to_string(&job).map_err(QueueError::backend)?;

        match opts.delay {
            Some(delay) if !delay.is_zero() => {
                let ready_at = now.timestamp_millis() + delay.as_millis() as i64;
                con.zadd::<_, _, _, ()>(&delayed_key, raw, ready_at).await?;
            }
            _ => {
                con.lpush::<_, _, ()>(&pending_key, raw).await?;
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: JobHandler) -> Result<(), QueueError> {
        if self.inner.subscribers.insert(topic.to_owned(), ()).is_some() {
            return Err(QueueError::backend(anyhow::anyhow!(
                "topic {topic} already has a subscriber"
            )));
        }
        tokio::spawn(Self::run_mover(self.inner.clone(), topic.to_owned()));
        tokio::spawn(Self::run_consumer(
            self.inner.clone(),
            topic.to_owned(),
            handler,
        ));
        Ok(())
    }

    async fn counts(&self, topic: &str) -> Result<QueueCounts, QueueError> {
        let mut con = self.inner.manager.clone();
        let pending: u64 = con.llen(self.inner.pending_key(topic)).await?;
        let delayed: u64 = con.zcard(self.inner.delayed_key(topic)).await?;
        let dlq: u64 = con.llen(self.inner.dlq_key(topic)).await?;
        let completed: Option<u64> = con.hget(self.inner.stats_key(topic), "completed").await?;
        let failed: Option<u64> = con.hget(self.inner.stats_key(topic), "failed").await?;
        Ok(QueueCounts {
            pending,
            processing: self.inner.in_flight(topic).load(Ordering::SeqCst),
            completed: completed.unwrap_or(0),
            failed: failed.unwrap_or(0),
            delayed,
            dlq,
        })
    }

    async fn list_dlq(&self, topic: &str, limit: usize) -> Result<Vec<QueueJob>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut con = self.inner.manager.clone();
        let raws: Vec<String> = con
            .lrange(self.inner.dlq_key(topic), 0, limit as isize - 1)
            .await?;
        let mut jobs = Vec::with_capacity(raws.len());
        for raw in raws {
            match serde_json::from_str(&raw) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(topic = %topic, error = %e, "skipping unparseable dlq record"),
            }
        }
        Ok(jobs)
    }

    async fn rehydrate_dlq(&self, topic: &str, max: usize) -> Result<usize, QueueError> {
        let mut con = self.inner.manager.clone();
        let dlq_key = self.inner.dlq_key(topic);
        let pending_key = self.inner.pending_key(topic);
        let mut moved = 0;

        while moved < max {
            let raw: Option<String> = con.rpop(&dlq_key, None).await?;
            let Some(raw) = raw else {
                break;
            };
            let mut job: QueueJob = match serde_json::from_str(&raw) {
                Ok(job) => job,
                Err(e) => {
                    warn!(topic = %topic, error = %e, "dropping unparseable dlq record");
                    continue;
                }
            };
            job.status = JobStatus::Pending;
            job.attempts = 0;
            job.error = None;
            job.updated_at = Utc::now();
            let raw = serde_json::to_string(&job).map_err(QueueError::backend)?;
            con.lpush::<_, _, ()>(&pending_key, raw).await?;
            moved += 1;
        }
        Ok(moved)
    }

    async fn oldest_age_ms(&self, topic: &str) -> Result<Option<i64>, QueueError> {
        let mut con = self.inner.manager.clone();
        // LPUSH prepends, so the list tail is the oldest pending record.
        let raw: Option<String> = con.lindex(self.inner.pending_key(topic), -1).await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let job: QueueJob = serde_json::from_str(&raw).map_err(QueueError::backend)?;
        Ok(Some((Utc::now() - job.created_at).num_milliseconds().max(0)))
    }

    fn has_subscribers(&self, topic: &str) -> bool {
        self.inner.subscribers.contains_key(topic)
    }

    async fn record_heartbeat(&self, worker_id: &str) -> Result<(), QueueError> {
        let mut con = self.inner.manager.clone();
        let key = format!("{NAMESPACE}:worker:{worker_id}:heartbeat");
        con.set_ex::<_, _, ()>(key, Utc::now().timestamp_millis(), HEARTBEAT_TTL_SECS)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use serde_json::json;

    #[test]
    fn retry_delay_doubles_and_caps() {
        assert_eq!(retry_delay_ms(1), 2_000);
        assert_eq!(retry_delay_ms(2), 4_000);
        assert_eq!(retry_delay_ms(3), 8_000);
        assert_eq!(retry_delay_ms(10), 30_000);
        let mut last = 0;
        for attempt in 1..32 {
            let d = retry_delay_ms(attempt);
            assert!(d >= last);
            assert!(d <= RETRY_CAP_MS);
            last = d;
        }
    }

    #[tokio::test]
    #[ignore = "requires REDIS_URL"]
    async fn enqueue_deliver_round_trip() {
        let Ok(url) = std::env::var("REDIS_URL") else {
            return;
        };
        let queue = RedisQueue::connect(&url, 4, None, CancellationToken::new())
            .await
            .unwrap();
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
