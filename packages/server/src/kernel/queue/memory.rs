//! Single-process queue driver.
//!
//! Each topic keeps a priority queue ordered by `(ready_at, seq)` so delayed
//! jobs surface in ready-time order and equal ready-times stay FIFO. Retry
//! scheduling uses the tokio clock, so tests can drive it with a paused
//! clock and `tokio::time::advance`.
//!
//! Retry backoff: `min((attempt + 1) seconds, 30s)`, which lands the default
//! three deliveries at roughly t=0s, t=2s, and t=5s.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{inject_attempt, EnqueueOptions, JobHandler, QueueDriver, DEFAULT_MAX_ATTEMPTS};
use crate::kernel::error::QueueError;
use crate::kernel::model::{JobStatus, QueueCounts, QueueJob};

const RETRY_CAP: Duration = Duration::from_secs(30);

fn retry_delay(attempt: i32) -> Duration {
    let secs = (attempt as u64).saturating_add(1);
    Duration::from_secs(secs).min(RETRY_CAP)
}

struct Scheduled {
    ready_at: Instant,
    seq: u64,
    job: QueueJob,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.ready_at
            .cmp(&other.ready_at)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct TopicState {
    ready: BinaryHeap<Reverse<Scheduled>>,
    dlq: VecDeque<QueueJob>,
    processing: u64,
    completed: u64,
    failed: u64,
    seq: u64,
}

struct MemoryInner {
    topics: Mutex<HashMap<String, TopicState>>,
    wakeups: DashMap<String, Arc<Notify>>,
    subscribers: DashMap<String, ()>,
    delivery_slots: Arc<Semaphore>,
    soft_limit: Option<u64>,
    shutdown: CancellationToken,
}

impl MemoryInner {
    fn wakeup(&self, topic: &str) -> Arc<Notify> {
        self.wakeups
            .entry(topic.to_owned())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }
}

#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<MemoryInner>,
}

impl MemoryQueue {
    pub fn new(concurrency: usize, soft_limit: Option<u64>, shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                topics: Mutex::new(HashMap::new()),
                wakeups: DashMap::new(),
                subscribers: DashMap::new(),
                delivery_slots: Arc::new(Semaphore::new(concurrency.max(1))),
                soft_limit,
                shutdown,
            }),
        }
    }

    async fn run_consumer(inner: Arc<MemoryInner>, topic: String, handler: JobHandler) {
        enum Next {
            Deliver(QueueJob),
            Sleep(Instant),
            Idle,
        }

        let notify = inner.wakeup(&topic);
        loop {
            if inner.shutdown.is_cancelled() {
                break;
            }

            let next = {
                let mut topics = inner.topics.lock().await;
                let state = topics.entry(topic.clone()).or_default();
                let head_ready_at = state.ready.peek().map(|Reverse(s)| s.ready_at);
                match head_ready_at {
                    Some(ready_at) if ready_at <= Instant::now() => match state.ready.pop() {
                        Some(Reverse(mut scheduled)) => {
                            scheduled.job.status = JobStatus::Processing;
                            state.processing += 1;
                            Next::Deliver(scheduled.job)
                        }
                        None => Next::Idle,
                    },
                    Some(ready_at) => Next::Sleep(ready_at),
                    None => Next::Idle,
                }
            };

            match next {
                Next::Deliver(job) => {
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
                Next::Sleep(ready_at) => {
                    tokio::select! {
                        _ = sleep_until(ready_at) => {}
                        _ = notify.notified() => {}
                        _ = inner.shutdown.cancelled() => break,
                    }
                }
                Next::Idle => {
                    tokio::select! {
                        _ = notify.notified() => {}
                        _ = inner.shutdown.cancelled() => break,
                    }
                }
            }
        }
        debug!(topic = %topic, "memory queue consumer stopped");
    }

    async fn deliver(inner: Arc<MemoryInner>, topic: String, handler: JobHandler, mut job: QueueJob) {
        let attempt = job.attempts + 1;
        let delivered = inject_attempt(&job.payload, attempt);
        let result = handler(delivered).await;

        let mut topics = inner.topics.lock().await;
        let state = topics.entry(topic.clone()).or_default();
        state.processing = state.processing.saturating_sub(1);

        match result {
            Ok(()) => {
                state.completed += 1;
            }
            Err(e) => {
                state.failed += 1;
                job.attempts = attempt;
                job.error = Some(e.to_string());
                job.updated_at = Utc::now();
                if job.attempts >= job.max_attempts {
                    warn!(
                        topic = %topic,
                        job_id = %job.id,
                        attempts = job.attempts,
                        error = %e,
                        "job exhausted attempts, moving to dlq"
                    );
                    job.status = JobStatus::Dlq;
                    state.dlq.push_back(job);
                } else {
                    let delay = retry_delay(job.attempts);
                    debug!(
                        topic = %topic,
                        job_id = %job.id,
                        attempt = job.attempts,
                        delay_ms = delay.as_millis() as u64,
                        "job failed, scheduling retry"
                    );
                    job.status = JobStatus::Pending;
                    state.seq += 1;
                    state.ready.push(Reverse(Scheduled {
                        ready_at: Instant::now() + delay,
                        seq: state.seq,
                        job,
                    }));
                    inner.wakeup(&topic).notify_one();
                }
            }
        }
    }
}

#[async_trait]
impl QueueDriver for MemoryQueue {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn enqueue(
        &self,
        topic: &str,
        payload: Value,
        opts: EnqueueOptions,
    ) -> Result<(), QueueError> {
        let mut topics = self.inner.topics.lock().await;
        let state = topics.entry(topic.to_owned()).or_default();

        if let Some(limit) = self.inner.soft_limit {
            let depth = state.ready.len() as u64 + state.processing;
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
        state.seq += 1;
        state.ready.push(Reverse(Scheduled {
            ready_at: Instant::now() + opts.delay.unwrap_or(Duration::ZERO),
            seq: state.seq,
            job,
        }));
        drop(topics);

        self.inner.wakeup(topic).notify_one();
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
        let mut topics = self.inner.topics.lock().await;
        let state = topics.entry(topic.to_owned()).or_default();
        let now = Instant::now();
        let mut counts = QueueCounts {
            processing: state.processing,
            completed: state.completed,
            failed: state.failed,
            dlq: state.dlq.len() as u64,
            ..Default::default()
        };
        for Reverse(scheduled) in state.ready.iter() {
            if scheduled.ready_at <= now {
                counts.pending += 1;
            } else {
                counts.delayed += 1;
            }
        }
        Ok(counts)
    }

    async fn list_dlq(&self, topic: &str, limit: usize) -> Result<Vec<QueueJob>, QueueError> {
        let mut topics = self.inner.topics.lock().await;
        let state = topics.entry(topic.to_owned()).or_default();
        Ok(state.dlq.iter().take(limit).cloned().collect())
    }

    async fn rehydrate_dlq(&self, topic: &str, max: usize) -> Result<usize, QueueError> {
        let mut topics = self.inner.topics.lock().await;
        let state = topics.entry(topic.to_owned()).or_default();
        let mut moved = 0;
        while moved < max {
            let Some(mut job) = state.dlq.pop_front() else {
                break;
            };
            job.status = JobStatus::Pending;
            job.attempts = 0;
            job.error = None;
            job.updated_at = Utc::now();
            state.seq += 1;
            state.ready.push(Reverse(Scheduled {
                ready_at: Instant::now(),
                seq: state.seq,
                job,
            }));
            moved += 1;
        }
        drop(topics);

        if moved > 0 {
            self.inner.wakeup(topic).notify_one();
        }
        Ok(moved)
    }

    async fn oldest_age_ms(&self, topic: &str) -> Result<Option<i64>, QueueError> {
        let mut topics = self.inner.topics.lock().await;
        let state = topics.entry(topic.to_owned()).or_default();
        let now = Instant::now();
        let oldest = state
            .ready
            .iter()
            .filter(|Reverse(s)| s.ready_at <= now)
            .map(|Reverse(s)| s.job.created_at)
            .min();
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

    fn queue() -> MemoryQueue {
        MemoryQueue::new(8, None, CancellationToken::new())
    }

    fn counting_handler(counter: Arc<AtomicU32>, fail_first: u32) -> JobHandler {
        Arc::new(move |_payload| {
            let counter = counter.clone();
            Box::pin(async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= fail_first {
                    anyhow::bail!("simulated failure {n}");
                }
                Ok(())
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_enqueued_job() {
        let queue = queue();
        let calls = Arc::new(AtomicU32::new(0));
        queue
            .subscribe("t", counting_handler(calls.clone(), 0))
            .await
            .unwrap();
        queue
            .enqueue("t", json!({"k": 1}), EnqueueOptions::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let counts = queue.counts("t").await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_job_is_invisible_until_ready() {
        let queue = queue();
        let calls = Arc::new(AtomicU32::new(0));
        queue
            .subscribe("t", counting_handler(calls.clone(), 0))
            .await
            .unwrap();
        queue
            .enqueue(
                "t",
                json!({}),
                EnqueueOptions::delayed(Duration::from_secs(5)),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(queue.counts("t").await.unwrap().delayed, 1);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_job_lands_in_dlq_after_attempts() {
        let queue = queue();
        let calls = Arc::new(AtomicU32::new(0));
        queue
            .subscribe("t", counting_handler(calls.clone(), u32::MAX))
            .await
            .unwrap();
        queue
            .enqueue("t", json!({"job": "doomed"}), EnqueueOptions::default())
            .await
            .unwrap();

        // Deliveries at ~0s, ~2s, ~5s; give the schedule room to finish.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let counts = queue.counts("t").await.unwrap();
        assert_eq!(counts.dlq, 1);
        assert_eq!(counts.failed, 3);

        let dlq = queue.list_dlq("t", 10).await.unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].attempts, 3);
        assert!(dlq[0].error.as_deref().unwrap().contains("simulated failure"));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_schedule_is_zero_two_five() {
        let queue = queue();
        let t0 = Instant::now();
        let times: Arc<std::sync::Mutex<Vec<u64>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = times.clone();
        let handler: JobHandler = Arc::new(move |_| {
            let recorded = recorded.clone();
            let elapsed = t0.elapsed().as_secs();
            Box::pin(async move {
                recorded.lock().unwrap().push(elapsed);
                anyhow::bail!("always fails")
            })
        });
        queue.subscribe("t", handler).await.unwrap();
        queue
            .enqueue("t", json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        let times = times.lock().unwrap().clone();
        assert_eq!(times, vec![0, 2, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn rehydrate_resets_attempts_and_error() {
        let queue = queue();
        let calls = Arc::new(AtomicU32::new(0));
        // Fail the first three deliveries (to DLQ), succeed afterwards.
        queue
            .subscribe("t", counting_handler(calls.clone(), 3))
            .await
            .unwrap();
        queue
            .enqueue("t", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(queue.counts("t").await.unwrap().dlq, 1);

        let moved = queue.rehydrate_dlq("t", 10).await.unwrap();
        assert_eq!(moved, 1);
        assert_eq!(queue.counts("t").await.unwrap().dlq, 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(queue.counts("t").await.unwrap().completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn soft_limit_rejects_enqueue() {
        let queue = MemoryQueue::new(8, Some(2), CancellationToken::new());
        queue.enqueue("t", json!({}), EnqueueOptions::default()).await.unwrap();
        queue.enqueue("t", json!({}), EnqueueOptions::default()).await.unwrap();
        let err = queue
            .enqueue("t", json!({}), EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Saturated { .. }));
    }

    #[tokio::test]
    async fn second_subscriber_is_rejected() {
        let queue = queue();
        let noop: JobHandler = Arc::new(|_| Box::pin(async { Ok(()) }));
        queue.subscribe("t", noop.clone()).await.unwrap();
        assert!(queue.subscribe("t", noop).await.is_err());
        assert!(queue.has_subscribers("t"));
        assert!(!queue.has_subscribers("other"));
    }

    #[test]
    fn retry_delay_is_monotonic_and_capped() {
        let mut last = Duration::ZERO;
        for attempt in 1..40 {
            let d = retry_delay(attempt);
            assert!(d >= last);
            assert!(d <= RETRY_CAP);
            last = d;
        }
        assert_eq!(retry_delay(1), Duration::from_secs(2));
        assert_eq!(retry_delay(2), Duration::from_secs(3));
    }
}
