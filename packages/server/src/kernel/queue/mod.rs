//! Topic-based at-least-once job queue with pluggable drivers.
//!
//! All drivers share one contract: delayed jobs are invisible until their
//! ready time, handlers that error are redelivered with per-driver backoff,
//! and jobs that exhaust their attempts land in the DLQ with the final
//! error preserved. There is no global ordering guarantee; jobs with equal
//! ready-time are approximately FIFO within a topic.

mod memory;
mod postgres;
mod redis_driver;

pub use memory::MemoryQueue;
pub use postgres::{PostgresQueue, PostgresQueueConfig};
pub use redis_driver::RedisQueue;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use super::error::QueueError;
use super::model::{QueueCounts, QueueJob};

pub const TOPIC_STEP_READY: &str = "step.ready";
pub const TOPIC_STEP_DLQ: &str = "step.dlq";
pub const TOPIC_OUTBOX: &str = "outbox";

pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Handler invoked for each delivered payload. Errors trigger redelivery.
pub type JobHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Minimum wall-clock delay before the job becomes claimable.
    pub delay: Option<Duration>,
    /// Maximum delivery count. Defaults to [`DEFAULT_MAX_ATTEMPTS`].
    pub max_attempts: Option<i32>,
}

impl EnqueueOptions {
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn with_attempts(max_attempts: i32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..Default::default()
        }
    }
}

/// Inject the 1-based `__attempt` delivery counter into an envelope.
///
/// Non-object payloads pass through unchanged; the worker rejects them at
/// the decode boundary.
pub fn inject_attempt(payload: &Value, attempt: i32) -> Value {
    let mut delivered = payload.clone();
    if let Value::Object(map) = &mut delivered {
        map.insert("__attempt".to_owned(), Value::from(attempt));
    }
    delivered
}

#[async_trait]
pub trait QueueDriver: Send + Sync {
    /// Driver name: `memory`, `redis`, or `postgres`.
    fn name(&self) -> &'static str;

    async fn enqueue(
        &self,
        topic: &str,
        payload: Value,
        opts: EnqueueOptions,
    ) -> Result<(), QueueError>;

    /// Start a consumer loop for the topic. Delivery is at-least-once; a
    /// topic supports a single subscriber per driver instance.
    async fn subscribe(&self, topic: &str, handler: JobHandler) -> Result<(), QueueError>;

    async fn counts(&self, topic: &str) -> Result<QueueCounts, QueueError>;

    async fn list_dlq(&self, topic: &str, limit: usize) -> Result<Vec<QueueJob>, QueueError>;

    /// Move up to `max` DLQ jobs back to pending, resetting `attempts` to 0
    /// and clearing `error`. Returns the number moved.
    async fn rehydrate_dlq(&self, topic: &str, max: usize) -> Result<usize, QueueError>;

    /// Age of the oldest claimable job, for backlog observability.
    async fn oldest_age_ms(&self, topic: &str) -> Result<Option<i64>, QueueError>;

    fn has_subscribers(&self, topic: &str) -> bool;

    /// Persist a worker liveness timestamp where the driver supports it.
    async fn record_heartbeat(&self, _worker_id: &str) -> Result<(), QueueError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inject_attempt_sets_dunder_field() {
        let payload = json!({"runId": "r"});
        let delivered = inject_attempt(&payload, 2);
        assert_eq!(delivered["__attempt"], json!(2));
        // The stored payload is untouched.
        assert!(payload.get("__attempt").is_none());
    }

    #[test]
    fn inject_attempt_overwrites_previous_value() {
        let payload = json!({"__attempt": 1});
        assert_eq!(inject_attempt(&payload, 3)["__attempt"], json!(3));
    }

    #[test]
    fn inject_attempt_ignores_non_objects() {
        assert_eq!(inject_attempt(&json!("scalar"), 2), json!("scalar"));
    }
}
