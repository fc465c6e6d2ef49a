//! Typed errors for the execution core.
//!
//! The failure taxonomy splits into transient errors (retried by the queue
//! driver with backoff until the DLQ) and fatal errors (invariant
//! violations that retrying cannot fix).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A referenced entity does not exist. Invariant violation, not retryable.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    /// Transient I/O failure. Retryable.
    #[error("store unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::not_found("row", "unknown"),
            other => StoreError::Unavailable(other.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// The topic's soft depth ceiling was reached. Retryable by the caller.
    #[error("queue saturated for topic {topic}: depth {depth} >= limit {limit}")]
    Saturated {
        topic: String,
        depth: u64,
        limit: u64,
    },

    /// Envelope failed validation at the queue boundary.
    #[error("bad payload for topic {topic}: {reason}")]
    BadPayload { topic: String, reason: String },

    /// Transient backend failure. Retryable.
    #[error("queue backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

impl QueueError {
    pub fn backend(e: impl Into<anyhow::Error>) -> Self {
        QueueError::Backend(e.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Saturated { .. } | QueueError::Backend(_))
    }
}

impl From<sqlx::Error> for QueueError {
    fn from(e: sqlx::Error) -> Self {
        QueueError::Backend(e.into())
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        QueueError::Backend(e.into())
    }
}
