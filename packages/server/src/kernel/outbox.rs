//! Outbox relay: drains the store's outbox into the queue.
//!
//! Domain mutations append outbox rows in the same scope as the mutation;
//! this loop re-emits them as queue messages, at-least-once. An enqueue
//! failure leaves the row unsent for the next tick. Rows on the `outbox`
//! fan-out topic are validated before emission; malformed rows are skipped
//! with a loud error and never block the rest of the batch.

use std::sync::Arc;

use metrics::gauge;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::metrics::OUTBOX_UNSENT;
use super::model::OutboxEnvelope;
use super::queue::{EnqueueOptions, QueueDriver, TOPIC_OUTBOX};
use super::store::Store;

#[derive(Debug, Clone)]
pub struct OutboxRelayConfig {
    pub interval: Duration,
    pub batch: usize,
}

impl Default for OutboxRelayConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            batch: 25,
        }
    }
}

pub struct OutboxRelay {
    store: Arc<dyn Store>,
    queue: Arc<dyn QueueDriver>,
    config: OutboxRelayConfig,
    shutdown: CancellationToken,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn QueueDriver>,
        config: OutboxRelayConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            queue,
            config,
            shutdown,
        }
    }

    /// Run until shutdown. The loop never propagates an error; a failed
    /// tick is retried on the next interval.
    pub async fn run(self) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            batch = self.config.batch,
            "outbox relay starting"
        );
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "outbox relay tick failed");
                    }
                }
            }
        }
        info!("outbox relay stopped");
    }

    /// Drain one batch of unsent rows. Returns the number relayed.
    pub async fn tick(&self) -> anyhow::Result<usize> {
        let rows = self.store.outbox_list_unsent(self.config.batch).await?;
        gauge!(OUTBOX_UNSENT).set(rows.len() as f64);

        let mut sent = 0;
        for row in rows {
            if row.topic == TOPIC_OUTBOX {
                if let Err(e) = serde_json::from_value::<OutboxEnvelope>(row.payload.clone()) {
                    error!(
                        outbox_id = %row.id,
                        error = %e,
                        payload = %row.payload,
                        "malformed outbox row, skipping"
                    );
                    continue;
                }
            }

            match self
                .queue
                .enqueue(&row.topic, row.payload.clone(), EnqueueOptions::default())
                .await
            {
                Ok(()) => {
                    if let Err(e) = self.store.outbox_mark_sent(row.id).await {
                        // The row will be re-enqueued next tick; downstream
                        // consumers already tolerate at-least-once delivery.
                        warn!(outbox_id = %row.id, error = %e, "failed to mark outbox row sent");
                    } else {
                        sent += 1;
                    }
                }
                Err(e) => {
                    debug!(outbox_id = %row.id, topic = %row.topic, error = %e, "enqueue failed, leaving row unsent");
                }
            }
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::store::MemoryStore;
    use crate::kernel::queue::MemoryQueue;
    use serde_json::json;
    use uuid::Uuid;

    fn relay(store: Arc<dyn Store>, queue: Arc<dyn QueueDriver>) -> OutboxRelay {
        OutboxRelay::new(
            store,
            queue,
            OutboxRelayConfig::default(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn tick_sends_and_marks_rows() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let queue: Arc<dyn QueueDriver> =
            Arc::new(MemoryQueue::new(4, None, CancellationToken::new()));
        store
            .outbox_add(
                TOPIC_OUTBOX,
                json!({"runId": Uuid::new_v4(), "type": "step.succeeded"}),
            )
            .await
            .unwrap();

        let relay = relay(store.clone(), queue.clone());
        assert_eq!(relay.tick().await.unwrap(), 1);
        assert!(store.outbox_list_unsent(10).await.unwrap().is_empty());
        assert_eq!(queue.counts(TOPIC_OUTBOX).await.unwrap().pending, 1);

        // Second tick is a no-op.
        assert_eq!(relay.tick().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn malformed_outbox_row_is_skipped_without_blocking() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let queue: Arc<dyn QueueDriver> =
            Arc::new(MemoryQueue::new(4, None, CancellationToken::new()));
        store
            .outbox_add(TOPIC_OUTBOX, json!({"nonsense": true}))
            .await
            .unwrap();
        store
            .outbox_add(
                TOPIC_OUTBOX,
                json!({"runId": Uuid::new_v4(), "type": "step.succeeded"}),
            )
            .await
            .unwrap();

        let relay = relay(store.clone(), queue.clone());
        assert_eq!(relay.tick().await.unwrap(), 1);
        // The malformed row stays unsent; the valid one went through.
        assert_eq!(store.outbox_list_unsent(10).await.unwrap().len(), 1);
        assert_eq!(queue.counts(TOPIC_OUTBOX).await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn saturated_queue_leaves_rows_unsent() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let queue: Arc<dyn QueueDriver> =
            Arc::new(MemoryQueue::new(4, Some(0), CancellationToken::new()));
        store
            .outbox_add("step.results", json!({"x": 1}))
            .await
            .unwrap();

        let relay = relay(store.clone(), queue);
        assert_eq!(relay.tick().await.unwrap(), 0);
        assert_eq!(store.outbox_list_unsent(10).await.unwrap().len(), 1);
    }
}
