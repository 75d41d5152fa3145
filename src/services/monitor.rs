use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use crate::services::queue::{MessageBroker, QueueError};

/// Point-in-time view of the job queue.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueueStatus {
    pub queue_name: String,
    /// Messages ready for delivery.
    pub pending_count: u64,
    /// Messages waiting out a retry backoff.
    pub delayed_count: u64,
    pub in_flight_count: u64,
    pub consumer_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_message_age_secs: Option<i64>,
}

/// Read-only queue inspection plus the operator purge.
#[derive(Clone)]
pub struct QueueMonitor {
    broker: Arc<dyn MessageBroker>,
}

impl QueueMonitor {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self { broker }
    }

    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        let stats = self.broker.stats().await?;
        metrics::gauge!("tattoo_queue_depth").set((stats.ready + stats.delayed) as f64);

        let oldest_message_age_secs = stats
            .oldest_published_at
            .map(|published| (Utc::now() - published).num_seconds().max(0));

        Ok(QueueStatus {
            queue_name: self.broker.queue_name().to_string(),
            pending_count: stats.ready,
            delayed_count: stats.delayed,
            in_flight_count: stats.in_flight,
            consumer_count: stats.consumers,
            oldest_message_age_secs,
        })
    }

    /// Drop every message not currently held by a worker.
    pub async fn purge(&self) -> Result<u64, QueueError> {
        let removed = self.broker.purge().await?;
        metrics::gauge!("tattoo_queue_depth").set(0.0);
        tracing::warn!(queue = %self.broker.queue_name(), removed, "Queue purged");
        Ok(removed)
    }
}
