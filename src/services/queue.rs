use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::Serialize;
use std::time::Duration;

use crate::models::message::JobMessage;

/// Moves due entries from the delayed set back onto the ready list in one step.
const PROMOTE_DUE_SCRIPT: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, payload in ipairs(due) do
    redis.call('ZREM', KEYS[1], payload)
    redis.call('LPUSH', KEYS[2], payload)
end
return #due
";

const PROMOTE_BATCH: usize = 64;

const DEFAULT_CONSUMER_TTL: Duration = Duration::from_secs(30);

/// A message handed to a consumer. Must be settled with exactly one of
/// `ack`, `nack` or `dead_letter`.
#[derive(Debug, Clone)]
pub struct Delivery {
    payload: String,
}

impl Delivery {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn decode(&self) -> Result<JobMessage, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

/// Read-only snapshot of the queue.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct QueueStats {
    pub ready: u64,
    pub delayed: u64,
    pub in_flight: u64,
    pub consumers: u64,
    pub oldest_published_at: Option<DateTime<Utc>>,
}

/// Durable, at-least-once, point-to-point queue with manual acknowledgment.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    fn queue_name(&self) -> &str;

    async fn publish(&self, message: &JobMessage) -> Result<(), QueueError>;

    /// Take the next ready message, if any.
    async fn receive(&self) -> Result<Option<Delivery>, QueueError>;

    /// Remove a settled message for good.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Return a message for redelivery after `delay`.
    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError>;

    /// Park a message that must never be redelivered.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError>;

    /// Must not consume or alter messages.
    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Drop every ready and delayed message. In-flight messages are kept.
    async fn purge(&self) -> Result<u64, QueueError>;

    async fn ping(&self) -> Result<(), QueueError>;
}

/// Redis-backed reliable queue.
///
/// Ready messages live in a list, each consumer moves what it takes into its
/// own processing list, and nacked messages wait in a sorted set scored by
/// the time they become ready again.
pub struct RedisQueue {
    client: redis::Client,
    queue_key: String,
    delayed_key: String,
    dead_key: String,
    consumers_key: String,
    consumer_id: String,
    consumer_ttl: Duration,
}

impl RedisQueue {
    pub fn new(redis_url: &str, queue_name: &str, consumer_id: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            queue_key: queue_name.to_string(),
            delayed_key: format!("{queue_name}:delayed"),
            dead_key: format!("{queue_name}:dead"),
            consumers_key: format!("{queue_name}:consumers"),
            consumer_id: consumer_id.to_string(),
            consumer_ttl: DEFAULT_CONSUMER_TTL,
        })
    }

    /// Consumers silent for longer than `ttl` count as gone.
    pub fn with_consumer_ttl(mut self, ttl: Duration) -> Self {
        self.consumer_ttl = ttl;
        self
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    fn processing_key_for(&self, consumer_id: &str) -> String {
        format!("{}:processing:{}", self.queue_key, consumer_id)
    }

    fn processing_key(&self) -> String {
        self.processing_key_for(&self.consumer_id)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    /// Register this consumer as alive.
    pub async fn heartbeat(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        conn.zadd::<_, _, _, ()>(
            &self.consumers_key,
            &self.consumer_id,
            Utc::now().timestamp_millis(),
        )
        .await
        .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Remove this consumer from the registry on clean shutdown. Anything
    /// still in its processing list goes back to the ready list. Call only
    /// once every delivery has been settled.
    pub async fn deregister(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let returned = self
            .drain_processing(&mut conn, &self.processing_key())
            .await?;
        conn.zrem::<_, _, ()>(&self.consumers_key, &self.consumer_id)
            .await
            .map_err(QueueError::Redis)?;
        Ok(returned)
    }

    async fn drain_processing(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        processing: &str,
    ) -> Result<u64, QueueError> {
        let mut moved = 0;
        loop {
            let payload: Option<String> = conn
                .rpoplpush(processing, &self.queue_key)
                .await
                .map_err(QueueError::Redis)?;
            if payload.is_none() {
                return Ok(moved);
            }
            moved += 1;
        }
    }

    /// Return in-flight messages of consumers that stopped heartbeating to the
    /// ready list. Returns how many were recovered.
    pub async fn recover_abandoned(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let cutoff = Utc::now().timestamp_millis() - self.consumer_ttl.as_millis() as i64;
        let dead: Vec<String> = conn
            .zrangebyscore(&self.consumers_key, "-inf", cutoff)
            .await
            .map_err(QueueError::Redis)?;

        let mut recovered = 0;
        for consumer in dead {
            if consumer == self.consumer_id {
                continue;
            }
            let moved = self
                .drain_processing(&mut conn, &self.processing_key_for(&consumer))
                .await?;
            conn.zrem::<_, _, ()>(&self.consumers_key, &consumer)
                .await
                .map_err(QueueError::Redis)?;
            tracing::warn!(consumer = %consumer, moved, "Recovered in-flight messages of silent consumer");
            recovered += moved;
        }
        Ok(recovered)
    }

    async fn promote_due(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
    ) -> Result<u64, QueueError> {
        let promoted: u64 = redis::Script::new(PROMOTE_DUE_SCRIPT)
            .key(&self.delayed_key)
            .key(&self.queue_key)
            .arg(Utc::now().timestamp_millis())
            .arg(PROMOTE_BATCH)
            .invoke_async(conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(promoted)
    }

    async fn live_consumers(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
    ) -> Result<Vec<String>, QueueError> {
        conn.zrange(&self.consumers_key, 0, -1)
            .await
            .map_err(QueueError::Redis)
    }
}

#[async_trait]
impl MessageBroker for RedisQueue {
    fn queue_name(&self) -> &str {
        &self.queue_key
    }

    async fn publish(&self, message: &JobMessage) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(message).map_err(QueueError::Serialize)?;
        conn.lpush::<_, _, ()>(&self.queue_key, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.connection().await?;
        let promoted = self.promote_due(&mut conn).await?;
        if promoted > 0 {
            tracing::debug!(promoted, "Promoted delayed messages");
        }

        let payload: Option<String> = conn
            .rpoplpush(&self.queue_key, self.processing_key())
            .await
            .map_err(QueueError::Redis)?;
        Ok(payload.map(Delivery::new))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        conn.lrem::<_, _, ()>(self.processing_key(), 1, delivery.payload())
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        redis::pipe()
            .atomic()
            .lrem(self.processing_key(), 1, delivery.payload())
            .ignore()
            .zadd(&self.delayed_key, delivery.payload(), ready_at)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::pipe()
            .atomic()
            .lrem(self.processing_key(), 1, delivery.payload())
            .ignore()
            .lpush(&self.dead_key, delivery.payload())
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        tracing::warn!(queue = %self.queue_key, reason, "Message dead-lettered");
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.connection().await?;
        let ready: u64 = conn.llen(&self.queue_key).await.map_err(QueueError::Redis)?;
        let delayed: u64 = conn.zcard(&self.delayed_key).await.map_err(QueueError::Redis)?;

        let cutoff = Utc::now().timestamp_millis() - self.consumer_ttl.as_millis() as i64;
        let consumers: u64 = conn
            .zcount(&self.consumers_key, cutoff, "+inf")
            .await
            .map_err(QueueError::Redis)?;

        let mut in_flight = 0;
        for consumer in self.live_consumers(&mut conn).await? {
            let len: u64 = conn
                .llen(self.processing_key_for(&consumer))
                .await
                .map_err(QueueError::Redis)?;
            in_flight += len;
        }

        // LPUSH/RPOPLPUSH: the oldest ready message sits at the tail.
        let oldest: Option<String> = conn
            .lindex(&self.queue_key, -1)
            .await
            .map_err(QueueError::Redis)?;
        let oldest_published_at = oldest
            .and_then(|payload| Delivery::new(payload).decode().ok())
            .map(|message| message.published_at);

        Ok(QueueStats {
            ready,
            delayed,
            in_flight,
            consumers,
            oldest_published_at,
        })
    }

    async fn purge(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let ready: u64 = conn.llen(&self.queue_key).await.map_err(QueueError::Redis)?;
        let delayed: u64 = conn.zcard(&self.delayed_key).await.map_err(QueueError::Redis)?;
        redis::pipe()
            .atomic()
            .del(&self.queue_key)
            .ignore()
            .del(&self.delayed_key)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(ready + delayed)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
