//! Queue capability and configuration.

use std::time::Duration;

use async_trait::async_trait;
use intake_models::JobDescriptor;

use crate::envelope::Envelope;
use crate::error::{QueueError, QueueResult};

/// Durable at-least-once message channel carrying job descriptors.
///
/// No ordering is guaranteed across messages. A received message stays
/// invisible to other consumers until its lease runs out, it is released,
/// or it is acknowledged.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Queue name, for logs.
    fn name(&self) -> &str;

    /// Create the queue if it does not exist yet. Safe to call repeatedly.
    async fn ensure_exists(&self) -> QueueResult<()>;

    /// Publish one payload. Returns the message id once the queue has
    /// durably accepted it.
    async fn publish(&self, payload: &str) -> QueueResult<String>;

    /// Receive up to `max_messages`, each leased for `lease`.
    ///
    /// May wait for the backend's poll interval when nothing is visible and
    /// returns an empty batch if nothing arrives.
    async fn receive(&self, max_messages: usize, lease: Duration) -> QueueResult<Vec<Envelope>>;

    /// Delete the message. Call only once its work is durably done.
    async fn acknowledge(&self, envelope: &Envelope) -> QueueResult<()>;

    /// Keep the message hidden for `duration` from now.
    async fn extend_lease(&self, envelope: &Envelope, duration: Duration) -> QueueResult<()>;

    /// Make the message visible for redelivery right away.
    async fn release(&self, envelope: &Envelope) -> QueueResult<()>;

    /// Copy the message to the dead-letter destination and delete it.
    async fn dead_letter(&self, envelope: &Envelope, error: &str) -> QueueResult<()>;

    /// Messages currently in the queue, visible or leased.
    async fn len(&self) -> QueueResult<u64>;

    /// Messages in the dead-letter destination.
    async fn dead_letter_len(&self) -> QueueResult<u64>;

    /// Reserve a client idempotency key for `job`.
    ///
    /// Returns `None` when the key was free and is now bound to `job`, or the
    /// descriptor previously bound to it.
    async fn reserve_idempotency_key(
        &self,
        key: &str,
        job: &JobDescriptor,
        ttl: Duration,
    ) -> QueueResult<Option<JobDescriptor>>;

    /// Drop a reservation, e.g. after publishing failed.
    async fn forget_idempotency_key(&self, key: &str) -> QueueResult<()>;
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Stream name for jobs
    pub queue_name: String,
    /// Consumer group name
    pub consumer_group: String,
    /// Dead letter stream name
    pub dlq_name: String,
    /// Default lease handed out by `receive`
    pub visibility_timeout: Duration,
    /// How long `receive` blocks waiting for new messages
    pub poll_wait: Duration,
    /// Pending entries without a lease record are reclaimed after this idle time
    pub orphan_idle: Duration,
    /// Reclaim candidates fetched per source (expired leases, idle orphans) per receive
    pub pending_scan: usize,
}

impl QueueConfig {
    /// Config with defaults for everything but the connection and queue name.
    pub fn new(redis_url: impl Into<String>, queue_name: impl Into<String>) -> Self {
        let queue_name = queue_name.into();
        Self {
            redis_url: redis_url.into(),
            consumer_group: format!("{}:workers", queue_name),
            dlq_name: format!("{}:dlq", queue_name),
            queue_name,
            visibility_timeout: Duration::from_secs(300),
            poll_wait: Duration::from_millis(1000),
            orphan_idle: Duration::from_secs(600),
            pending_scan: 100,
        }
    }

    /// Create config from environment variables.
    ///
    /// `REDIS_URL` and `QUEUE_NAME` are required.
    pub fn from_env() -> QueueResult<Self> {
        let redis_url = std::env::var("REDIS_URL")
            .map_err(|_| QueueError::config_error("REDIS_URL not set"))?;
        let queue_name = std::env::var("QUEUE_NAME")
            .map_err(|_| QueueError::config_error("QUEUE_NAME not set"))?;
        if queue_name.trim().is_empty() {
            return Err(QueueError::config_error("QUEUE_NAME is empty"));
        }

        let defaults = Self::new(redis_url, queue_name);
        Ok(Self {
            consumer_group: std::env::var("QUEUE_CONSUMER_GROUP")
                .unwrap_or(defaults.consumer_group),
            dlq_name: std::env::var("QUEUE_DLQ_NAME").unwrap_or(defaults.dlq_name),
            visibility_timeout: Duration::from_secs(
                std::env::var("QUEUE_VISIBILITY_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
            poll_wait: Duration::from_millis(
                std::env::var("QUEUE_POLL_WAIT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1000),
            ),
            orphan_idle: Duration::from_secs(
                std::env::var("QUEUE_ORPHAN_IDLE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(600),
            ),
            ..defaults
        })
    }

    /// Sorted set holding lease deadlines (ms since epoch) by message id.
    pub fn leases_key(&self) -> String {
        format!("{}:leases", self.queue_name)
    }

    /// Key under which an idempotency token is stored.
    pub fn idempotency_key(&self, token: &str) -> String {
        format!("{}:idem:{}", self.queue_name, token)
    }
}
