//! Job producer: validates, encodes and publishes job descriptors.

use std::sync::Arc;
use std::time::Duration;

use intake_models::{JobDescriptor, ModelError, WireError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::error::QueueError;
use crate::queue::JobQueue;

/// How long a client idempotency key stays bound to its first descriptor.
pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] ModelError),

    #[error("Failed to encode job: {0}")]
    Encode(#[from] WireError),

    #[error("Failed to publish job: {0}")]
    Publish(#[from] QueueError),
}

/// Result of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitOutcome {
    /// False when an earlier submission with the same idempotency key won.
    pub enqueued: bool,
    /// Descriptor that sits in the queue.
    pub payload: JobDescriptor,
    /// Queue message id, when this call published.
    #[serde(skip)]
    pub message_id: Option<String>,
}

/// Publishes job descriptors onto a queue.
#[derive(Clone)]
pub struct JobProducer {
    queue: Arc<dyn JobQueue>,
    idempotency_ttl: Duration,
    queue_ready: Arc<OnceCell<()>>,
}

impl JobProducer {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self {
            queue,
            idempotency_ttl: DEFAULT_IDEMPOTENCY_TTL,
            queue_ready: Arc::new(OnceCell::new()),
        }
    }

    pub fn with_idempotency_ttl(mut self, ttl: Duration) -> Self {
        self.idempotency_ttl = ttl;
        self
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Validate and publish a new job.
    ///
    /// Returns only after the queue has accepted the message.
    pub async fn submit(
        &self,
        application_id: &str,
        blob_name: &str,
    ) -> Result<SubmitOutcome, ProducerError> {
        let job = JobDescriptor::new(application_id, blob_name);
        job.validate()?;

        let message_id = self.publish(&job).await?;
        Ok(SubmitOutcome {
            enqueued: true,
            payload: job,
            message_id: Some(message_id),
        })
    }

    /// Like [`submit`](Self::submit), but a repeated `key` returns the
    /// descriptor of the first submission without publishing again.
    pub async fn submit_idempotent(
        &self,
        key: &str,
        application_id: &str,
        blob_name: &str,
    ) -> Result<SubmitOutcome, ProducerError> {
        let job = JobDescriptor::new(application_id, blob_name);
        job.validate()?;

        if let Some(existing) = self
            .queue
            .reserve_idempotency_key(key, &job, self.idempotency_ttl)
            .await?
        {
            info!(
                idempotency_key = key,
                job = %existing.label(),
                "Duplicate submission, not enqueued"
            );
            return Ok(SubmitOutcome {
                enqueued: false,
                payload: existing,
                message_id: None,
            });
        }

        match self.publish(&job).await {
            Ok(message_id) => Ok(SubmitOutcome {
                enqueued: true,
                payload: job,
                message_id: Some(message_id),
            }),
            Err(e) => {
                // Let the client retry with the same key
                if let Err(forget) = self.queue.forget_idempotency_key(key).await {
                    warn!(idempotency_key = key, "Failed to drop reservation: {}", forget);
                }
                Err(e)
            }
        }
    }

    async fn publish(&self, job: &JobDescriptor) -> Result<String, ProducerError> {
        let payload = job.to_wire()?;
        // Create-if-absent once per producer; a failed attempt is retried next call
        self.queue_ready
            .get_or_try_init(|| self.queue.ensure_exists())
            .await?;
        let message_id = self.queue.publish(&payload).await?;

        info!(
            message_id = %message_id,
            queue = self.queue.name(),
            job = %job.label(),
            "Enqueued job"
        );
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryQueue;

    fn producer() -> (MemoryQueue, JobProducer) {
        let queue = MemoryQueue::new("jobs");
        let producer = JobProducer::new(Arc::new(queue.clone()));
        (queue, producer)
    }

    #[tokio::test]
    async fn test_submit_publishes_wire_payload() {
        let (queue, producer) = producer();

        let outcome = producer
            .submit("test-123", "applications/test-123/uploads/cv.pdf")
            .await
            .unwrap();

        assert!(outcome.enqueued);
        let pending = queue.pending_payloads();
        assert_eq!(pending.len(), 1);
        let decoded = JobDescriptor::from_wire(&pending[0]).unwrap();
        assert_eq!(decoded, outcome.payload);
    }

    #[tokio::test]
    async fn test_submit_rejects_missing_fields() {
        let (queue, producer) = producer();

        let err = producer.submit("", "applications/x/cv.pdf").await.unwrap_err();
        assert!(matches!(err, ProducerError::InvalidRequest(_)));
        assert!(queue.pending_payloads().is_empty());
    }

    #[tokio::test]
    async fn test_submit_fails_when_queue_unavailable() {
        let (queue, producer) = producer();
        queue.set_available(false);

        let err = producer.submit("a", "b").await.unwrap_err();
        assert!(matches!(err, ProducerError::Publish(_)));
    }

    #[tokio::test]
    async fn test_duplicate_key_enqueues_once() {
        let (queue, producer) = producer();

        let first = producer.submit_idempotent("key-1", "a", "one.pdf").await.unwrap();
        let second = producer.submit_idempotent("key-1", "a", "two.pdf").await.unwrap();

        assert!(first.enqueued);
        assert!(!second.enqueued);
        assert_eq!(second.payload, first.payload);
        assert_eq!(queue.pending_payloads().len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_enqueue_separately() {
        let (queue, producer) = producer();

        producer.submit_idempotent("key-1", "a", "one.pdf").await.unwrap();
        producer.submit_idempotent("key-2", "a", "one.pdf").await.unwrap();

        assert_eq!(queue.pending_payloads().len(), 2);
    }
}
