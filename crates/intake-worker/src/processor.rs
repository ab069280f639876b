//! Per-envelope processing.
//!
//! One delivery moves through `Received -> FetchingArtifact -> Analyzing ->
//! Acknowledged`. Any failure ends in a retry (lease pushed out by the
//! backoff), a dead letter, or a release when the worker is shutting down.
//! The message is never deleted without either a recorded result or a dead
//! letter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::Instrument;

use intake_models::{AnalysisResult, JobDescriptor, ProcessingStage};
use intake_queue::{Envelope, JobQueue, QueueError};
use intake_storage::ArtifactStore;

use crate::analysis::{AnalysisError, AnalysisStage};
use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics;
use crate::retry::{retry_async, FailureAction, FailureTracker, RedeliveryPolicy, RetryConfig};
use crate::sink::ResultSink;

/// How a delivery ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Result recorded and message deleted.
    Acknowledged(AnalysisResult),
    /// Failed; the message becomes visible again after the delay.
    Retrying(Duration),
    /// Moved to the dead-letter destination.
    DeadLettered,
    /// Handed back to the queue unprocessed (shutdown).
    Released,
    /// The lease was lost or a queue call failed; the queue redelivers on
    /// lease expiry.
    Abandoned,
}

impl Outcome {
    pub fn stage(&self) -> ProcessingStage {
        match self {
            Outcome::Acknowledged(_) => ProcessingStage::Acknowledged,
            Outcome::DeadLettered => ProcessingStage::DeadLettered,
            Outcome::Retrying(_) | Outcome::Released | Outcome::Abandoned => ProcessingStage::Failed,
        }
    }
}

/// Everything a job task needs, shared across tasks.
pub struct ProcessingContext {
    pub config: WorkerConfig,
    pub queue: Arc<dyn JobQueue>,
    pub store: Arc<dyn ArtifactStore>,
    pub analyzer: Arc<dyn AnalysisStage>,
    pub sink: Arc<dyn ResultSink>,
    policy: RedeliveryPolicy,
}

impl ProcessingContext {
    pub fn new(
        config: WorkerConfig,
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn ArtifactStore>,
        analyzer: Arc<dyn AnalysisStage>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        let policy = RedeliveryPolicy::from_config(&config);
        Self {
            config,
            queue,
            store,
            analyzer,
            sink,
            policy,
        }
    }

    /// Process one delivery to the end. `abort` flips to true when the
    /// worker gives up waiting for in-flight jobs.
    pub async fn handle(&self, envelope: Envelope, abort: watch::Receiver<bool>) -> Outcome {
        let logger = JobLogger::new(&envelope);
        let span = logger.create_span();

        metrics::job_started();
        let outcome = self.handle_inner(envelope, logger, abort).instrument(span).await;
        metrics::job_finished();
        outcome
    }

    async fn handle_inner(
        &self,
        envelope: Envelope,
        logger: JobLogger,
        mut abort: watch::Receiver<bool>,
    ) -> Outcome {
        let started = Instant::now();

        let job = match JobDescriptor::from_wire(&envelope.payload) {
            Ok(job) => job,
            Err(e) => return self.fail(&envelope, &logger, e.into()).await,
        };
        let logger = logger.with_job(&job);
        logger.log_start();

        let result = tokio::select! {
            result = self.run_stages(&job, &logger) => result,
            lost = self.heartbeat(&envelope, &logger) => {
                logger.log_warning(&format!("Stopped processing: {}", lost));
                return Outcome::Abandoned;
            }
            _ = aborted(&mut abort) => {
                return self.release(&envelope, &logger).await;
            }
        };

        match result {
            Ok(result) => self.complete(&envelope, &logger, result, started).await,
            Err(e) => self.fail(&envelope, &logger, e).await,
        }
    }

    /// Fetch, analyze, record. Strictly in this order.
    async fn run_stages(&self, job: &JobDescriptor, logger: &JobLogger) -> WorkerResult<AnalysisResult> {
        logger.log_progress(ProcessingStage::FetchingArtifact.as_str());
        let info = self
            .store
            .head(&job.blob_name)
            .await?
            .ok_or_else(|| WorkerError::artifact_not_found(&job.blob_name))?;
        if info.size > self.config.max_artifact_bytes {
            return Err(AnalysisError::TooLarge {
                key: info.key,
                limit: self.config.max_artifact_bytes,
            }
            .into());
        }
        let body = self.store.open(&job.blob_name).await?;

        logger.log_progress(ProcessingStage::Analyzing.as_str());
        let result = self.analyzer.analyze(job, body).await?;

        self.sink.record(&result).await?;
        Ok(result)
    }

    /// Keep the lease alive while the job runs. Returns only if the lease
    /// has been lost to another consumer.
    async fn heartbeat(&self, envelope: &Envelope, logger: &JobLogger) -> QueueError {
        let mut tracker = FailureTracker::new(3);
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        interval.tick().await; // first tick fires immediately

        loop {
            interval.tick().await;
            match self
                .queue
                .extend_lease(envelope, self.config.lease_duration)
                .await
            {
                Ok(()) => tracker.record_success(),
                Err(e @ QueueError::LeaseLost(_)) => return e,
                Err(e) => {
                    if tracker.record_failure() {
                        logger.log_warning(&format!("Failed to extend lease: {}", e));
                    }
                }
            }
        }
    }

    async fn complete(
        &self,
        envelope: &Envelope,
        logger: &JobLogger,
        result: AnalysisResult,
        started: Instant,
    ) -> Outcome {
        let retry = RetryConfig::new("acknowledge");
        match retry_async(&retry, || self.queue.acknowledge(envelope)).await {
            Ok(()) => {
                metrics::record_job_completed(
                    &result.analyzer,
                    result.byte_length,
                    started.elapsed().as_secs_f64(),
                );
                logger.log_completion(&format!(
                    "{} bytes, sha256 {}",
                    result.byte_length, result.sha256
                ));
                Outcome::Acknowledged(result)
            }
            Err(e) => {
                // The result is recorded; a redelivery records it again under
                // the same key.
                logger.log_error(&format!("Failed to acknowledge: {}", e));
                Outcome::Abandoned
            }
        }
    }

    async fn fail(&self, envelope: &Envelope, logger: &JobLogger, error: WorkerError) -> Outcome {
        metrics::record_job_failed(&error);

        match self.policy.decide(&error, envelope.delivery_count) {
            FailureAction::Retry(delay) => {
                logger.log_warning(&format!(
                    "{} (attempt {}/{}), retrying in {:?}",
                    error, envelope.delivery_count, self.policy.max_attempts, delay
                ));
                match self.queue.extend_lease(envelope, delay).await {
                    Ok(()) => {
                        metrics::record_job_retried();
                        Outcome::Retrying(delay)
                    }
                    Err(e) => {
                        logger.log_error(&format!("Failed to schedule retry: {}", e));
                        Outcome::Abandoned
                    }
                }
            }
            FailureAction::DeadLetter => {
                let reason = error.to_string();
                logger.log_error(&format!(
                    "{} (attempt {}), moving to DLQ",
                    reason, envelope.delivery_count
                ));
                let retry = RetryConfig::new("dead_letter");
                match retry_async(&retry, || self.queue.dead_letter(envelope, &reason)).await {
                    Ok(()) => {
                        metrics::record_job_dead_lettered(&error);
                        Outcome::DeadLettered
                    }
                    Err(e) => {
                        logger.log_error(&format!("Failed to dead-letter: {}", e));
                        Outcome::Abandoned
                    }
                }
            }
        }
    }

    async fn release(&self, envelope: &Envelope, logger: &JobLogger) -> Outcome {
        match self.queue.release(envelope).await {
            Ok(()) => {
                logger.log_warning("Released for redelivery on shutdown");
                Outcome::Released
            }
            Err(e) => {
                logger.log_error(&format!("Failed to release: {}", e));
                Outcome::Abandoned
            }
        }
    }
}

/// Resolves once the flag is set. Never resolves if the sender is gone.
async fn aborted(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
