//! Job executor.

use std::sync::Arc;

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use intake_queue::{Envelope, JobQueue};
use intake_storage::ArtifactStore;

use crate::analysis::{AnalysisStage, ByteLengthAnalyzer};
use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::metrics;
use crate::processor::{Outcome, ProcessingContext};
use crate::retry::FailureTracker;
use crate::sink::{LogSink, ResultSink};

/// Job executor that processes jobs from the queue.
pub struct JobExecutor {
    config: WorkerConfig,
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn ArtifactStore>,
    analyzer: Arc<dyn AnalysisStage>,
    sink: Arc<dyn ResultSink>,
    job_semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl JobExecutor {
    /// Create a new job executor with the byte-length analyzer and log sink.
    pub fn new(config: WorkerConfig, queue: Arc<dyn JobQueue>, store: Arc<dyn ArtifactStore>) -> Self {
        let job_semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        let (shutdown, _) = watch::channel(false);
        let analyzer = Arc::new(ByteLengthAnalyzer::new(config.max_artifact_bytes));

        Self {
            config,
            queue,
            store,
            analyzer,
            sink: Arc::new(LogSink),
            job_semaphore,
            shutdown,
        }
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn AnalysisStage>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Start the executor. Returns after shutdown once in-flight jobs have
    /// finished or been released.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            "Starting job executor on queue '{}' with {} max concurrent jobs",
            self.queue.name(),
            self.config.max_concurrent_jobs
        );

        self.config.validate()?;

        let mut shutdown_rx = self.shutdown.subscribe();
        if !self.wait_for_queue(&mut shutdown_rx).await {
            info!("Shutdown requested before the queue became available");
            return Ok(());
        }
        if let Err(e) = self.store.check_connectivity().await {
            warn!("Artifact store not reachable at startup: {}", e);
        }

        let ctx = Arc::new(ProcessingContext::new(
            self.config.clone(),
            Arc::clone(&self.queue),
            Arc::clone(&self.store),
            Arc::clone(&self.analyzer),
            Arc::clone(&self.sink),
        ));

        let (abort_tx, _) = watch::channel(false);
        let mut tasks = JoinSet::new();
        let mut receive_failures = FailureTracker::new(3);

        // Main job consumption loop
        loop {
            if *shutdown_rx.borrow_and_update() {
                info!("Shutdown signal received, stopping executor");
                break;
            }

            while let Some(joined) = tasks.try_join_next() {
                log_task_result(joined);
            }

            let Some(permits) = self.acquire_slots(&mut shutdown_rx).await? else {
                continue;
            };

            let envelopes = match self
                .queue
                .receive(permits.len(), self.config.lease_duration)
                .await
            {
                Ok(envelopes) => {
                    receive_failures.record_success();
                    envelopes
                }
                Err(e) => {
                    if receive_failures.record_failure() {
                        error!("Error receiving jobs: {}", e);
                    }
                    // Back off on error
                    tokio::select! {
                        _ = shutdown_rx.changed() => {}
                        _ = tokio::time::sleep(self.config.receive_error_backoff) => {}
                    }
                    continue;
                }
            };

            if envelopes.is_empty() {
                continue;
            }

            if *shutdown_rx.borrow() {
                self.release_all(&envelopes).await;
                continue;
            }

            debug!("Received {} jobs from queue", envelopes.len());
            metrics::record_jobs_received(envelopes.len());

            for (envelope, permit) in envelopes.into_iter().zip(permits) {
                let ctx = Arc::clone(&ctx);
                let abort = abort_tx.subscribe();
                tasks.spawn(async move {
                    let _permit = permit;
                    ctx.handle(envelope, abort).await
                });
            }
        }

        // Wait for in-flight jobs to complete
        if !tasks.is_empty() {
            info!("Waiting for {} in-flight jobs to complete...", tasks.len());
        }
        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                log_task_result(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "Shutdown timeout elapsed with {} jobs in flight, releasing them",
                tasks.len()
            );
            abort_tx.send_replace(true);
            while let Some(joined) = tasks.join_next().await {
                log_task_result(joined);
            }
        }

        info!("Job executor stopped");
        Ok(())
    }

    /// Retry `ensure_exists` until it succeeds. `false` if shutdown was
    /// signalled first.
    async fn wait_for_queue(&self, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        let mut failures = FailureTracker::new(3);
        loop {
            if *shutdown_rx.borrow_and_update() {
                return false;
            }
            match self.queue.ensure_exists().await {
                Ok(()) => {
                    if failures.failure_count() > 0 {
                        info!("Queue '{}' is available", self.queue.name());
                    }
                    failures.record_success();
                    return true;
                }
                Err(e) => {
                    if failures.record_failure() {
                        error!("Queue '{}' unavailable: {}", self.queue.name(), e);
                    }
                    tokio::select! {
                        _ = shutdown_rx.changed() => {}
                        _ = tokio::time::sleep(self.config.receive_error_backoff) => {}
                    }
                }
            }
        }
    }

    /// Wait for at least one free worker slot, then take as many more as are
    /// free, up to the batch size. `None` if shutdown was signalled meanwhile.
    async fn acquire_slots(
        &self,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> WorkerResult<Option<Vec<OwnedSemaphorePermit>>> {
        let first = tokio::select! {
            _ = shutdown_rx.changed() => return Ok(None),
            permit = Arc::clone(&self.job_semaphore).acquire_owned() => {
                permit.map_err(|_| WorkerError::job_failed("Semaphore closed"))?
            }
        };

        let mut permits = vec![first];
        while permits.len() < self.config.batch_size {
            match Arc::clone(&self.job_semaphore).try_acquire_owned() {
                Ok(permit) => permits.push(permit),
                Err(_) => break,
            }
        }
        Ok(Some(permits))
    }

    async fn release_all(&self, envelopes: &[Envelope]) {
        for envelope in envelopes {
            if let Err(e) = self.queue.release(envelope).await {
                warn!("Failed to release message {}: {}", envelope.message_id, e);
            }
        }
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Number of jobs currently running.
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrent_jobs - self.job_semaphore.available_permits()
    }
}

fn log_task_result(joined: Result<Outcome, tokio::task::JoinError>) {
    match joined {
        Ok(outcome) => debug!("Job finished: {:?}", outcome.stage()),
        Err(e) => error!("Job task failed: {}", e),
    }
}
