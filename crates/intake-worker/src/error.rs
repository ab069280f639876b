//! Worker error types.

use thiserror::Error;

use intake_models::WireError;
use intake_queue::QueueError;
use intake_storage::StorageError;

use crate::analysis::AnalysisError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] WireError),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Analysis failed: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Result sink failed: {0}")]
    Sink(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Job failed: {0}")]
    JobFailed(String),
}

impl From<StorageError> for WorkerError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(key) => WorkerError::ArtifactNotFound(key),
            other => WorkerError::Storage(other),
        }
    }
}

impl WorkerError {
    pub fn artifact_not_found(key: impl Into<String>) -> Self {
        Self::ArtifactNotFound(key.into())
    }

    pub fn sink(msg: impl Into<String>) -> Self {
        Self::Sink(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn job_failed(msg: impl Into<String>) -> Self {
        Self::JobFailed(msg.into())
    }

    /// Check if error is retryable.
    ///
    /// A missing artifact counts as retryable: the upload may not have
    /// landed yet when the job was enqueued.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::ArtifactNotFound(_)
            | WorkerError::Storage(_)
            | WorkerError::Queue(_)
            | WorkerError::Sink(_) => true,
            WorkerError::Analysis(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Check if this is a permanent failure that should NOT be retried.
    pub fn is_permanent_failure(&self) -> bool {
        !self.is_retryable()
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerError::InvalidPayload(_) => "invalid_payload",
            WorkerError::ArtifactNotFound(_) => "artifact_not_found",
            WorkerError::Analysis(_) => "analysis",
            WorkerError::Storage(_) => "storage",
            WorkerError::Queue(_) => "queue",
            WorkerError::Sink(_) => "sink",
            WorkerError::ConfigError(_) => "config",
            WorkerError::JobFailed(_) => "job",
        }
    }
}
