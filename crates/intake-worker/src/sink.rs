//! Result sinks.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::info;

use intake_models::AnalysisResult;

use crate::error::{WorkerError, WorkerResult};

/// Destination for analysis results.
///
/// Results for a redelivered job carry the same `dedup_key()`; a sink must
/// treat a repeated key as an overwrite, not a new record.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn record(&self, result: &AnalysisResult) -> WorkerResult<()>;
}

/// Emits each result as a structured log event.
#[derive(Debug, Clone, Default)]
pub struct LogSink;

#[async_trait]
impl ResultSink for LogSink {
    async fn record(&self, result: &AnalysisResult) -> WorkerResult<()> {
        let json = serde_json::to_string(result)
            .map_err(|e| WorkerError::sink(format!("failed to serialize result: {}", e)))?;
        info!(
            application_id = %result.application_id,
            blob_name = %result.blob_name,
            byte_length = result.byte_length,
            sha256 = %result.sha256,
            analyzer = %result.analyzer,
            result = %json,
            "Analysis complete"
        );
        Ok(())
    }
}

/// Keeps the latest result per dedup key.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    results: Arc<RwLock<HashMap<String, AnalysisResult>>>,
    writes: Arc<RwLock<u64>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored results, one per dedup key.
    pub fn results(&self) -> Vec<AnalysisResult> {
        self.results
            .read()
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, dedup_key: &str) -> Option<AnalysisResult> {
        self.results.read().ok()?.get(dedup_key).cloned()
    }

    /// Number of `record` calls, including overwrites.
    pub fn writes(&self) -> u64 {
        self.writes.read().map(|w| *w).unwrap_or(0)
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn record(&self, result: &AnalysisResult) -> WorkerResult<()> {
        self.results
            .write()
            .map_err(|_| WorkerError::sink("result store poisoned"))?
            .insert(result.dedup_key(), result.clone());
        *self
            .writes
            .write()
            .map_err(|_| WorkerError::sink("result store poisoned"))? += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use intake_models::JobDescriptor;

    #[tokio::test]
    async fn test_memory_sink_overwrites_same_key() {
        let sink = MemorySink::new();
        let job = JobDescriptor::new("app-1", "applications/app-1/uploads/file.pdf");
        let first = AnalysisResult::for_job(&job, "byte-length", 10, "abc");
        let again = AnalysisResult::for_job(&job, "byte-length", 10, "abc");

        sink.record(&first).await.unwrap();
        sink.record(&again).await.unwrap();

        assert_eq!(sink.results().len(), 1);
        assert_eq!(sink.writes(), 2);
        assert!(sink.get(&first.dedup_key()).is_some());
    }

    #[tokio::test]
    async fn test_log_sink_accepts_result() {
        let job = JobDescriptor::new("app-1", "applications/app-1/uploads/file.pdf");
        let result = AnalysisResult::for_job(&job, "byte-length", 10, "abc");
        tokio_test::assert_ok!(LogSink.record(&result).await);
    }
}
