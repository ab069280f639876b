//! Analysis results produced by the worker.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::job::JobDescriptor;

/// Outcome of analyzing one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    /// Owning submission
    pub application_id: String,
    /// Artifact key
    pub blob_name: String,
    /// Artifact size in bytes
    pub byte_length: u64,
    /// Hex SHA-256 of the artifact bytes
    pub sha256: String,
    /// Name of the analysis stage that produced this result
    pub analyzer: String,
    /// Free-form note from the analyzer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// When the result was produced
    pub processed_at: DateTime<Utc>,
}

impl AnalysisResult {
    /// Start a result for a descriptor.
    pub fn for_job(
        job: &JobDescriptor,
        analyzer: impl Into<String>,
        byte_length: u64,
        sha256: impl Into<String>,
    ) -> Self {
        Self {
            application_id: job.application_id.clone(),
            blob_name: job.blob_name.clone(),
            byte_length,
            sha256: sha256.into(),
            analyzer: analyzer.into(),
            note: None,
            processed_at: Utc::now(),
        }
    }

    /// Attach a note.
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Key under which sinks store this result.
    ///
    /// Re-running the same job over the same bytes yields the same key, so a
    /// redelivered job overwrites its earlier record.
    pub fn dedup_key(&self) -> String {
        format!("{}/{}@{}", self.application_id, self.blob_name, self.sha256)
    }

    /// Compare everything except the processing timestamp.
    pub fn same_outcome(&self, other: &Self) -> bool {
        self.application_id == other.application_id
            && self.blob_name == other.blob_name
            && self.byte_length == other.byte_length
            && self.sha256 == other.sha256
            && self.analyzer == other.analyzer
            && self.note == other.note
    }
}
