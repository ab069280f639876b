//! Job descriptors for queue processing.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when a descriptor violates its field contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}

/// The unit of deferred work: one uploaded document of one application.
///
/// A descriptor is immutable once published. The queue may hand the same
/// descriptor to the worker more than once, so nothing derived from it may
/// depend on being seen only once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    /// Owning submission. Opaque to the pipeline.
    pub application_id: String,
    /// Key of the artifact in the artifact store
    pub blob_name: String,
    /// When the producer published the job
    pub enqueued_at: DateTime<Utc>,
}

impl JobDescriptor {
    /// Create a descriptor stamped with the current time.
    pub fn new(application_id: impl Into<String>, blob_name: impl Into<String>) -> Self {
        Self {
            application_id: application_id.into(),
            blob_name: blob_name.into(),
            enqueued_at: Utc::now(),
        }
    }

    /// Check that both identifying fields are present.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.application_id.trim().is_empty() {
            return Err(ModelError::MissingField("applicationId"));
        }
        if self.blob_name.trim().is_empty() {
            return Err(ModelError::MissingField("blobName"));
        }
        Ok(())
    }

    /// Short label used in logs.
    pub fn label(&self) -> String {
        format!("{}:{}", self.application_id, self.blob_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_sets_fields() {
        let before = Utc::now();
        let job = JobDescriptor::new("app-1", "applications/app-1/uploads/file.pdf");

        assert_eq!(job.application_id, "app-1");
        assert_eq!(job.blob_name, "applications/app-1/uploads/file.pdf");
        assert!(job.enqueued_at >= before);
        assert!(job.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_blank_fields() {
        let job = JobDescriptor::new("", "applications/x/uploads/a.pdf");
        assert_eq!(job.validate(), Err(ModelError::MissingField("applicationId")));

        let job = JobDescriptor::new("app-1", "   ");
        assert_eq!(job.validate(), Err(ModelError::MissingField("blobName")));
    }

    #[test]
    fn test_serializes_camel_case() {
        let job = JobDescriptor::new("app-1", "a/b.pdf");
        let json = serde_json::to_value(&job).expect("serialize");

        assert_eq!(json["applicationId"], "app-1");
        assert_eq!(json["blobName"], "a/b.pdf");
        assert!(json["enqueuedAt"].is_string());
    }
}
