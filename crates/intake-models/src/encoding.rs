//! Queue transport encoding.
//!
//! Descriptors travel as a JSON object, base64-encoded into the queue
//! payload field. Both sides of the queue go through this module.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

use crate::job::{JobDescriptor, ModelError};

/// Result type for transport decoding.
pub type WireResult<T> = Result<T, WireError>;

/// Why a queue payload could not be turned back into a descriptor.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("Payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Payload is not a valid job descriptor: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid job descriptor: {0}")]
    Invalid(#[from] ModelError),
}

impl JobDescriptor {
    /// Encode for publishing.
    pub fn to_wire(&self) -> WireResult<String> {
        let json = serde_json::to_string(self)?;
        Ok(STANDARD.encode(json.as_bytes()))
    }

    /// Decode a payload received from the queue and validate it.
    pub fn from_wire(payload: &str) -> WireResult<Self> {
        let bytes = STANDARD.decode(payload.trim())?;
        let json = String::from_utf8(bytes)?;
        let job: JobDescriptor = serde_json::from_str(&json)?;
        job.validate()?;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_roundtrip() {
        let job = JobDescriptor::new("app-1", "applications/app-1/uploads/file.pdf");
        let payload = tokio_test::assert_ok!(job.to_wire());
        let decoded = tokio_test::assert_ok!(JobDescriptor::from_wire(&payload));
        assert_eq!(decoded, job);
    }

    #[test]
    fn test_decodes_producer_format() {
        let json = r#"{"applicationId":"test-123","blobName":"applications/test-123/uploads/yourfile.pdf","enqueuedAt":"2024-05-01T12:00:00.000Z"}"#;
        let payload = STANDARD.encode(json);

        let job = JobDescriptor::from_wire(&payload).expect("decode");
        assert_eq!(job.application_id, "test-123");
        assert_eq!(job.blob_name, "applications/test-123/uploads/yourfile.pdf");
        assert_eq!(job.enqueued_at.to_rfc3339(), "2024-05-01T12:00:00+00:00");
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            JobDescriptor::from_wire("not base64!!"),
            Err(WireError::Base64(_))
        ));

        let payload = STANDARD.encode("{\"applicationId\":\"a\"}");
        assert!(matches!(
            JobDescriptor::from_wire(&payload),
            Err(WireError::Json(_))
        ));
    }

    #[test]
    fn test_rejects_empty_fields() {
        let json = r#"{"applicationId":"","blobName":"a.pdf","enqueuedAt":"2024-05-01T12:00:00Z"}"#;
        let payload = STANDARD.encode(json);

        assert!(matches!(
            JobDescriptor::from_wire(&payload),
            Err(WireError::Invalid(ModelError::MissingField("applicationId")))
        ));
    }
}
