//! Structured job logging utilities.

use tracing::{error, info, warn, Span};

use intake_models::JobDescriptor;
use intake_queue::Envelope;

/// Logs one delivery's lifecycle with the same contextual fields on every
/// event (message id, delivery count, and the job once it is decoded).
#[derive(Debug, Clone)]
pub struct JobLogger {
    message_id: String,
    delivery_count: u32,
    redelivery: bool,
    application_id: Option<String>,
    blob_name: Option<String>,
}

impl JobLogger {
    /// Create a logger for a freshly received envelope.
    pub fn new(envelope: &Envelope) -> Self {
        Self {
            message_id: envelope.message_id.clone(),
            delivery_count: envelope.delivery_count,
            redelivery: envelope.is_redelivery(),
            application_id: None,
            blob_name: None,
        }
    }

    /// Attach the decoded job.
    pub fn with_job(mut self, job: &JobDescriptor) -> Self {
        self.application_id = Some(job.application_id.clone());
        self.blob_name = Some(job.blob_name.clone());
        self
    }

    fn application_id(&self) -> &str {
        self.application_id.as_deref().unwrap_or("-")
    }

    fn blob_name(&self) -> &str {
        self.blob_name.as_deref().unwrap_or("-")
    }

    pub fn log_start(&self) {
        info!(
            message_id = %self.message_id,
            delivery_count = self.delivery_count,
            redelivery = self.redelivery,
            application_id = %self.application_id(),
            blob_name = %self.blob_name(),
            "Job started"
        );
    }

    pub fn log_progress(&self, message: &str) {
        info!(
            message_id = %self.message_id,
            application_id = %self.application_id(),
            "Job progress: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            message_id = %self.message_id,
            delivery_count = self.delivery_count,
            application_id = %self.application_id(),
            blob_name = %self.blob_name(),
            "Job warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            message_id = %self.message_id,
            delivery_count = self.delivery_count,
            application_id = %self.application_id(),
            blob_name = %self.blob_name(),
            "Job error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            message_id = %self.message_id,
            application_id = %self.application_id(),
            blob_name = %self.blob_name(),
            "Job completed: {}", message
        );
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Span covering the whole delivery.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            message_id = %self.message_id,
            delivery_count = self.delivery_count,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn envelope() -> Envelope {
        Envelope {
            receipt: "1.1".to_string(),
            message_id: "1".to_string(),
            payload: String::new(),
            delivery_count: 1,
            lease_expires_at: Utc::now(),
        }
    }

    #[test]
    fn test_job_logger_creation() {
        let logger = JobLogger::new(&envelope());

        assert_eq!(logger.message_id(), "1");
        assert_eq!(logger.application_id(), "-");
    }

    #[test]
    fn test_job_logger_with_job() {
        let job = JobDescriptor::new("app-1", "applications/app-1/uploads/file.pdf");
        let logger = JobLogger::new(&envelope()).with_job(&job);

        assert_eq!(logger.application_id(), "app-1");
        assert_eq!(logger.blob_name(), "applications/app-1/uploads/file.pdf");
    }
}
