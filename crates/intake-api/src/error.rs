//! API error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use intake_queue::ProducerError;
use serde::Serialize;
use thiserror::Error;

use crate::config::ApiConfig;

pub type ApiResult<T> = Result<T, ApiError>;

/// Message returned when a job request lacks one of its fields.
pub const MISSING_FIELDS_MESSAGE: &str = "Missing applicationId or blobName";

#[derive(Debug, Error)]
pub enum ApiError {
    /// The job request is missing a field or is not a JSON object.
    #[error("{0}")]
    InvalidJob(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn missing_fields() -> Self {
        Self::InvalidJob(MISSING_FIELDS_MESSAGE.to_string())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Drop transport and internal details from errors served in production.
    pub fn for_environment(self, config: &ApiConfig) -> Self {
        if !config.is_production() {
            return self;
        }
        match self {
            ApiError::QueueUnavailable(_) => {
                ApiError::QueueUnavailable("the job was not enqueued".to_string())
            }
            ApiError::Internal(_) => ApiError::Internal("an internal error occurred".to_string()),
            other => other,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidJob(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::QueueUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ProducerError> for ApiError {
    fn from(err: ProducerError) -> Self {
        match err {
            ProducerError::InvalidRequest(_) => ApiError::missing_fields(),
            ProducerError::Publish(e) => ApiError::QueueUnavailable(e.to_string()),
            ProducerError::Encode(e) => ApiError::Internal(e.to_string()),
        }
    }
}

/// Sample of a well-formed job request, sent back with validation errors.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExample {
    pub application_id: &'static str,
    pub blob_name: &'static str,
}

pub const JOB_EXAMPLE: JobExample = JobExample {
    application_id: "test-123",
    blob_name: "applications/test-123/uploads/yourfile.pdf",
};

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    example: Option<JobExample>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let error = self.to_string();

        let example = match &self {
            ApiError::InvalidJob(_) => Some(JOB_EXAMPLE),
            _ => None,
        };

        (status, Json(ErrorResponse { error, example })).into_response()
    }
}
