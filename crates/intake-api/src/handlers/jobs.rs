//! Job submission handler.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use tracing::{info, warn};
use validator::Validate;

use intake_queue::SubmitOutcome;

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;

/// Header carrying a client-chosen key for duplicate suppression.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Longest idempotency key accepted.
const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// Body of `POST /jobs`.
#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    #[serde(default)]
    #[validate(required, length(min = 1))]
    pub application_id: Option<String>,
    #[serde(default)]
    #[validate(required, length(min = 1))]
    pub blob_name: Option<String>,
}

/// Enqueue a job for one uploaded document.
///
/// Returns 201 when a message was published and 200 when the idempotency key
/// matched an earlier submission.
pub async fn create_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<CreateJobRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SubmitOutcome>)> {
    let Json(request) = body.map_err(|e| {
        warn!("Rejected job request body: {}", e);
        ApiError::missing_fields()
    })?;
    request.validate().map_err(|_| ApiError::missing_fields())?;

    let application_id = request.application_id.unwrap_or_default();
    let blob_name = request.blob_name.unwrap_or_default();

    let outcome = match idempotency_key(&headers)? {
        Some(key) => {
            state
                .producer
                .submit_idempotent(key, &application_id, &blob_name)
                .await
        }
        None => state.producer.submit(&application_id, &blob_name).await,
    }
    .map_err(|e| {
        warn!(application_id = %application_id, "Job not enqueued: {}", e);
        ApiError::from(e).for_environment(&state.config)
    })?;

    if !outcome.enqueued {
        return Ok((StatusCode::OK, Json(outcome)));
    }

    metrics::record_job_enqueued();
    info!(
        application_id = %outcome.payload.application_id,
        blob_name = %outcome.payload.blob_name,
        message_id = outcome.message_id.as_deref().unwrap_or_default(),
        "Job enqueued"
    );

    Ok((StatusCode::CREATED, Json(outcome)))
}

fn idempotency_key(headers: &HeaderMap) -> ApiResult<Option<&str>> {
    let Some(value) = headers.get(IDEMPOTENCY_KEY_HEADER) else {
        return Ok(None);
    };
    let key = value
        .to_str()
        .map_err(|_| ApiError::bad_request("Idempotency-Key must be visible ASCII"))?
        .trim();
    if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(ApiError::bad_request(format!(
            "Idempotency-Key must be 1 to {} characters",
            MAX_IDEMPOTENCY_KEY_LEN
        )));
    }
    Ok(Some(key))
}
