//! Health check handlers.

use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use tracing::warn;

use crate::metrics;
use crate::state::AppState;

/// Health response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub version: String,
    pub timestamp: String,
}

/// Health check endpoint (liveness).
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// Readiness check response.
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub queue: QueueCheck,
}

#[derive(Serialize)]
pub struct QueueCheck {
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letters: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Readiness check endpoint.
/// Ready when the job queue answers a depth query.
pub async fn ready(
    State(state): State<AppState>,
) -> Result<Json<ReadinessResponse>, (StatusCode, Json<ReadinessResponse>)> {
    let name = state.queue.name().to_string();
    let start = Instant::now();

    let depths = async {
        let depth = state.queue.len().await?;
        let dead_letters = state.queue.dead_letter_len().await?;
        Ok::<_, intake_queue::QueueError>((depth, dead_letters))
    }
    .await;

    match depths {
        Ok((depth, dead_letters)) => {
            metrics::set_queue_depth(depth, dead_letters);
            Ok(Json(ReadinessResponse {
                status: "ready".to_string(),
                queue: QueueCheck {
                    name,
                    status: "ok".to_string(),
                    depth: Some(depth),
                    dead_letters: Some(dead_letters),
                    latency_ms: Some(start.elapsed().as_millis() as u64),
                    error: None,
                },
            }))
        }
        Err(e) => {
            warn!("Readiness check failed: {}", e);
            let error = if state.config.is_production() {
                "queue unreachable".to_string()
            } else {
                e.to_string()
            };
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadinessResponse {
                    status: "unavailable".to_string(),
                    queue: QueueCheck {
                        name,
                        status: "error".to_string(),
                        depth: None,
                        dead_letters: None,
                        latency_ms: None,
                        error: Some(error),
                    },
                }),
            ))
        }
    }
}
