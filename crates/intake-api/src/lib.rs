//! Axum HTTP API for the intake pipeline.
//!
//! This crate provides:
//! - `POST /jobs`, which validates a job request and publishes it to the queue
//! - Liveness and readiness checks
//! - Request ids, security headers, CORS and Prometheus metrics

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
