//! Shared data models for the intake pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Job descriptors published by the API and consumed by the worker
//! - The base64-over-JSON transport encoding used on the queue
//! - Analysis results produced by the worker
//! - Per-envelope processing stages

pub mod analysis;
pub mod encoding;
pub mod job;
pub mod job_status;

// Re-export common types
pub use analysis::AnalysisResult;
pub use encoding::{WireError, WireResult};
pub use job::{JobDescriptor, ModelError};
pub use job_status::ProcessingStage;
