//! Intake job worker.
//!
//! This crate provides:
//! - Job executor: bounded worker pool over an at-least-once queue
//! - Per-envelope processing with lease heartbeats, retry and dead-lettering
//! - The pluggable analysis stage and result sinks
//! - Graceful shutdown

pub mod analysis;
pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod processor;
pub mod retry;
pub mod sink;

pub use analysis::{AnalysisError, AnalysisStage, ByteLengthAnalyzer};
pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use executor::JobExecutor;
pub use logging::JobLogger;
pub use processor::{Outcome, ProcessingContext};
pub use sink::{LogSink, MemorySink, ResultSink};
