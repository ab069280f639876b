//! Artifact storage.
//!
//! This crate provides:
//! - The `ArtifactStore` trait the worker reads artifacts through
//! - Streaming artifact bodies for artifacts of unbounded size
//! - An S3-compatible client (AWS S3, R2, MinIO)
//! - An in-memory store for tests and local runs

pub mod body;
pub mod client;
pub mod error;
pub mod memory;
pub mod store;

pub use body::ArtifactBody;
pub use client::{S3Config, S3Store};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryStore;
pub use store::{ArtifactInfo, ArtifactStore};
