//! At-least-once job queue.
//!
//! This crate provides:
//! - The vendor-neutral `JobQueue` capability (publish, receive with lease,
//!   acknowledge, extend, release, dead-letter)
//! - A Redis Streams backend with consumer groups and a dead-letter stream
//! - An in-memory backend with the same delivery semantics
//! - The job producer used by the HTTP API

pub mod envelope;
pub mod error;
pub mod memory;
pub mod producer;
pub mod queue;
pub mod redis_queue;

pub use envelope::{DeadLetter, Envelope};
pub use error::{QueueError, QueueResult};
pub use memory::MemoryQueue;
pub use producer::{JobProducer, ProducerError, SubmitOutcome, DEFAULT_IDEMPOTENCY_TTL};
pub use queue::{JobQueue, QueueConfig};
pub use redis_queue::RedisQueue;
