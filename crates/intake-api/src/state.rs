//! Application state.

use std::sync::Arc;

use intake_queue::{JobProducer, JobQueue, QueueResult, RedisQueue};

use crate::config::ApiConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub queue: Arc<dyn JobQueue>,
    pub producer: JobProducer,
}

impl AppState {
    /// Build state around an existing queue.
    pub fn new(config: ApiConfig, queue: Arc<dyn JobQueue>) -> Self {
        let producer = JobProducer::new(Arc::clone(&queue));
        Self {
            config,
            queue,
            producer,
        }
    }

    /// Create application state backed by the Redis queue from the environment.
    pub fn from_env(config: ApiConfig) -> QueueResult<Self> {
        let queue = RedisQueue::from_env()?;
        Ok(Self::new(config, Arc::new(queue)))
    }
}
