//! Worker configuration.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{WorkerError, WorkerResult};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent jobs
    pub max_concurrent_jobs: usize,
    /// Upper bound on envelopes requested per receive
    pub batch_size: usize,
    /// Deliveries after which a retryable failure is dead-lettered
    pub max_attempts: u32,
    /// Lease requested for each received envelope
    pub lease_duration: Duration,
    /// Interval for extending the lease while a job is in flight
    pub heartbeat_interval: Duration,
    /// First retry backoff; doubles per attempt
    pub retry_base_delay: Duration,
    /// Cap on the retry backoff
    pub retry_max_delay: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// Pause after a failed receive
    pub receive_error_backoff: Duration,
    /// Artifacts larger than this are rejected by the analyzer
    pub max_artifact_bytes: u64,
    /// Prometheus scrape listener, if any
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            batch_size: 10,
            max_attempts: 5,
            lease_duration: Duration::from_secs(300), // 5 minutes
            heartbeat_interval: Duration::from_secs(60),
            retry_base_delay: Duration::from_secs(5),
            retry_max_delay: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
            receive_error_backoff: Duration::from_secs(5),
            max_artifact_bytes: 256 * 1024 * 1024,
            metrics_addr: None,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> WorkerResult<Self> {
        let defaults = Self::default();

        let metrics_addr = match std::env::var("WORKER_METRICS_ADDR") {
            Ok(addr) if !addr.trim().is_empty() => Some(addr.parse().map_err(|_| {
                WorkerError::config_error(format!("invalid WORKER_METRICS_ADDR: {}", addr))
            })?),
            _ => None,
        };

        let config = Self {
            max_concurrent_jobs: env_or("WORKER_MAX_JOBS", defaults.max_concurrent_jobs),
            batch_size: env_or("WORKER_BATCH_SIZE", defaults.batch_size),
            max_attempts: env_or("WORKER_MAX_ATTEMPTS", defaults.max_attempts),
            lease_duration: Duration::from_secs(env_or("QUEUE_VISIBILITY_TIMEOUT", 300)),
            heartbeat_interval: Duration::from_secs(env_or("WORKER_HEARTBEAT_SECS", 60)),
            retry_base_delay: Duration::from_secs(env_or("WORKER_RETRY_BASE_SECS", 5)),
            retry_max_delay: Duration::from_secs(env_or("WORKER_RETRY_MAX_SECS", 300)),
            shutdown_timeout: Duration::from_secs(env_or("WORKER_SHUTDOWN_TIMEOUT", 30)),
            receive_error_backoff: defaults.receive_error_backoff,
            max_artifact_bytes: env_or("WORKER_MAX_ARTIFACT_BYTES", defaults.max_artifact_bytes),
            metrics_addr,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the executor cannot run with.
    pub fn validate(&self) -> WorkerResult<()> {
        if self.max_concurrent_jobs == 0 {
            return Err(WorkerError::config_error("WORKER_MAX_JOBS must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(WorkerError::config_error("WORKER_BATCH_SIZE must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(WorkerError::config_error("WORKER_MAX_ATTEMPTS must be at least 1"));
        }
        if self.lease_duration.is_zero() {
            return Err(WorkerError::config_error("QUEUE_VISIBILITY_TIMEOUT must be at least 1 second"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(WorkerError::config_error("WORKER_HEARTBEAT_SECS must be at least 1 second"));
        }
        if self.heartbeat_interval >= self.lease_duration {
            return Err(WorkerError::config_error(format!(
                "heartbeat interval ({:?}) must be shorter than the lease ({:?})",
                self.heartbeat_interval, self.lease_duration
            )));
        }
        Ok(())
    }
}
