//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use simian_models::{BatchId, DEFAULT_ARTIFACT_PREFIX};
use simian_queue::QueueConfig;

use crate::error::{WorkerError, WorkerResult};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Batch this worker drains
    pub batch_id: Option<BatchId>,
    /// Concurrent render slots, each holding at most one lease
    pub slots: usize,
    /// How often a held lease is renewed
    pub lease_renew_interval: Duration,
    /// Lower bound of the random wait after an empty claim
    pub claim_backoff_min: Duration,
    /// Upper bound of the random wait after an empty claim
    pub claim_backoff_max: Duration,
    /// How often this process sweeps expired leases
    pub sweep_interval: Duration,
    /// Consecutive sweep failures before escalating to error level
    pub sweep_failure_budget: u32,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// Work directory for render output
    pub work_dir: PathBuf,
    /// Prefix of every uploaded artifact key
    pub artifact_prefix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_id: None,
            slots: 1,
            lease_renew_interval: Duration::from_secs(60),
            claim_backoff_min: Duration::from_millis(500),
            claim_backoff_max: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(30),
            sweep_failure_budget: 5,
            shutdown_timeout: Duration::from_secs(30),
            work_dir: PathBuf::from("/tmp/simian"),
            artifact_prefix: DEFAULT_ARTIFACT_PREFIX.to_string(),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_id: std::env::var("SIMIAN_BATCH_ID").ok().map(BatchId::from_string),
            slots: std::env::var("WORKER_SLOTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.slots),
            lease_renew_interval: Duration::from_secs(
                std::env::var("WORKER_LEASE_RENEW_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            ),
            claim_backoff_min: Duration::from_millis(
                std::env::var("WORKER_CLAIM_BACKOFF_MIN_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(500),
            ),
            claim_backoff_max: Duration::from_millis(
                std::env::var("WORKER_CLAIM_BACKOFF_MAX_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5000),
            ),
            sweep_interval: Duration::from_secs(
                std::env::var("WORKER_SWEEP_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            sweep_failure_budget: std::env::var("WORKER_SWEEP_FAILURE_BUDGET")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.sweep_failure_budget),
            shutdown_timeout: Duration::from_secs(
                std::env::var("WORKER_SHUTDOWN_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            work_dir: std::env::var("WORKER_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            artifact_prefix: std::env::var("SIMIAN_ARTIFACT_PREFIX")
                .unwrap_or(defaults.artifact_prefix),
        }
    }

    /// Check invariants against the queue's lease settings.
    pub fn validate(&self, queue: &QueueConfig) -> WorkerResult<()> {
        if self.slots == 0 {
            return Err(WorkerError::config_error("slots must be at least 1"));
        }
        if self.lease_renew_interval.is_zero() {
            return Err(WorkerError::config_error("lease_renew_interval must be positive"));
        }
        if self.lease_renew_interval >= queue.lease_duration {
            return Err(WorkerError::config_error(format!(
                "lease_renew_interval ({:?}) must be shorter than lease_duration ({:?})",
                self.lease_renew_interval, queue.lease_duration
            )));
        }
        if self.claim_backoff_min > self.claim_backoff_max {
            return Err(WorkerError::config_error(
                "claim_backoff_min must not exceed claim_backoff_max",
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(WorkerError::config_error("sweep_interval must be positive"));
        }
        Ok(())
    }
}
