//! Structured cycle logging utilities.
//!
//! Provides consistent, structured logging for render cycles with
//! tracing spans and contextual information.

use tracing::{error, info, warn, Span};

use simian_models::{BatchId, CombinationId, WorkerId};

/// Cycle logger for structured logging with consistent formatting.
///
/// Every line carries the batch, combination and worker identifiers.
#[derive(Debug, Clone)]
pub struct CycleLogger {
    batch_id: String,
    combination_id: String,
    worker_id: String,
    attempt: u32,
}

impl CycleLogger {
    /// Create a logger for one claimed combination.
    pub fn new(
        batch_id: &BatchId,
        combination_id: &CombinationId,
        worker_id: &WorkerId,
        attempt: u32,
    ) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            combination_id: combination_id.to_string(),
            worker_id: worker_id.to_string(),
            attempt,
        }
    }

    /// Log the start of a cycle.
    pub fn log_start(&self, message: &str) {
        info!(
            batch_id = %self.batch_id,
            combination_id = %self.combination_id,
            worker_id = %self.worker_id,
            attempt = self.attempt,
            "Cycle started: {}", message
        );
    }

    /// Log a stage transition.
    pub fn log_progress(&self, message: &str) {
        info!(
            batch_id = %self.batch_id,
            combination_id = %self.combination_id,
            worker_id = %self.worker_id,
            "Cycle progress: {}", message
        );
    }

    /// Log a warning.
    pub fn log_warning(&self, message: &str) {
        warn!(
            batch_id = %self.batch_id,
            combination_id = %self.combination_id,
            worker_id = %self.worker_id,
            attempt = self.attempt,
            "Cycle warning: {}", message
        );
    }

    /// Log an error.
    pub fn log_error(&self, message: &str) {
        error!(
            batch_id = %self.batch_id,
            combination_id = %self.combination_id,
            worker_id = %self.worker_id,
            attempt = self.attempt,
            "Cycle error: {}", message
        );
    }

    /// Log a successful acknowledgment.
    pub fn log_completion(&self, message: &str) {
        info!(
            batch_id = %self.batch_id,
            combination_id = %self.combination_id,
            worker_id = %self.worker_id,
            "Cycle completed: {}", message
        );
    }

    pub fn combination_id(&self) -> &str {
        &self.combination_id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Create a tracing span for this cycle.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "cycle",
            batch_id = %self.batch_id,
            combination_id = %self.combination_id,
            worker_id = %self.worker_id
        )
    }
}
