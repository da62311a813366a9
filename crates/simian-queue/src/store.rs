//! Coordination store contract.
//!
//! Every mutation here is a single atomic operation on the store side.
//! Renew, release and acknowledge are conditional on the caller still owning
//! an unexpired lease (compare-and-swap on `worker_id|lease_id`); callers never
//! read-then-write.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use simian_models::{
    Batch, BatchId, BatchStatus, ClaimedCombination, Combination, DeadLetter, Lease, WorkerId,
};

use crate::error::QueueResult;

/// Outcome of releasing a failed combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReleaseOutcome {
    /// Back in pending with the new attempt count
    Requeued { attempt_count: u32 },
    /// Retry budget exhausted; moved to the dead-letter set
    DeadLettered { attempt_count: u32 },
    /// Caller no longer owns the lease; nothing changed
    LeaseLost,
}

/// Outcome of acknowledging a finished combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckOutcome {
    Acknowledged,
    /// Lease expired or was reassigned; `completed` was not incremented
    LeaseLost,
}

/// Result of one expired-lease sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub requeued: u64,
    pub dead_lettered: u64,
}

impl SweepReport {
    pub fn merge(&mut self, other: SweepReport) {
        self.requeued += other.requeued;
        self.dead_lettered += other.dead_lettered;
    }

    pub fn total(&self) -> u64 {
        self.requeued + self.dead_lettered
    }
}

/// Where a combination goes after one more failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Requeue { attempt_count: u32 },
    DeadLetter { attempt_count: u32 },
}

/// Retry budget for combinations.
///
/// Each failed attempt bumps `attempt_count`; once it exceeds `max_attempts`
/// the combination is terminal, so it is retried `max_attempts` times after
/// its first render. The stores apply the same rule inside their atomic
/// operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadLetterPolicy {
    pub max_attempts: u32,
}

impl DeadLetterPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// Whether a combination with this (already incremented) count is terminal.
    pub fn is_exhausted(&self, attempt_count: u32) -> bool {
        attempt_count > self.max_attempts
    }

    /// Decide the fate of a combination that just failed.
    pub fn decide(&self, combination: &Combination) -> Disposition {
        let attempt_count = combination.attempt_count.saturating_add(1);
        if self.is_exhausted(attempt_count) {
            Disposition::DeadLetter { attempt_count }
        } else {
            Disposition::Requeue { attempt_count }
        }
    }
}

/// Shared coordination substrate for the queue, lease table and counters.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Create batch metadata in the seeding state if the id is unused.
    ///
    /// Returns `false` when a batch with the same id already exists.
    async fn create_batch(&self, batch: &Batch) -> QueueResult<bool>;

    /// Append a chunk of combinations to a seeding batch's pending list.
    async fn seed(&self, batch_id: &BatchId, combinations: &[Combination]) -> QueueResult<()>;

    /// Flip a fully seeded batch to ready, making it claimable.
    async fn mark_ready(&self, batch_id: &BatchId) -> QueueResult<()>;

    /// Drop everything seeded so far and mark the batch invalid.
    async fn invalidate(&self, batch_id: &BatchId) -> QueueResult<()>;

    /// Batch metadata, if the batch exists.
    async fn batch(&self, batch_id: &BatchId) -> QueueResult<Option<Batch>>;

    /// Atomically pop one pending combination into in-progress under a new lease.
    async fn claim(
        &self,
        batch_id: &BatchId,
        worker_id: &WorkerId,
        lease_duration: Duration,
    ) -> QueueResult<Option<ClaimedCombination>>;

    /// Extend a lease. Returns the renewed lease, or `None` if it was lost.
    async fn renew(&self, lease: &Lease, lease_duration: Duration) -> QueueResult<Option<Lease>>;

    /// Give a failed combination back, incrementing its attempt count and
    /// dead-lettering it once the count exceeds `max_attempts`.
    async fn release(&self, lease: &Lease, reason: &str, max_attempts: u32) -> QueueResult<ReleaseOutcome>;

    /// Mark a combination completed. The only terminal-success transition.
    async fn acknowledge(&self, lease: &Lease) -> QueueResult<AckOutcome>;

    /// Requeue (or dead-letter) up to `limit` combinations whose lease expired.
    async fn requeue_expired(
        &self,
        batch_id: &BatchId,
        max_attempts: u32,
        limit: usize,
    ) -> QueueResult<SweepReport>;

    /// Snapshot of queue sizes and counters.
    async fn status(&self, batch_id: &BatchId) -> QueueResult<BatchStatus>;

    /// Dead-lettered combinations with their last failure reason.
    async fn dead_letters(&self, batch_id: &BatchId) -> QueueResult<Vec<DeadLetter>>;
}
