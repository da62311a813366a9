//! Batch lifecycle and the lease protocol facade used by workers.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use simian_models::{
    Batch, BatchId, BatchState, BatchStatus, ClaimedCombination, Combination, DeadLetter, Lease,
    WorkerId,
};

use crate::error::{QueueError, QueueResult};
use crate::redis_store::{RedisStore, DEFAULT_KEY_PREFIX};
use crate::retry::{retry_store, RetryConfig};
use crate::source::{validate_combinations, CombinationSource};
use crate::store::{AckOutcome, CoordinationStore, DeadLetterPolicy, ReleaseOutcome, SweepReport};

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Prefix for every key this batch system writes
    pub key_prefix: String,
    /// Retries allowed after the first attempt; exceeding it dead-letters
    pub max_attempts: u32,
    /// Lease duration granted on claim and on every renewal
    pub lease_duration: Duration,
    /// Combinations pushed per seeding round trip
    pub seed_chunk_size: usize,
    /// Expired leases handled per sweep script invocation
    pub sweep_batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            max_attempts: 3,
            lease_duration: Duration::from_secs(300), // 5 minutes
            seed_chunk_size: 500,
            sweep_batch_size: 100,
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            key_prefix: std::env::var("SIMIAN_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            max_attempts: std::env::var("SIMIAN_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_attempts),
            lease_duration: std::env::var("SIMIAN_LEASE_DURATION_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.lease_duration),
            seed_chunk_size: std::env::var("SIMIAN_SEED_CHUNK_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.seed_chunk_size),
            sweep_batch_size: std::env::var("SIMIAN_SWEEP_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.sweep_batch_size),
        }
    }

    /// Check invariants between options.
    pub fn validate(&self) -> QueueResult<()> {
        if self.max_attempts == 0 {
            return Err(QueueError::config("max_attempts must be at least 1"));
        }
        if self.lease_duration.is_zero() {
            return Err(QueueError::config("lease_duration must be positive"));
        }
        if self.seed_chunk_size == 0 || self.sweep_batch_size == 0 {
            return Err(QueueError::config("chunk sizes must be positive"));
        }
        Ok(())
    }
}

/// Owns batch lifecycle and exposes the lease protocol to workers.
#[derive(Clone)]
pub struct QueueManager {
    store: Arc<dyn CoordinationStore>,
    config: QueueConfig,
    read_retry: RetryConfig,
}

impl QueueManager {
    /// Create a manager over any coordination store.
    pub fn new(store: Arc<dyn CoordinationStore>, config: QueueConfig) -> QueueResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            read_retry: RetryConfig::new("store read"),
        })
    }

    /// Create a Redis-backed manager.
    pub fn redis(config: QueueConfig) -> QueueResult<Self> {
        let store = RedisStore::new(&config.redis_url, config.key_prefix.clone())?;
        Self::new(Arc::new(store), config)
    }

    /// Create from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::redis(QueueConfig::from_env())
    }

    /// Override the backoff used for store reads.
    pub fn with_read_retry(mut self, read_retry: RetryConfig) -> Self {
        self.read_retry = read_retry;
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub fn dead_letter_policy(&self) -> DeadLetterPolicy {
        DeadLetterPolicy::new(self.config.max_attempts)
    }

    /// Enumerate a source and start a batch from it.
    pub async fn start_batch_from(
        &self,
        source: &dyn CombinationSource,
        batch_id: Option<BatchId>,
    ) -> QueueResult<Batch> {
        let combinations = source.enumerate().await?;
        self.start_batch(batch_id, combinations).await
    }

    /// Create a batch and push every combination into pending.
    ///
    /// The batch only becomes claimable after the last chunk lands. Any write
    /// failure rolls the batch back and marks it invalid.
    pub async fn start_batch(
        &self,
        batch_id: Option<BatchId>,
        combinations: Vec<Combination>,
    ) -> QueueResult<Batch> {
        validate_combinations(&combinations)?;

        let batch = Batch::new(batch_id.unwrap_or_default(), combinations.len() as u64);
        let batch_id = batch.batch_id.clone();

        let created = self
            .store
            .create_batch(&batch)
            .await
            .map_err(|e| QueueError::batch_init(format!("could not create batch {}: {}", batch_id, e)))?;
        if !created {
            warn!(batch_id = %batch_id, "Batch already exists");
            return Err(QueueError::BatchExists(batch_id));
        }

        for (index, chunk) in combinations.chunks(self.config.seed_chunk_size).enumerate() {
            if let Err(e) = self.store.seed(&batch_id, chunk).await {
                error!(batch_id = %batch_id, chunk = index, "Seeding failed: {}", e);
                self.rollback(&batch_id).await;
                return Err(QueueError::batch_init(format!(
                    "seeding batch {} failed: {}",
                    batch_id, e
                )));
            }
        }

        if let Err(e) = self.store.mark_ready(&batch_id).await {
            error!(batch_id = %batch_id, "Could not mark batch ready: {}", e);
            self.rollback(&batch_id).await;
            return Err(QueueError::batch_init(format!(
                "finalizing batch {} failed: {}",
                batch_id, e
            )));
        }

        info!(
            batch_id = %batch_id,
            total = batch.total_count,
            "Batch started"
        );
        Ok(batch)
    }

    async fn rollback(&self, batch_id: &BatchId) {
        match self.store.invalidate(batch_id).await {
            Ok(()) => warn!(batch_id = %batch_id, "Rolled back partial batch"),
            Err(e) => error!(
                batch_id = %batch_id,
                "Rollback failed, batch left in seeding state and unclaimable: {}", e
            ),
        }
    }

    /// Batch metadata.
    pub async fn batch(&self, batch_id: &BatchId) -> QueueResult<Option<Batch>> {
        retry_store(&self.read_retry, || self.store.batch(batch_id)).await
    }

    /// Read-only snapshot of the batch, retried while the store is unreachable.
    pub async fn get_status(&self, batch_id: &BatchId) -> QueueResult<BatchStatus> {
        retry_store(&self.read_retry, || self.store.status(batch_id)).await
    }

    /// Dead-lettered combinations needing manual intervention.
    pub async fn dead_letters(&self, batch_id: &BatchId) -> QueueResult<Vec<DeadLetter>> {
        retry_store(&self.read_retry, || self.store.dead_letters(batch_id)).await
    }

    /// Move every expired lease back to pending, or to the dead-letter set.
    pub async fn requeue_expired_leases(&self, batch_id: &BatchId) -> QueueResult<SweepReport> {
        let mut report = SweepReport::default();
        loop {
            let round = retry_store(&self.read_retry, || {
                self.store.requeue_expired(
                    batch_id,
                    self.config.max_attempts,
                    self.config.sweep_batch_size,
                )
            })
            .await?;
            report.merge(round);

            if (round.total() as usize) < self.config.sweep_batch_size {
                break;
            }
        }

        if report.total() > 0 {
            info!(
                batch_id = %batch_id,
                requeued = report.requeued,
                dead_lettered = report.dead_lettered,
                "Requeued expired leases"
            );
        }
        Ok(report)
    }

    /// Claim one pending combination for `worker_id`.
    pub async fn claim(
        &self,
        batch_id: &BatchId,
        worker_id: &WorkerId,
    ) -> QueueResult<Option<ClaimedCombination>> {
        self.store
            .claim(batch_id, worker_id, self.config.lease_duration)
            .await
    }

    /// Extend a held lease; `None` means it was lost.
    pub async fn renew(&self, lease: &Lease) -> QueueResult<Option<Lease>> {
        self.store.renew(lease, self.config.lease_duration).await
    }

    /// Report a failed render or upload for a held combination.
    pub async fn release(&self, lease: &Lease, reason: &str) -> QueueResult<ReleaseOutcome> {
        let outcome = self
            .store
            .release(lease, reason, self.config.max_attempts)
            .await?;

        match outcome {
            ReleaseOutcome::Requeued { attempt_count } => debug!(
                batch_id = %lease.batch_id,
                combination_id = %lease.combination_id,
                attempt_count,
                "Released combination back to pending"
            ),
            ReleaseOutcome::DeadLettered { attempt_count } => warn!(
                batch_id = %lease.batch_id,
                combination_id = %lease.combination_id,
                attempt_count,
                reason,
                "Combination dead-lettered"
            ),
            ReleaseOutcome::LeaseLost => debug!(
                batch_id = %lease.batch_id,
                combination_id = %lease.combination_id,
                "Release rejected, lease no longer held"
            ),
        }
        Ok(outcome)
    }

    /// Report success for a held combination.
    pub async fn acknowledge(&self, lease: &Lease) -> QueueResult<AckOutcome> {
        self.store.acknowledge(lease).await
    }

    /// Poll until the batch drains or `deadline` passes, sweeping expired
    /// leases on every poll. Returns the last observed status.
    pub async fn wait_for_completion(
        &self,
        batch_id: &BatchId,
        deadline: Duration,
        poll_interval: Duration,
    ) -> QueueResult<BatchStatus> {
        let deadline = tokio::time::Instant::now() + deadline;

        loop {
            if let Err(e) = self.requeue_expired_leases(batch_id).await {
                warn!(batch_id = %batch_id, "Sweep failed while waiting: {}", e);
            }

            let status = self.get_status(batch_id).await?;
            if status.state == BatchState::Invalid || status.is_drained() {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    batch_id = %batch_id,
                    pending = status.pending,
                    in_progress = status.in_progress,
                    "Deadline reached before batch drained"
                );
                return Ok(status);
            }

            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ManualClock, MemoryStore};
    use crate::store::Disposition;
    use async_trait::async_trait;
    use simian_models::{CombinationId, Parameters};

    fn combinations(n: usize) -> Vec<Combination> {
        (0..n)
            .map(|i| Combination::new(CombinationId::from_index(i), Parameters::new()))
            .collect()
    }

    fn manager_with(store: Arc<dyn CoordinationStore>) -> QueueManager {
        let config = QueueConfig {
            seed_chunk_size: 2,
            sweep_batch_size: 2,
            lease_duration: Duration::from_secs(60),
            ..Default::default()
        };
        QueueManager::new(store, config)
            .unwrap()
            .with_read_retry(RetryConfig::new("test").with_base_delay(Duration::from_millis(1)))
    }

    #[test]
    fn test_config_validation() {
        assert!(QueueConfig::default().validate().is_ok());

        let zero_attempts = QueueConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(zero_attempts.validate().is_err());

        let zero_lease = QueueConfig {
            lease_duration: Duration::ZERO,
            ..Default::default()
        };
        assert!(zero_lease.validate().is_err());
    }

    #[test]
    fn test_dead_letter_policy() {
        let policy = DeadLetterPolicy::new(3);
        let mut combination = Combination::new("1", Parameters::new());

        assert_eq!(policy.decide(&combination), Disposition::Requeue { attempt_count: 1 });
        combination.attempt_count = 2;
        assert_eq!(policy.decide(&combination), Disposition::Requeue { attempt_count: 3 });
        combination.attempt_count = 3;
        assert_eq!(policy.decide(&combination), Disposition::DeadLetter { attempt_count: 4 });

        assert!(!policy.is_exhausted(3));
        assert!(policy.is_exhausted(4));
    }

    #[tokio::test]
    async fn test_start_batch_seeds_in_chunks() {
        let manager = manager_with(Arc::new(MemoryStore::new()));
        let batch = manager
            .start_batch(Some(BatchId::from("b1")), combinations(5))
            .await
            .unwrap();

        assert_eq!(batch.total_count, 5);
        let status = manager.get_status(&batch.batch_id).await.unwrap();
        assert_eq!(status.pending, 5);
        assert_eq!(status.state, BatchState::Ready);
        assert!(status.is_conserved());
    }

    #[tokio::test]
    async fn test_start_batch_rejects_existing_id() {
        let manager = manager_with(Arc::new(MemoryStore::new()));
        manager
            .start_batch(Some(BatchId::from("b1")), combinations(1))
            .await
            .unwrap();

        let err = manager
            .start_batch(Some(BatchId::from("b1")), combinations(3))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::BatchExists(_)));

        let status = manager.get_status(&BatchId::from("b1")).await.unwrap();
        assert_eq!(status.total, 1);
    }

    /// Store whose seeding fails after the first chunk.
    struct FlakySeedStore {
        inner: MemoryStore,
        seeds: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl CoordinationStore for FlakySeedStore {
        async fn create_batch(&self, batch: &Batch) -> QueueResult<bool> {
            self.inner.create_batch(batch).await
        }
        async fn seed(&self, batch_id: &BatchId, combinations: &[Combination]) -> QueueResult<()> {
            if self.seeds.fetch_add(1, std::sync::atomic::Ordering::SeqCst) >= 1 {
                return Err(QueueError::store_unavailable("connection reset"));
            }
            self.inner.seed(batch_id, combinations).await
        }
        async fn mark_ready(&self, batch_id: &BatchId) -> QueueResult<()> {
            self.inner.mark_ready(batch_id).await
        }
        async fn invalidate(&self, batch_id: &BatchId) -> QueueResult<()> {
            self.inner.invalidate(batch_id).await
        }
        async fn batch(&self, batch_id: &BatchId) -> QueueResult<Option<Batch>> {
            self.inner.batch(batch_id).await
        }
        async fn claim(
            &self,
            batch_id: &BatchId,
            worker_id: &WorkerId,
            lease_duration: Duration,
        ) -> QueueResult<Option<ClaimedCombination>> {
            self.inner.claim(batch_id, worker_id, lease_duration).await
        }
        async fn renew(&self, lease: &Lease, lease_duration: Duration) -> QueueResult<Option<Lease>> {
            self.inner.renew(lease, lease_duration).await
        }
        async fn release(&self, lease: &Lease, reason: &str, max_attempts: u32) -> QueueResult<ReleaseOutcome> {
            self.inner.release(lease, reason, max_attempts).await
        }
        async fn acknowledge(&self, lease: &Lease) -> QueueResult<AckOutcome> {
            self.inner.acknowledge(lease).await
        }
        async fn requeue_expired(
            &self,
            batch_id: &BatchId,
            max_attempts: u32,
            limit: usize,
        ) -> QueueResult<SweepReport> {
            self.inner.requeue_expired(batch_id, max_attempts, limit).await
        }
        async fn status(&self, batch_id: &BatchId) -> QueueResult<BatchStatus> {
            self.inner.status(batch_id).await
        }
        async fn dead_letters(&self, batch_id: &BatchId) -> QueueResult<Vec<DeadLetter>> {
            self.inner.dead_letters(batch_id).await
        }
    }

    #[tokio::test]
    async fn test_failed_seeding_leaves_nothing_claimable() {
        let store = Arc::new(FlakySeedStore {
            inner: MemoryStore::new(),
            seeds: std::sync::atomic::AtomicU32::new(0),
        });
        let manager = manager_with(store.clone());

        let err = manager
            .start_batch(Some(BatchId::from("b1")), combinations(5))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::BatchInit(_)));

        let batch_id = BatchId::from("b1");
        let worker = WorkerId::from_string("w");
        assert!(manager.claim(&batch_id, &worker).await.unwrap().is_none());

        let status = manager.get_status(&batch_id).await.unwrap();
        assert_eq!(status.state, BatchState::Invalid);
        assert_eq!(status.pending, 0);
    }

    #[tokio::test]
    async fn test_sweep_loops_over_all_expired_leases() {
        let clock = Arc::new(ManualClock::default());
        let manager = manager_with(Arc::new(MemoryStore::with_clock(clock.clone())));
        let batch = manager
            .start_batch(Some(BatchId::from("b1")), combinations(5))
            .await
            .unwrap();
        let worker = WorkerId::from_string("w");

        for _ in 0..5 {
            manager.claim(&batch.batch_id, &worker).await.unwrap().unwrap();
        }
        clock.advance(Duration::from_secs(61));

        // sweep_batch_size is 2, so this takes three store round trips
        let report = manager.requeue_expired_leases(&batch.batch_id).await.unwrap();
        assert_eq!(report.requeued, 5);

        let status = manager.get_status(&batch.batch_id).await.unwrap();
        assert_eq!(status.pending, 5);
        assert_eq!(status.in_progress, 0);
        assert_eq!(status.retried, 5);
    }

    #[tokio::test]
    async fn test_release_applies_retry_budget() {
        let manager = manager_with(Arc::new(MemoryStore::new()));
        let batch = manager
            .start_batch(Some(BatchId::from("b1")), combinations(1))
            .await
            .unwrap();
        let worker = WorkerId::from_string("w");

        let mut outcomes = Vec::new();
        while let Some(claimed) = manager.claim(&batch.batch_id, &worker).await.unwrap() {
            assert!(claimed.combination.attempt_count <= manager.config().max_attempts);
            outcomes.push(manager.release(&claimed.lease, "render crashed").await.unwrap());
        }

        assert_eq!(
            outcomes,
            vec![
                ReleaseOutcome::Requeued { attempt_count: 1 },
                ReleaseOutcome::Requeued { attempt_count: 2 },
                ReleaseOutcome::Requeued { attempt_count: 3 },
                ReleaseOutcome::DeadLettered { attempt_count: 4 },
            ]
        );

        let status = manager.get_status(&batch.batch_id).await.unwrap();
        assert_eq!(status.failed, 1);
        assert_eq!(status.dead_lettered, 1);
        assert!(status.is_drained());

        let letters = manager.dead_letters(&batch.batch_id).await.unwrap();
        assert_eq!(letters[0].reason, "render crashed");
    }

    #[tokio::test]
    async fn test_wait_for_completion_returns_at_deadline() {
        let manager = manager_with(Arc::new(MemoryStore::new()));
        let batch = manager
            .start_batch(Some(BatchId::from("b1")), combinations(2))
            .await
            .unwrap();

        let status = manager
            .wait_for_completion(&batch.batch_id, Duration::from_millis(20), Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(status.pending, 2);
        assert!(!status.is_drained());
    }
}
