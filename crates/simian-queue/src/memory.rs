//! In-process coordination store.
//!
//! Mirrors the Redis store's semantics with every operation executed under a
//! single mutex. Used for local single-process runs and for tests, where a
//! [`ManualClock`] makes lease expiry deterministic.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use simian_models::{
    new_lease_id, Batch, BatchId, BatchState, BatchStatus, ClaimedCombination, Combination,
    CombinationId, DeadLetter, Lease, WorkerId,
};

use crate::error::{QueueError, QueueResult};
use crate::store::{AckOutcome, CoordinationStore, DeadLetterPolicy, ReleaseOutcome, SweepReport};

/// Time source for lease arithmetic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now_ms: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let ms = self.now_ms.load(Ordering::SeqCst);
        DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
    }
}

struct ActiveLease {
    owner: (WorkerId, String),
    expires_at: DateTime<Utc>,
}

struct DeadEntry {
    reason: String,
    at: DateTime<Utc>,
}

struct BatchEntry {
    batch: Batch,
    state: BatchState,
    pending: VecDeque<CombinationId>,
    combinations: HashMap<CombinationId, Combination>,
    leases: HashMap<CombinationId, ActiveLease>,
    dead: BTreeMap<CombinationId, DeadEntry>,
    completed_count: u64,
    failed_count: u64,
    dead_count: u64,
    retried_count: u64,
}

impl BatchEntry {
    fn new(batch: Batch) -> Self {
        Self {
            batch,
            state: BatchState::Seeding,
            pending: VecDeque::new(),
            combinations: HashMap::new(),
            leases: HashMap::new(),
            dead: BTreeMap::new(),
            completed_count: 0,
            failed_count: 0,
            dead_count: 0,
            retried_count: 0,
        }
    }

    fn owns(&self, lease: &Lease, now: DateTime<Utc>) -> bool {
        match self.leases.get(&lease.combination_id) {
            Some(active) => {
                active.owner.0 == lease.worker_id
                    && active.owner.1 == lease.lease_id
                    && active.expires_at > now
            }
            None => false,
        }
    }

    /// Bump the attempt count and either requeue or dead-letter.
    fn requeue_or_dead_letter(
        &mut self,
        id: &CombinationId,
        reason: &str,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> ReleaseOutcome {
        let attempt_count = match self.combinations.get_mut(id) {
            Some(combination) => {
                combination.attempt_count += 1;
                combination.attempt_count
            }
            None => return ReleaseOutcome::LeaseLost,
        };

        if DeadLetterPolicy::new(max_attempts).is_exhausted(attempt_count) {
            self.dead.insert(
                id.clone(),
                DeadEntry {
                    reason: reason.to_string(),
                    at: now,
                },
            );
            self.failed_count += 1;
            self.dead_count += 1;
            ReleaseOutcome::DeadLettered { attempt_count }
        } else {
            self.pending.push_back(id.clone());
            self.retried_count += 1;
            ReleaseOutcome::Requeued { attempt_count }
        }
    }
}

/// Coordination store held in process memory.
pub struct MemoryStore {
    batches: Mutex<HashMap<BatchId, BatchEntry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            batches: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Active lease holders, for invariant checks.
    pub async fn lease_holders(&self, batch_id: &BatchId) -> Vec<(CombinationId, WorkerId)> {
        let batches = self.batches.lock().await;
        batches
            .get(batch_id)
            .map(|entry| {
                entry
                    .leases
                    .iter()
                    .map(|(id, lease)| (id.clone(), lease.owner.0.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis() as i64)
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn create_batch(&self, batch: &Batch) -> QueueResult<bool> {
        let mut batches = self.batches.lock().await;
        if batches.contains_key(&batch.batch_id) {
            return Ok(false);
        }
        batches.insert(batch.batch_id.clone(), BatchEntry::new(batch.clone()));
        Ok(true)
    }

    async fn seed(&self, batch_id: &BatchId, combinations: &[Combination]) -> QueueResult<()> {
        let mut batches = self.batches.lock().await;
        let entry = batches
            .get_mut(batch_id)
            .ok_or_else(|| QueueError::BatchNotFound(batch_id.clone()))?;

        if entry.state != BatchState::Seeding {
            return Err(QueueError::batch_init(format!("batch {} is no longer seeding", batch_id)));
        }

        for combination in combinations {
            let mut stored = combination.clone();
            stored.attempt_count = 0;
            entry.pending.push_back(stored.id.clone());
            entry.combinations.insert(stored.id.clone(), stored);
        }
        Ok(())
    }

    async fn mark_ready(&self, batch_id: &BatchId) -> QueueResult<()> {
        let mut batches = self.batches.lock().await;
        let entry = batches
            .get_mut(batch_id)
            .ok_or_else(|| QueueError::BatchNotFound(batch_id.clone()))?;

        if entry.state != BatchState::Seeding {
            return Err(QueueError::batch_init(format!("batch {} is not seeding", batch_id)));
        }
        if entry.pending.len() as u64 != entry.batch.total_count {
            return Err(QueueError::batch_init(format!(
                "batch {} pending count does not match total_count",
                batch_id
            )));
        }
        entry.state = BatchState::Ready;
        Ok(())
    }

    async fn invalidate(&self, batch_id: &BatchId) -> QueueResult<()> {
        let mut batches = self.batches.lock().await;
        if let Some(entry) = batches.get_mut(batch_id) {
            let batch = entry.batch.clone();
            *entry = BatchEntry::new(batch);
            entry.state = BatchState::Invalid;
        }
        Ok(())
    }

    async fn batch(&self, batch_id: &BatchId) -> QueueResult<Option<Batch>> {
        let batches = self.batches.lock().await;
        Ok(batches.get(batch_id).map(|entry| entry.batch.clone()))
    }

    async fn claim(
        &self,
        batch_id: &BatchId,
        worker_id: &WorkerId,
        lease_duration: Duration,
    ) -> QueueResult<Option<ClaimedCombination>> {
        let now = self.clock.now();
        let mut batches = self.batches.lock().await;
        let Some(entry) = batches.get_mut(batch_id) else {
            return Ok(None);
        };
        if entry.state != BatchState::Ready {
            return Ok(None);
        }
        let Some(id) = entry.pending.pop_front() else {
            return Ok(None);
        };

        let combination = entry
            .combinations
            .get(&id)
            .cloned()
            .ok_or_else(|| QueueError::corrupt(format!("pending id {} has no payload", id)))?;

        let lease = Lease {
            batch_id: batch_id.clone(),
            combination_id: id.clone(),
            worker_id: worker_id.clone(),
            lease_id: new_lease_id(),
            acquired_at: now,
            expires_at: now + chrono_duration(lease_duration),
        };
        entry.leases.insert(
            id,
            ActiveLease {
                owner: (worker_id.clone(), lease.lease_id.clone()),
                expires_at: lease.expires_at,
            },
        );

        Ok(Some(ClaimedCombination { combination, lease }))
    }

    async fn renew(&self, lease: &Lease, lease_duration: Duration) -> QueueResult<Option<Lease>> {
        let now = self.clock.now();
        let mut batches = self.batches.lock().await;
        let Some(entry) = batches.get_mut(&lease.batch_id) else {
            return Ok(None);
        };
        if !entry.owns(lease, now) {
            return Ok(None);
        }

        let expires_at = now + chrono_duration(lease_duration);
        if let Some(active) = entry.leases.get_mut(&lease.combination_id) {
            active.expires_at = expires_at;
        }

        let mut renewed = lease.clone();
        renewed.expires_at = expires_at;
        Ok(Some(renewed))
    }

    async fn release(&self, lease: &Lease, reason: &str, max_attempts: u32) -> QueueResult<ReleaseOutcome> {
        let now = self.clock.now();
        let mut batches = self.batches.lock().await;
        let Some(entry) = batches.get_mut(&lease.batch_id) else {
            return Ok(ReleaseOutcome::LeaseLost);
        };
        if !entry.owns(lease, now) {
            return Ok(ReleaseOutcome::LeaseLost);
        }

        entry.leases.remove(&lease.combination_id);
        Ok(entry.requeue_or_dead_letter(&lease.combination_id, reason, max_attempts, now))
    }

    async fn acknowledge(&self, lease: &Lease) -> QueueResult<AckOutcome> {
        let now = self.clock.now();
        let mut batches = self.batches.lock().await;
        let Some(entry) = batches.get_mut(&lease.batch_id) else {
            return Ok(AckOutcome::LeaseLost);
        };
        if !entry.owns(lease, now) {
            return Ok(AckOutcome::LeaseLost);
        }

        entry.leases.remove(&lease.combination_id);
        entry.combinations.remove(&lease.combination_id);
        entry.completed_count += 1;
        Ok(AckOutcome::Acknowledged)
    }

    async fn requeue_expired(
        &self,
        batch_id: &BatchId,
        max_attempts: u32,
        limit: usize,
    ) -> QueueResult<SweepReport> {
        let now = self.clock.now();
        let mut batches = self.batches.lock().await;
        let Some(entry) = batches.get_mut(batch_id) else {
            return Err(QueueError::BatchNotFound(batch_id.clone()));
        };

        let mut expired: Vec<(DateTime<Utc>, CombinationId)> = entry
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, lease)| (lease.expires_at, id.clone()))
            .collect();
        expired.sort();
        expired.truncate(limit);

        let mut report = SweepReport::default();
        for (_, id) in expired {
            entry.leases.remove(&id);
            match entry.requeue_or_dead_letter(&id, "lease expired", max_attempts, now) {
                ReleaseOutcome::Requeued { .. } => report.requeued += 1,
                ReleaseOutcome::DeadLettered { .. } => report.dead_lettered += 1,
                ReleaseOutcome::LeaseLost => {}
            }
        }
        Ok(report)
    }

    async fn status(&self, batch_id: &BatchId) -> QueueResult<BatchStatus> {
        let batches = self.batches.lock().await;
        let entry = batches
            .get(batch_id)
            .ok_or_else(|| QueueError::BatchNotFound(batch_id.clone()))?;

        Ok(BatchStatus {
            total: entry.batch.total_count,
            pending: entry.pending.len() as u64,
            in_progress: entry.leases.len() as u64,
            completed: entry.completed_count,
            failed: entry.failed_count,
            dead_lettered: entry.dead_count,
            retried: entry.retried_count,
            state: entry.state,
        })
    }

    async fn dead_letters(&self, batch_id: &BatchId) -> QueueResult<Vec<DeadLetter>> {
        let batches = self.batches.lock().await;
        let entry = batches
            .get(batch_id)
            .ok_or_else(|| QueueError::BatchNotFound(batch_id.clone()))?;

        Ok(entry
            .dead
            .iter()
            .filter_map(|(id, dead)| {
                entry.combinations.get(id).map(|combination| DeadLetter {
                    combination: combination.clone(),
                    reason: dead.reason.clone(),
                    dead_lettered_at: dead.at,
                })
            })
            .collect())
    }
}
