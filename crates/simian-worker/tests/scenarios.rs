//! End-to-end worker scenarios against the in-process store.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use simian_models::{
    Batch, BatchId, BatchStatus, ClaimedCombination, Combination, CombinationId, DeadLetter, Lease,
    Parameters, WorkerId,
};
use simian_queue::{
    AckOutcome, CoordinationStore, ManualClock, MemoryStore, QueueConfig, QueueError, QueueManager,
    QueueResult, ReleaseOutcome, SweepReport,
};
use simian_render::{RenderEngine, RenderError, RenderResult};
use simian_storage::LocalDirSink;
use simian_worker::{WorkerAgent, WorkerConfig};

/// Engine that writes a tiny artifact and records every call.
#[derive(Default)]
struct RecordingEngine {
    /// Combination ids that always fail
    failing: HashSet<String>,
    /// Combination ids whose parameters the engine always rejects
    invalid: HashSet<String>,
    /// Attempt counts observed per combination id
    calls: Mutex<HashMap<String, Vec<u32>>>,
    /// Ids currently being rendered
    active: Mutex<HashSet<String>>,
    /// Set if two renders of one id ever overlapped
    overlapped: Mutex<bool>,
    delay: Duration,
}

impl RecordingEngine {
    fn failing(ids: &[&str]) -> Self {
        Self {
            failing: ids.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn rejecting(ids: &[&str]) -> Self {
        Self {
            invalid: ids.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn attempts(&self, id: &str) -> Vec<u32> {
        self.calls.lock().unwrap().get(id).cloned().unwrap_or_default()
    }

    fn rendered_ids(&self) -> HashSet<String> {
        self.calls.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl RenderEngine for RecordingEngine {
    async fn render(&self, combination: &Combination, output_dir: &Path) -> RenderResult<PathBuf> {
        let id = combination.id.to_string();
        self.calls
            .lock()
            .unwrap()
            .entry(id.clone())
            .or_default()
            .push(combination.attempt_count);
        if !self.active.lock().unwrap().insert(id.clone()) {
            *self.overlapped.lock().unwrap() = true;
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.lock().unwrap().remove(&id);

        if self.failing.contains(&id) {
            return Err(RenderError::failed("renderer crashed", None, Some(1)));
        }
        if self.invalid.contains(&id) {
            return Err(RenderError::invalid_parameters("unknown camera preset"));
        }

        tokio::fs::create_dir_all(output_dir).await?;
        let output = output_dir.join(format!("{}.mp4", id));
        tokio::fs::write(&output, format!("video {}", id)).await?;
        Ok(output)
    }
}

fn combinations(ids: &[&str]) -> Vec<Combination> {
    ids.iter()
        .map(|id| Combination::new(*id, Parameters::new()))
        .collect()
}

fn queue_config(lease: Duration) -> QueueConfig {
    QueueConfig {
        lease_duration: lease,
        max_attempts: 3,
        ..Default::default()
    }
}

fn worker_config(work_dir: &Path, slots: usize, renew: Duration, sweep: Duration) -> WorkerConfig {
    WorkerConfig {
        slots,
        lease_renew_interval: renew,
        claim_backoff_min: Duration::from_millis(5),
        claim_backoff_max: Duration::from_millis(20),
        sweep_interval: sweep,
        shutdown_timeout: Duration::from_secs(5),
        work_dir: work_dir.to_path_buf(),
        ..Default::default()
    }
}

async fn run_agent(
    manager: QueueManager,
    engine: Arc<dyn RenderEngine>,
    sink: Arc<LocalDirSink>,
    config: WorkerConfig,
    batch_id: BatchId,
) -> simian_worker::WorkerSummary {
    let agent = WorkerAgent::new(config, manager, engine, sink).unwrap();
    tokio::time::timeout(Duration::from_secs(20), agent.run(&batch_id))
        .await
        .expect("worker did not drain the batch")
        .unwrap()
}

/// A worker dies holding a combination; the survivor finishes the batch
/// after the lease expires and the sweep requeues it.
#[tokio::test]
async fn test_crashed_worker_combination_is_recovered() {
    let work = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    let manager = QueueManager::new(
        Arc::new(MemoryStore::new()),
        queue_config(Duration::from_millis(300)),
    )
    .unwrap();
    let batch = manager
        .start_batch(Some(BatchId::from("crash")), combinations(&["3", "1", "2", "4", "5"]))
        .await
        .unwrap();

    // Worker A claims #3 and is never heard from again
    let crashed = manager
        .claim(&batch.batch_id, &WorkerId::from_string("worker-a"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(crashed.combination.id.as_str(), "3");

    let engine = Arc::new(RecordingEngine::default());
    let sink = Arc::new(LocalDirSink::new(store_dir.path()));
    let summary = run_agent(
        manager.clone(),
        engine.clone(),
        sink,
        worker_config(work.path(), 1, Duration::from_millis(100), Duration::from_millis(50)),
        batch.batch_id.clone(),
    )
    .await;

    assert_eq!(summary.completed, 5);
    assert_eq!(engine.attempts("3"), vec![1]);

    let status = manager.get_status(&batch.batch_id).await.unwrap();
    assert_eq!(status.completed, 5);
    assert_eq!(status.dead_lettered, 0);
    assert_eq!(status.pending, 0);
    assert_eq!(status.in_progress, 0);
    assert!(status.is_conserved());

    // Worker A's stale lease cannot be acknowledged after the fact
    assert_eq!(
        manager.acknowledge(&crashed.lease).await.unwrap(),
        AckOutcome::LeaseLost
    );
    assert_eq!(manager.get_status(&batch.batch_id).await.unwrap().completed, 5);

    for id in ["1", "2", "3", "4", "5"] {
        let artifact = store_dir.path().join(format!("renders/crash/{}.mp4", id));
        assert!(artifact.exists(), "missing artifact for {}", id);
    }
}

/// A combination whose render always fails is retried `max_attempts` times
/// after its first render and then dead-lettered; everything else completes.
#[tokio::test]
async fn test_always_failing_render_is_dead_lettered() {
    let work = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    let manager = QueueManager::new(
        Arc::new(MemoryStore::new()),
        queue_config(Duration::from_secs(30)),
    )
    .unwrap();
    let ids = ["a", "b", "c", "d"];
    let batch = manager
        .start_batch(Some(BatchId::from("failing")), combinations(&ids))
        .await
        .unwrap();

    let engine = Arc::new(RecordingEngine::failing(&["c"]));
    let summary = run_agent(
        manager.clone(),
        engine.clone(),
        Arc::new(LocalDirSink::new(store_dir.path())),
        worker_config(work.path(), 2, Duration::from_secs(5), Duration::from_secs(3600)),
        batch.batch_id.clone(),
    )
    .await;

    assert_eq!(engine.attempts("c"), vec![0, 1, 2, 3]);
    assert_eq!(summary.dead_lettered, 1);
    assert_eq!(summary.requeued, 3);

    let status = manager.get_status(&batch.batch_id).await.unwrap();
    assert_eq!(status.failed, 1);
    assert_eq!(status.dead_lettered, 1);
    assert_eq!(status.completed, ids.len() as u64 - 1);
    assert!(status.is_conserved());

    let letters = manager.dead_letters(&batch.batch_id).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].combination.id, CombinationId::from("c"));
    assert_eq!(letters[0].combination.attempt_count, 4);
    assert!(letters[0].reason.contains("renderer crashed"));
}

/// Rejected parameters spend attempts like any other render error.
#[tokio::test]
async fn test_rejected_parameters_use_the_full_retry_budget() {
    let work = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    let manager = QueueManager::new(
        Arc::new(MemoryStore::new()),
        queue_config(Duration::from_secs(30)),
    )
    .unwrap();
    let batch = manager
        .start_batch(Some(BatchId::from("rejected")), combinations(&["a", "b"]))
        .await
        .unwrap();

    let engine = Arc::new(RecordingEngine::rejecting(&["b"]));
    let summary = run_agent(
        manager.clone(),
        engine.clone(),
        Arc::new(LocalDirSink::new(store_dir.path())),
        worker_config(work.path(), 1, Duration::from_secs(5), Duration::from_secs(3600)),
        batch.batch_id.clone(),
    )
    .await;

    assert_eq!(engine.attempts("b"), vec![0, 1, 2, 3]);
    assert_eq!(summary.requeued, 3);
    assert_eq!(summary.dead_lettered, 1);

    let letters = manager.dead_letters(&batch.batch_id).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].combination.attempt_count, 4);
    assert!(letters[0].reason.contains("unknown camera preset"));

    let status = manager.get_status(&batch.batch_id).await.unwrap();
    assert_eq!(status.completed, 1);
    assert!(status.is_conserved());
}

/// Store whose first claim leases a combination and then reports a
/// corrupt reply, as if the response were lost after the pop.
struct GarbledClaimStore {
    inner: MemoryStore,
    garbled: AtomicBool,
}

#[async_trait]
impl CoordinationStore for GarbledClaimStore {
    async fn create_batch(&self, batch: &Batch) -> QueueResult<bool> {
        self.inner.create_batch(batch).await
    }
    async fn seed(&self, batch_id: &BatchId, combinations: &[Combination]) -> QueueResult<()> {
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
        let claimed = self.inner.claim(batch_id, worker_id, lease_duration).await?;
        if claimed.is_some() && !self.garbled.swap(true, Ordering::SeqCst) {
            return Err(QueueError::corrupt("unreadable claim reply"));
        }
        Ok(claimed)
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

/// A failed claim keeps the worker running; the orphaned lease expires and
/// the sweep hands the combination back.
#[tokio::test]
async fn test_claim_error_does_not_stop_the_worker() {
    let work = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    let store = Arc::new(GarbledClaimStore {
        inner: MemoryStore::new(),
        garbled: AtomicBool::new(false),
    });
    let manager = QueueManager::new(store, queue_config(Duration::from_millis(300))).unwrap();
    let batch = manager
        .start_batch(Some(BatchId::from("garbled")), combinations(&["1", "2", "3"]))
        .await
        .unwrap();

    let engine = Arc::new(RecordingEngine::default());
    let summary = run_agent(
        manager.clone(),
        engine.clone(),
        Arc::new(LocalDirSink::new(store_dir.path())),
        worker_config(work.path(), 1, Duration::from_millis(100), Duration::from_millis(50)),
        batch.batch_id.clone(),
    )
    .await;

    assert_eq!(summary.completed, 3);
    assert_eq!(engine.attempts("1"), vec![1]);
    assert_eq!(engine.attempts("2"), vec![0]);

    let status = manager.get_status(&batch.batch_id).await.unwrap();
    assert!(status.is_fully_completed());
    assert_eq!(status.dead_lettered, 0);
}

/// Engine that lets the lease lapse and be swept mid-render on the first
/// attempt, then renders normally.
struct LeaseLosingEngine {
    manager: QueueManager,
    clock: Arc<ManualClock>,
    inner: RecordingEngine,
}

#[async_trait]
impl RenderEngine for LeaseLosingEngine {
    async fn render(&self, combination: &Combination, output_dir: &Path) -> RenderResult<PathBuf> {
        if combination.attempt_count == 0 {
            self.clock.advance(Duration::from_secs(120));
            let batch_id = BatchId::from("stale");
            self.manager
                .requeue_expired_leases(&batch_id)
                .await
                .expect("sweep");
        }
        self.inner.render(combination, output_dir).await
    }
}

/// A worker whose lease expired while rendering cannot acknowledge; the
/// combination is completed exactly once by the next claim.
#[tokio::test]
async fn test_stale_acknowledgment_is_rejected() {
    let work = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::default());
    let manager = QueueManager::new(
        Arc::new(MemoryStore::with_clock(clock.clone())),
        queue_config(Duration::from_secs(60)),
    )
    .unwrap();
    let batch = manager
        .start_batch(Some(BatchId::from("stale")), combinations(&["only"]))
        .await
        .unwrap();

    let engine = Arc::new(LeaseLosingEngine {
        manager: manager.clone(),
        clock,
        inner: RecordingEngine::default(),
    });
    let summary = run_agent(
        manager.clone(),
        engine.clone(),
        Arc::new(LocalDirSink::new(store_dir.path())),
        worker_config(work.path(), 1, Duration::from_secs(30), Duration::from_secs(3600)),
        batch.batch_id.clone(),
    )
    .await;

    assert_eq!(summary.abandoned, 1);
    assert_eq!(summary.completed, 1);
    assert_eq!(engine.inner.attempts("only"), vec![0, 1]);

    let status = manager.get_status(&batch.batch_id).await.unwrap();
    assert_eq!(status.completed, 1);
    assert_eq!(status.retried, 1);
    assert!(status.is_conserved());
}

/// Several agents with several slots never render one combination twice.
#[tokio::test]
async fn test_leases_are_mutually_exclusive() {
    let work = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    let manager = QueueManager::new(
        Arc::new(MemoryStore::new()),
        queue_config(Duration::from_secs(30)),
    )
    .unwrap();
    let ids: Vec<String> = (0..24).map(|i| i.to_string()).collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let batch = manager
        .start_batch(Some(BatchId::from("exclusive")), combinations(&id_refs))
        .await
        .unwrap();

    let engine = Arc::new(RecordingEngine::with_delay(Duration::from_millis(5)));
    let sink = Arc::new(LocalDirSink::new(store_dir.path()));

    let mut handles = Vec::new();
    for n in 0..3 {
        let config = worker_config(
            &work.path().join(format!("agent-{}", n)),
            2,
            Duration::from_secs(5),
            Duration::from_secs(3600),
        );
        handles.push(tokio::spawn(run_agent(
            manager.clone(),
            engine.clone(),
            sink.clone(),
            config,
            batch.batch_id.clone(),
        )));
    }

    let mut completed = 0;
    for handle in handles {
        completed += handle.await.unwrap().completed;
    }

    assert_eq!(completed, 24);
    assert!(!*engine.overlapped.lock().unwrap());
    assert_eq!(engine.rendered_ids().len(), 24);
    for id in &ids {
        assert_eq!(engine.attempts(id), vec![0], "combination {} rendered more than once", id);
    }

    let status = manager.get_status(&batch.batch_id).await.unwrap();
    assert!(status.is_fully_completed());
}

/// Shutdown stops new claims and lets the agent return.
#[tokio::test]
async fn test_shutdown_stops_claiming() {
    let work = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    let manager = QueueManager::new(
        Arc::new(MemoryStore::new()),
        queue_config(Duration::from_secs(30)),
    )
    .unwrap();
    let batch = manager
        .start_batch(Some(BatchId::from("shutdown")), combinations(&["1", "2", "3"]))
        .await
        .unwrap();

    let agent = WorkerAgent::new(
        worker_config(work.path(), 1, Duration::from_secs(5), Duration::from_secs(3600)),
        manager.clone(),
        Arc::new(RecordingEngine::default()),
        Arc::new(LocalDirSink::new(store_dir.path())),
    )
    .unwrap();
    agent.shutdown();

    let summary = tokio::time::timeout(Duration::from_secs(5), agent.run(&batch.batch_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.cycles(), 0);

    let status = manager.get_status(&batch.batch_id).await.unwrap();
    assert_eq!(status.pending, 3);
}
