//! Worker agent.
//!
//! Each slot loops claim → render → upload → acknowledge until the batch
//! drains or shutdown is signalled. Slots share nothing but the queue
//! manager; each holds at most one lease at a time.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

use simian_models::{
    destination_key, BatchId, BatchState, ClaimedCombination, Combination, Lease, WorkerId,
};
use simian_queue::{
    retry_store, AckOutcome, FailureTracker, QueueError, QueueManager, ReleaseOutcome,
    RetryConfig,
};
use simian_render::RenderEngine;
use simian_storage::UploadSink;

use crate::config::WorkerConfig;
use crate::error::{CycleFailure, WorkerResult};
use crate::heartbeat::LeaseHeartbeat;
use crate::logging::CycleLogger;
use crate::metrics;

/// How one claimed combination ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Acknowledged; counted as completed
    Completed,
    /// Released back to pending
    Requeued { attempt_count: u32 },
    /// Retry budget exhausted
    DeadLettered { attempt_count: u32 },
    /// Lease lost; result discarded without touching the store
    Abandoned,
    /// Failure could not be reported; lease expiry will recover it
    Unreported,
}

impl CycleOutcome {
    fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Completed => "completed",
            CycleOutcome::Requeued { .. } => "requeued",
            CycleOutcome::DeadLettered { .. } => "dead_lettered",
            CycleOutcome::Abandoned => "abandoned",
            CycleOutcome::Unreported => "unreported",
        }
    }
}

/// Per-process tally of cycle outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub completed: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub abandoned: u64,
    pub unreported: u64,
}

impl WorkerSummary {
    fn record(&mut self, outcome: CycleOutcome) {
        match outcome {
            CycleOutcome::Completed => self.completed += 1,
            CycleOutcome::Requeued { .. } => self.requeued += 1,
            CycleOutcome::DeadLettered { .. } => self.dead_lettered += 1,
            CycleOutcome::Abandoned => self.abandoned += 1,
            CycleOutcome::Unreported => self.unreported += 1,
        }
    }

    fn merge(&mut self, other: WorkerSummary) {
        self.completed += other.completed;
        self.requeued += other.requeued;
        self.dead_lettered += other.dead_lettered;
        self.abandoned += other.abandoned;
        self.unreported += other.unreported;
    }

    pub fn cycles(&self) -> u64 {
        self.completed + self.requeued + self.dead_lettered + self.abandoned + self.unreported
    }
}

/// Everything a slot needs, shared across slots.
struct SlotContext {
    config: WorkerConfig,
    manager: QueueManager,
    engine: Arc<dyn RenderEngine>,
    sink: Arc<dyn UploadSink>,
    batch_id: BatchId,
    claim_retry: RetryConfig,
}

/// Worker agent that drains one batch.
pub struct WorkerAgent {
    config: WorkerConfig,
    manager: QueueManager,
    engine: Arc<dyn RenderEngine>,
    sink: Arc<dyn UploadSink>,
    worker_id: WorkerId,
    shutdown: watch::Sender<bool>,
}

impl WorkerAgent {
    /// Create a new agent.
    pub fn new(
        config: WorkerConfig,
        manager: QueueManager,
        engine: Arc<dyn RenderEngine>,
        sink: Arc<dyn UploadSink>,
    ) -> WorkerResult<Self> {
        config.validate(manager.config())?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            manager,
            engine,
            sink,
            worker_id: WorkerId::generate(),
            shutdown,
        })
    }

    /// Use a fixed worker id instead of a generated one.
    pub fn with_worker_id(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = worker_id;
        self
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Signal shutdown. Slots stop claiming; in-flight cycles finish.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Subscribe to the shutdown signal.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Drain `batch_id` until nothing is pending or in progress.
    pub async fn run(&self, batch_id: &BatchId) -> WorkerResult<WorkerSummary> {
        info!(
            worker_id = %self.worker_id,
            batch_id = %batch_id,
            slots = self.config.slots,
            "Starting worker agent"
        );

        tokio::fs::create_dir_all(&self.config.work_dir).await?;

        let ctx = Arc::new(SlotContext {
            config: self.config.clone(),
            manager: self.manager.clone(),
            engine: Arc::clone(&self.engine),
            sink: Arc::clone(&self.sink),
            batch_id: batch_id.clone(),
            claim_retry: RetryConfig::new("claim")
                .with_base_delay(self.config.claim_backoff_min)
                .with_max_delay(self.config.claim_backoff_max)
                .with_max_retries(3),
        });

        let sweep_task = tokio::spawn(sweep_loop(Arc::clone(&ctx), self.shutdown.subscribe()));

        let mut slots = JoinSet::new();
        for slot in 0..self.config.slots {
            let worker_id = WorkerId::from_string(format!("{}-{}", self.worker_id, slot));
            slots.spawn(slot_loop(Arc::clone(&ctx), worker_id, self.shutdown.subscribe()));
        }

        let summary = self.join_slots(&mut slots).await;
        sweep_task.abort();

        let summary = summary?;
        info!(
            worker_id = %self.worker_id,
            batch_id = %batch_id,
            completed = summary.completed,
            requeued = summary.requeued,
            dead_lettered = summary.dead_lettered,
            abandoned = summary.abandoned,
            "Worker agent stopped"
        );
        Ok(summary)
    }

    /// Wait for every slot, aborting stragglers once shutdown has been
    /// pending for longer than `shutdown_timeout`.
    async fn join_slots(
        &self,
        slots: &mut JoinSet<WorkerResult<WorkerSummary>>,
    ) -> WorkerResult<WorkerSummary> {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut deadline: Option<tokio::time::Instant> = None;
        let mut aborted = false;
        let mut summary = WorkerSummary::default();
        let mut first_error = None;

        loop {
            let grace = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                joined = slots.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(slot_summary))) => summary.merge(slot_summary),
                    Some(Ok(Err(e))) => {
                        error!(worker_id = %self.worker_id, "Slot failed: {}", e);
                        first_error.get_or_insert(e);
                        self.shutdown();
                    }
                    Some(Err(e)) if e.is_cancelled() => {}
                    Some(Err(e)) => error!(worker_id = %self.worker_id, "Slot panicked: {}", e),
                },
                changed = shutdown_rx.changed(), if deadline.is_none() && !aborted => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, waiting for in-flight cycles");
                        deadline = Some(tokio::time::Instant::now() + self.config.shutdown_timeout);
                    }
                }
                _ = grace, if !aborted => {
                    warn!(
                        "In-flight cycles still running after {:?}, abandoning them to lease expiry",
                        self.config.shutdown_timeout
                    );
                    slots.abort_all();
                    aborted = true;
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}

/// One slot: claim and process until the batch drains or shutdown.
async fn slot_loop(
    ctx: Arc<SlotContext>,
    worker_id: WorkerId,
    mut shutdown_rx: watch::Receiver<bool>,
) -> WorkerResult<WorkerSummary> {
    let mut summary = WorkerSummary::default();

    loop {
        if *shutdown_rx.borrow() {
            debug!(worker_id = %worker_id, "Slot stopping on shutdown");
            break;
        }

        let claimed = retry_store(&ctx.claim_retry, || ctx.manager.claim(&ctx.batch_id, &worker_id)).await;
        match claimed {
            Ok(Some(claimed)) => {
                metrics::record_claim(true);
                let outcome = run_cycle(&ctx, claimed).await;
                metrics::record_cycle(outcome.label());
                summary.record(outcome);
            }
            Ok(None) => {
                metrics::record_claim(false);
                if batch_finished(&ctx).await? {
                    debug!(worker_id = %worker_id, "Batch drained, slot exiting");
                    break;
                }
                if backoff(&ctx.config, &mut shutdown_rx).await {
                    break;
                }
            }
            Err(e) if e.is_unavailable() => {
                metrics::record_claim_error(true);
                warn!(worker_id = %worker_id, "Claim failed, store unavailable: {}", e);
                if backoff(&ctx.config, &mut shutdown_rx).await {
                    break;
                }
            }
            // The claim may already hold a lease; its expiry hands the
            // combination to the next sweep
            Err(e) => {
                metrics::record_claim_error(false);
                error!(worker_id = %worker_id, "Claim failed: {}", e);
                if backoff(&ctx.config, &mut shutdown_rx).await {
                    break;
                }
            }
        }
    }

    Ok(summary)
}

/// Whether nothing is pending or in progress any more.
///
/// A missing batch is an error; a batch still seeding is not finished.
async fn batch_finished(ctx: &SlotContext) -> WorkerResult<bool> {
    match ctx.manager.get_status(&ctx.batch_id).await {
        Ok(status) => Ok(status.state == BatchState::Invalid || status.is_drained()),
        Err(QueueError::BatchNotFound(id)) => Err(QueueError::BatchNotFound(id).into()),
        Err(e) => {
            warn!(batch_id = %ctx.batch_id, "Status read failed: {}", e);
            Ok(false)
        }
    }
}

/// Sleep a random duration within the claim backoff bounds.
///
/// Returns `true` if shutdown was signalled while waiting.
async fn backoff(config: &WorkerConfig, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    let delay = jittered(config.claim_backoff_min, config.claim_backoff_max);
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown_rx.changed() => changed.is_err() || *shutdown_rx.borrow(),
    }
}

/// Uniform random duration in `[min, max]`.
pub fn jittered(min: Duration, max: Duration) -> Duration {
    let lo = min.as_millis() as u64;
    let hi = max.as_millis() as u64;
    if hi <= lo {
        return min;
    }
    Duration::from_millis(rand::rng().random_range(lo..=hi))
}

/// Render, upload and acknowledge one claimed combination.
async fn run_cycle(ctx: &SlotContext, claimed: ClaimedCombination) -> CycleOutcome {
    let ClaimedCombination { combination, lease } = claimed;
    let logger = CycleLogger::new(
        &lease.batch_id,
        &combination.id,
        &lease.worker_id,
        combination.attempt_count,
    );
    logger.log_start("claimed");

    let output_dir = ctx.config.work_dir.join(&lease.lease_id);
    let heartbeat = LeaseHeartbeat::spawn(
        ctx.manager.clone(),
        lease.clone(),
        ctx.config.lease_renew_interval,
    );

    let result = render_and_upload(ctx, &combination, &output_dir, &heartbeat, &logger)
        .instrument(logger.create_span())
        .await;

    let final_state = heartbeat.stop().await;
    cleanup(&output_dir).await;

    let failure = match result {
        Ok(()) if final_state.lost => CycleFailure::LeaseLost,
        Ok(()) => return acknowledge(ctx, &final_state.lease, &logger).await,
        Err(_) if final_state.lost => CycleFailure::LeaseLost,
        Err(failure) => failure,
    };

    report_failure(ctx, &final_state.lease, failure, &logger).await
}

async fn render_and_upload(
    ctx: &SlotContext,
    combination: &Combination,
    output_dir: &Path,
    heartbeat: &LeaseHeartbeat,
    logger: &CycleLogger,
) -> Result<(), CycleFailure> {
    logger.log_progress("rendering");
    let started = Instant::now();
    let artifact = ctx
        .engine
        .render(combination, output_dir)
        .await
        .map_err(|e| CycleFailure::from_render(&e))?;
    metrics::record_render_duration(started.elapsed().as_secs_f64());

    if heartbeat.is_lost() {
        return Err(CycleFailure::LeaseLost);
    }

    logger.log_progress("uploading");
    let key = destination_key(&ctx.config.artifact_prefix, &ctx.batch_id, &combination.id);
    let started = Instant::now();
    let confirmation = ctx
        .sink
        .upload(&artifact, &key)
        .await
        .map_err(|e| CycleFailure::from_upload(&e))?;
    metrics::record_upload_duration(started.elapsed().as_secs_f64());

    debug!(
        key = %confirmation.key,
        bytes = confirmation.bytes,
        sha256 = %confirmation.sha256,
        "Upload confirmed"
    );
    Ok(())
}

async fn acknowledge(ctx: &SlotContext, lease: &Lease, logger: &CycleLogger) -> CycleOutcome {
    logger.log_progress("acknowledging");
    match ctx.manager.acknowledge(lease).await {
        Ok(AckOutcome::Acknowledged) => {
            logger.log_completion("acknowledged");
            CycleOutcome::Completed
        }
        Ok(AckOutcome::LeaseLost) => {
            metrics::record_lease_lost();
            metrics::record_cycle_failure(CycleFailure::LeaseLost.kind());
            logger.log_warning("acknowledgment rejected, lease no longer held; result discarded");
            CycleOutcome::Abandoned
        }
        Err(e) => {
            metrics::record_cycle_failure(CycleFailure::StoreUnavailable(e.to_string()).kind());
            logger.log_error(&format!("acknowledgment failed: {}", e));
            CycleOutcome::Unreported
        }
    }
}

async fn report_failure(
    ctx: &SlotContext,
    lease: &Lease,
    failure: CycleFailure,
    logger: &CycleLogger,
) -> CycleOutcome {
    metrics::record_cycle_failure(failure.kind());

    let reason = failure.to_string();
    let reported = match &failure {
        CycleFailure::LeaseLost => {
            metrics::record_lease_lost();
            logger.log_warning("lease lost, abandoning result");
            return CycleOutcome::Abandoned;
        }
        CycleFailure::TransientRender(_)
        | CycleFailure::TransientUpload(_)
        | CycleFailure::StoreUnavailable(_) => {
            logger.log_warning(&reason);
            ctx.manager.release(lease, &reason).await
        }
    };

    match reported {
        Ok(ReleaseOutcome::Requeued { attempt_count }) => CycleOutcome::Requeued { attempt_count },
        Ok(ReleaseOutcome::DeadLettered { attempt_count }) => {
            CycleOutcome::DeadLettered { attempt_count }
        }
        Ok(ReleaseOutcome::LeaseLost) => {
            metrics::record_lease_lost();
            logger.log_warning("release rejected, lease no longer held");
            CycleOutcome::Abandoned
        }
        Err(e) => {
            logger.log_error(&format!("could not report failure, lease expiry will requeue: {}", e));
            CycleOutcome::Unreported
        }
    }
}

async fn cleanup(output_dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(output_dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", output_dir.display(), e);
        }
    }
}

/// Periodically return expired leases to pending.
async fn sweep_loop(ctx: Arc<SlotContext>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(ctx.config.sweep_interval);
    let mut failures = FailureTracker::new(ctx.config.sweep_failure_budget);

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                match ctx.manager.requeue_expired_leases(&ctx.batch_id).await {
                    Ok(report) => {
                        failures.record_success();
                        metrics::record_sweep(report.requeued, report.dead_lettered);
                    }
                    Err(e) => {
                        metrics::record_sweep_failure();
                        if failures.record_failure() {
                            warn!(batch_id = %ctx.batch_id, "Sweep failed: {}", e);
                        } else if failures.failure_count() == ctx.config.sweep_failure_budget + 1 {
                            error!(
                                batch_id = %ctx.batch_id,
                                failures = failures.failure_count(),
                                "Sweep keeps failing; expired leases are not being recovered: {}", e
                            );
                        }
                    }
                }
            }
        }
    }
}
