//! Lease heartbeat.
//!
//! Renews a held lease on its own task so a long render or upload never
//! starves renewal. The task stops on the first rejected renewal; the cycle
//! reads the outcome between stages.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use simian_models::Lease;
use simian_queue::{FailureTracker, QueueManager};

use crate::metrics;

/// Latest view of a lease as seen by its heartbeat.
#[derive(Debug, Clone)]
pub struct LeaseState {
    pub lease: Lease,
    pub lost: bool,
}

/// Handle to a running heartbeat task.
pub struct LeaseHeartbeat {
    state: watch::Receiver<LeaseState>,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl LeaseHeartbeat {
    /// Start renewing `lease` every `interval`.
    pub fn spawn(manager: QueueManager, lease: Lease, interval: Duration) -> Self {
        let (state_tx, state_rx) = watch::channel(LeaseState { lease, lost: false });
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut failures = FailureTracker::new(3);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let current = state_tx.borrow().lease.clone();
                match manager.renew(&current).await {
                    Ok(Some(renewed)) => {
                        failures.record_success();
                        metrics::record_renewal(true);
                        debug!(
                            combination_id = %renewed.combination_id,
                            expires_at = %renewed.expires_at,
                            "Lease renewed"
                        );
                        state_tx.send_replace(LeaseState {
                            lease: renewed,
                            lost: false,
                        });
                    }
                    Ok(None) => {
                        metrics::record_renewal(false);
                        warn!(
                            combination_id = %current.combination_id,
                            worker_id = %current.worker_id,
                            "Lease renewal rejected, lease lost"
                        );
                        state_tx.send_replace(LeaseState {
                            lease: current,
                            lost: true,
                        });
                        break;
                    }
                    // The lease may still be valid; the next tick or the
                    // final acknowledgment decides
                    Err(e) => {
                        if failures.record_failure() {
                            warn!(
                                combination_id = %current.combination_id,
                                "Lease renewal failed: {}", e
                            );
                        }
                    }
                }
            }
        });

        Self {
            state: state_rx,
            stop: stop_tx,
            handle,
        }
    }

    /// Whether a renewal has been rejected.
    pub fn is_lost(&self) -> bool {
        self.state.borrow().lost
    }

    /// Most recently renewed lease.
    pub fn current(&self) -> Lease {
        self.state.borrow().lease.clone()
    }

    /// Stop renewing and return the final lease state.
    pub async fn stop(self) -> LeaseState {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
        let state = self.state.borrow().clone();
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use simian_models::{BatchId, Combination, Parameters, WorkerId};
    use simian_queue::{ManualClock, MemoryStore, QueueConfig};

    async fn claimed_lease(clock: Arc<ManualClock>) -> (QueueManager, Lease) {
        let store = Arc::new(MemoryStore::with_clock(clock));
        let config = QueueConfig {
            lease_duration: Duration::from_secs(60),
            ..Default::default()
        };
        let manager = QueueManager::new(store, config).unwrap();
        let batch = manager
            .start_batch(Some(BatchId::from("b1")), vec![Combination::new("0", Parameters::new())])
            .await
            .unwrap();
        let claimed = manager
            .claim(&batch.batch_id, &WorkerId::from_string("w"))
            .await
            .unwrap()
            .unwrap();
        (manager, claimed.lease)
    }

    #[tokio::test]
    async fn test_heartbeat_renews_lease() {
        let clock = Arc::new(ManualClock::default());
        let (manager, lease) = claimed_lease(clock.clone()).await;
        clock.advance(Duration::from_secs(10));

        let heartbeat = LeaseHeartbeat::spawn(manager, lease.clone(), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let state = heartbeat.stop().await;

        assert!(!state.lost);
        assert!(state.lease.expires_at > lease.expires_at);
        assert_eq!(state.lease.lease_id, lease.lease_id);
    }

    #[tokio::test]
    async fn test_heartbeat_reports_lost_lease() {
        let clock = Arc::new(ManualClock::default());
        let (manager, lease) = claimed_lease(clock.clone()).await;
        clock.advance(Duration::from_secs(61));

        let heartbeat = LeaseHeartbeat::spawn(manager, lease, Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(heartbeat.is_lost());
        assert!(heartbeat.stop().await.lost);
    }
}
