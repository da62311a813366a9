//! Redis coordination store integration tests.

use std::sync::Arc;
use std::time::Duration;

use simian_models::{BatchId, Combination, CombinationId, Parameters, WorkerId};
use simian_queue::{AckOutcome, QueueConfig, QueueManager, RedisStore, ReleaseOutcome};

fn manager(lease_secs: u64) -> QueueManager {
    dotenvy::dotenv().ok();

    let config = QueueConfig {
        key_prefix: format!("simian-test-{}", uuid_suffix()),
        lease_duration: Duration::from_secs(lease_secs),
        seed_chunk_size: 2,
        ..QueueConfig::from_env()
    };
    let store = RedisStore::new(&config.redis_url, config.key_prefix.clone())
        .expect("Failed to create store");
    QueueManager::new(Arc::new(store), config).expect("Failed to create manager")
}

fn uuid_suffix() -> String {
    BatchId::new().to_string()
}

fn combinations(n: usize) -> Vec<Combination> {
    (0..n)
        .map(|i| Combination::new(CombinationId::from_index(i), Parameters::new()))
        .collect()
}

/// Seed, claim, ack: counts stay conserved.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_claim_and_acknowledge() {
    let manager = manager(60);
    let batch = manager.start_batch(None, combinations(3)).await.expect("Failed to start");
    let worker = WorkerId::generate();

    let status = manager.get_status(&batch.batch_id).await.expect("status");
    assert_eq!(status.pending, 3);

    let claimed = manager
        .claim(&batch.batch_id, &worker)
        .await
        .expect("claim")
        .expect("pending combination");
    assert_eq!(
        manager.acknowledge(&claimed.lease).await.expect("ack"),
        AckOutcome::Acknowledged
    );
    // Second ack with the same lease is stale
    assert_eq!(
        manager.acknowledge(&claimed.lease).await.expect("ack"),
        AckOutcome::LeaseLost
    );

    let status = manager.get_status(&batch.batch_id).await.expect("status");
    assert_eq!(status.completed, 1);
    assert_eq!(status.pending, 2);
    assert!(status.is_conserved());
}

/// Duplicate batch ids are rejected without touching the first batch.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_duplicate_batch() {
    let manager = manager(60);
    let batch = manager.start_batch(None, combinations(1)).await.expect("Failed to start");

    let err = manager
        .start_batch(Some(batch.batch_id.clone()), combinations(4))
        .await
        .unwrap_err();
    assert!(matches!(err, simian_queue::QueueError::BatchExists(_)));

    let status = manager.get_status(&batch.batch_id).await.expect("status");
    assert_eq!(status.total, 1);
}

/// Expired leases are swept back and dead-lettered once the budget is spent.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_expired_lease_sweep() {
    let manager = manager(1);
    let batch = manager.start_batch(None, combinations(1)).await.expect("Failed to start");
    let worker = WorkerId::generate();

    for _ in 0..=manager.config().max_attempts {
        let claimed = manager
            .claim(&batch.batch_id, &worker)
            .await
            .expect("claim")
            .expect("pending combination");
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(manager.renew(&claimed.lease).await.expect("renew").is_none());
        manager
            .requeue_expired_leases(&batch.batch_id)
            .await
            .expect("sweep");
    }

    let status = manager.get_status(&batch.batch_id).await.expect("status");
    assert_eq!(status.dead_lettered, 1);
    assert_eq!(status.failed, 1);
    assert!(status.is_drained());

    let letters = manager.dead_letters(&batch.batch_id).await.expect("dead letters");
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].combination.attempt_count, manager.config().max_attempts + 1);
}

/// Releasing hands the combination back with a bumped attempt count.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_release_requeues() {
    let manager = manager(60);
    let batch = manager.start_batch(None, combinations(1)).await.expect("Failed to start");
    let worker = WorkerId::generate();

    let claimed = manager
        .claim(&batch.batch_id, &worker)
        .await
        .expect("claim")
        .expect("pending combination");
    assert_eq!(
        manager.release(&claimed.lease, "render failed").await.expect("release"),
        ReleaseOutcome::Requeued { attempt_count: 1 }
    );

    let again = manager
        .claim(&batch.batch_id, &worker)
        .await
        .expect("claim")
        .expect("requeued combination");
    assert_eq!(again.combination.attempt_count, 1);
    assert_ne!(again.lease.lease_id, claimed.lease.lease_id);
}
