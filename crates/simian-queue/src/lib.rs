//! Render batch queue and lease coordination.
//!
//! This crate provides:
//! - Batch seeding with all-or-nothing visibility
//! - Exclusive combination claims under time-bounded leases
//! - Lease renewal, release and acknowledgment guarded by lease ownership
//! - Expired-lease sweeps with a bounded retry budget and dead-lettering
//! - Redis and in-process coordination stores

pub mod error;
pub mod manager;
pub mod memory;
pub mod redis_store;
pub mod retry;
pub mod source;
pub mod store;

pub use error::{QueueError, QueueResult};
pub use manager::{QueueConfig, QueueManager};
pub use memory::{Clock, ManualClock, MemoryStore, SystemClock};
pub use redis_store::{RedisStore, DEFAULT_KEY_PREFIX};
pub use retry::{retry_async, retry_store, FailureTracker, RetryConfig};
pub use source::{CombinationSource, JsonFileSource, StaticSource};
pub use store::{
    AckOutcome, CoordinationStore, DeadLetterPolicy, Disposition, ReleaseOutcome, SweepReport,
};
