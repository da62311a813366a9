//! Shared data models for the simian render farm.
//!
//! This crate provides Serde-serializable types for:
//! - Combinations and their parameter sets
//! - Batches and batch status snapshots
//! - Leases held by workers
//! - Deterministic artifact keys

pub mod batch;
pub mod combination;
pub mod lease;
pub mod utils;

// Re-export common types
pub use batch::{Batch, BatchId, BatchState, BatchStatus};
pub use combination::{Combination, CombinationId, DeadLetter, Parameters};
pub use lease::{new_lease_id, owner_token, ClaimedCombination, Lease, WorkerId};
pub use utils::{destination_key, DEFAULT_ARTIFACT_PREFIX};
