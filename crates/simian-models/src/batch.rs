//! Batch definitions and status snapshots.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub String);

impl BatchId {
    /// Generate a new random batch ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BatchId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a batch in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    /// Metadata exists, combinations are still being pushed; nothing is claimable
    #[default]
    Seeding,
    /// Fully seeded and claimable
    Ready,
    /// Seeding failed and was rolled back
    Invalid,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Seeding => "seeding",
            BatchState::Ready => "ready",
            BatchState::Invalid => "invalid",
        }
    }

    /// Parse the stored representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "seeding" => Some(BatchState::Seeding),
            "ready" => Some(BatchState::Ready),
            "invalid" => Some(BatchState::Invalid),
            _ => None,
        }
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One distribution run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Unique batch identifier
    pub batch_id: BatchId,
    /// Number of combinations enumerated at batch start; never changes
    pub total_count: u64,
    /// When the batch was created
    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(batch_id: BatchId, total_count: u64) -> Self {
        Self {
            batch_id,
            total_count,
            created_at: Utc::now(),
        }
    }
}

/// Point-in-time snapshot of a batch's queue and counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStatus {
    /// Combinations enumerated at batch start
    pub total: u64,
    /// Claimable combinations
    pub pending: u64,
    /// Combinations under an active or expired-but-unswept lease
    pub in_progress: u64,
    /// Combinations acknowledged successfully
    pub completed: u64,
    /// Terminal failures
    pub failed: u64,
    /// Combinations moved to the dead-letter set
    pub dead_lettered: u64,
    /// Transient failures that were released back to pending
    pub retried: u64,
    /// Batch lifecycle state
    pub state: BatchState,
}

impl BatchStatus {
    /// True once nothing is pending or leased.
    pub fn is_drained(&self) -> bool {
        self.state == BatchState::Ready && self.pending == 0 && self.in_progress == 0
    }

    /// True when every combination completed successfully.
    pub fn is_fully_completed(&self) -> bool {
        self.is_drained() && self.completed == self.total
    }

    /// `total == completed + pending + in_progress + dead_lettered`.
    pub fn is_conserved(&self) -> bool {
        self.total == self.completed + self.pending + self.in_progress + self.dead_lettered
    }

    /// Percentage of combinations in a terminal state.
    pub fn progress_percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        let done = self.completed + self.dead_lettered;
        ((done * 100) / self.total).min(100) as u8
    }
}
