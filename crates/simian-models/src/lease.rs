//! Lease held by a worker on a claimed combination.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{BatchId, Combination, CombinationId};

/// Identifier of a worker process slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    /// Generate a worker ID of the form `worker-<uuid>`.
    pub fn generate() -> Self {
        Self(format!("worker-{}", Uuid::new_v4()))
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Time-bounded exclusive claim of one worker on one combination.
///
/// `lease_id` is minted per claim; the store only accepts renew, release and
/// acknowledge calls whose `(worker_id, lease_id)` matches the current owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub batch_id: BatchId,
    pub combination_id: CombinationId,
    pub worker_id: WorkerId,
    pub lease_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Owner token stored alongside the lease: `<worker_id>|<lease_id>`.
    pub fn owner_token(&self) -> String {
        owner_token(&self.worker_id, &self.lease_id)
    }

    /// Whether the lease has lapsed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Build the owner token for a worker and lease.
pub fn owner_token(worker_id: &WorkerId, lease_id: &str) -> String {
    format!("{}|{}", worker_id, lease_id)
}

/// Mint a fresh lease identifier.
pub fn new_lease_id() -> String {
    Uuid::new_v4().to_string()
}

/// A combination together with the lease that grants exclusive work on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimedCombination {
    pub combination: Combination,
    pub lease: Lease,
}
