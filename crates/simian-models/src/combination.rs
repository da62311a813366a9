//! Combination definitions for queue processing.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Parameter set for one combination, in the order the source listed them.
pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// Unique identifier for a combination within a batch.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CombinationId(pub String);

impl CombinationId {
    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Identifier derived from the combination's position in the source.
    pub fn from_index(index: usize) -> Self {
        Self(index.to_string())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CombinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CombinationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CombinationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One discrete render job.
///
/// Immutable once enumerated, except for `attempt_count`, which only the
/// coordination store bumps when the combination is requeued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Combination {
    /// Unique combination ID
    pub id: CombinationId,
    /// Render parameters
    #[serde(default)]
    pub parameters: Parameters,
    /// Number of times this combination has been requeued
    #[serde(default)]
    pub attempt_count: u32,
}

impl Combination {
    /// Create a new combination with no prior attempts.
    pub fn new(id: impl Into<CombinationId>, parameters: Parameters) -> Self {
        Self {
            id: id.into(),
            parameters,
            attempt_count: 0,
        }
    }

    /// Add a single parameter.
    pub fn with_parameter(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    /// Parameters serialized as a compact JSON object.
    pub fn parameters_json(&self) -> String {
        // A map of JSON values with string keys always serializes.
        serde_json::to_string(&self.parameters).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Why a combination ended up in the dead-letter set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The combination, with its final attempt count
    pub combination: Combination,
    /// Last failure reason reported for it
    pub reason: String,
    /// When it was dead-lettered (store clock)
    pub dead_lettered_at: DateTime<Utc>,
}
