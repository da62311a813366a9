//! Combination sources consumed at batch start.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use simian_models::{Combination, CombinationId, Parameters};

use crate::error::{QueueError, QueueResult};

/// Produces the finite, ordered sequence of combinations for one batch.
#[async_trait]
pub trait CombinationSource: Send + Sync {
    async fn enumerate(&self) -> QueueResult<Vec<Combination>>;
}

/// Source backed by an in-memory list.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    combinations: Vec<Combination>,
}

impl StaticSource {
    pub fn new(combinations: Vec<Combination>) -> Self {
        Self { combinations }
    }
}

#[async_trait]
impl CombinationSource for StaticSource {
    async fn enumerate(&self) -> QueueResult<Vec<Combination>> {
        Ok(self.combinations.clone())
    }
}

/// Source reading a combinations JSON file.
///
/// Accepts either a top-level array or an object with a `combinations` array.
/// Each entry is an object of render parameters; an `id` field, when present,
/// becomes the combination id, otherwise the entry's index does.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl CombinationSource for JsonFileSource {
    async fn enumerate(&self) -> QueueResult<Vec<Combination>> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let combinations = parse_combinations(&raw)?;
        info!(
            path = %self.path.display(),
            count = combinations.len(),
            "Loaded combinations"
        );
        Ok(combinations)
    }
}

/// Parse a combinations document.
pub fn parse_combinations(raw: &str) -> QueueResult<Vec<Combination>> {
    let document: Value = serde_json::from_str(raw)?;
    let entries = match document {
        Value::Array(entries) => entries,
        Value::Object(mut object) => match object.remove("combinations") {
            Some(Value::Array(entries)) => entries,
            _ => {
                return Err(QueueError::Source(
                    "expected a `combinations` array".to_string(),
                ))
            }
        },
        _ => {
            return Err(QueueError::Source(
                "combinations document must be an array or object".to_string(),
            ))
        }
    };

    entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            let Value::Object(fields) = entry else {
                return Err(QueueError::Source(format!("combination {} is not an object", index)));
            };
            let id = match fields.get("id") {
                Some(Value::String(s)) => CombinationId::from(s.as_str()),
                Some(Value::Number(n)) => CombinationId::from(n.to_string()),
                Some(other) => {
                    return Err(QueueError::Source(format!(
                        "combination {} has an unsupported id: {}",
                        index, other
                    )))
                }
                None => CombinationId::from_index(index),
            };
            // Remaining keys stay in source order
            let parameters: Parameters = fields.into_iter().filter(|(name, _)| name != "id").collect();
            Ok(Combination::new(id, parameters))
        })
        .collect()
}

/// Reject empty sources and duplicate ids.
pub fn validate_combinations(combinations: &[Combination]) -> QueueResult<()> {
    if combinations.is_empty() {
        return Err(QueueError::batch_init("combination source produced no combinations"));
    }

    let mut seen = HashSet::with_capacity(combinations.len());
    for combination in combinations {
        if !seen.insert(&combination.id) {
            return Err(QueueError::batch_init(format!(
                "duplicate combination id: {}",
                combination.id
            )));
        }
    }
    Ok(())
}
