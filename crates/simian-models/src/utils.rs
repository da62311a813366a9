//! Key derivation helpers.

use crate::{BatchId, CombinationId};

/// Default prefix for rendered artifacts in the upload destination.
pub const DEFAULT_ARTIFACT_PREFIX: &str = "renders";

/// Deterministic destination key for a combination's rendered video.
///
/// Retried uploads of the same combination always target the same key, so a
/// second upload overwrites the first instead of creating a duplicate.
pub fn destination_key(prefix: &str, batch_id: &BatchId, combination_id: &CombinationId) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{}/{}.mp4", batch_id, combination_id)
    } else {
        format!("{}/{}/{}.mp4", prefix, batch_id, combination_id)
    }
}
