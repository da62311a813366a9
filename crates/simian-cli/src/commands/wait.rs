//! Wait command - block until a batch drains or the deadline passes.
//!
//! Exits non-zero unless every combination completed.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;

use simian_models::{BatchId, BatchState, BatchStatus};

use super::format_status;
use crate::{Config, OutputFormat};

/// Arguments for the wait command.
#[derive(Debug, Args)]
pub struct WaitArgs {
    /// Batch to wait for.
    pub batch_id: String,

    /// Give up after this many seconds.
    #[arg(long, default_value = "3600")]
    pub deadline_secs: u64,

    /// Poll interval in milliseconds.
    #[arg(long, default_value = "5000")]
    pub poll_ms: u64,
}

/// Execute the wait command.
///
/// # Errors
///
/// Returns an error if the batch does not exist, the store is unreachable,
/// or the batch did not fully complete.
pub async fn execute(args: WaitArgs, config: &Config) -> Result<()> {
    let manager = config.queue_manager()?;
    let batch_id = BatchId::from_string(args.batch_id);

    let status = manager
        .wait_for_completion(
            &batch_id,
            Duration::from_secs(args.deadline_secs),
            Duration::from_millis(args.poll_ms),
        )
        .await
        .with_context(|| format!("Failed while waiting for batch {}", batch_id))?;

    match config.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
        OutputFormat::Text => println!("{}", format_status(batch_id.as_str(), &status)),
    }

    verdict(&batch_id, &status)
}

/// Turn the final status into the command's exit result.
pub fn verdict(batch_id: &BatchId, status: &BatchStatus) -> Result<()> {
    if status.is_fully_completed() {
        return Ok(());
    }
    if status.state == BatchState::Invalid {
        anyhow::bail!("Batch {} is invalid; seeding did not finish", batch_id);
    }
    if status.is_drained() {
        anyhow::bail!(
            "Batch {} finished with {} dead-lettered combination(s)",
            batch_id,
            status.dead_lettered
        );
    }
    anyhow::bail!(
        "Deadline reached for batch {}: {} pending, {} in progress",
        batch_id,
        status.pending,
        status.in_progress
    )
}
