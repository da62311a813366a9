//! Sweep command - requeue combinations whose leases expired.

use anyhow::{Context, Result};
use clap::Args;

use simian_models::BatchId;

use crate::{Config, OutputFormat};

/// Arguments for the sweep command.
#[derive(Debug, Args)]
pub struct SweepArgs {
    /// Batch to sweep.
    pub batch_id: String,
}

/// Execute the sweep command.
///
/// # Errors
///
/// Returns an error if the batch does not exist or the store is unreachable.
pub async fn execute(args: SweepArgs, config: &Config) -> Result<()> {
    let manager = config.queue_manager()?;
    let batch_id = BatchId::from_string(args.batch_id);

    let report = manager
        .requeue_expired_leases(&batch_id)
        .await
        .with_context(|| format!("Failed to sweep batch {}", batch_id))?;

    match config.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => println!(
            "Swept batch {}: {} requeued, {} dead-lettered",
            batch_id, report.requeued, report.dead_lettered
        ),
    }

    Ok(())
}
