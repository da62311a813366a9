//! Status command - show batch counters.

use anyhow::{Context, Result};
use clap::Args;

use simian_models::BatchId;

use super::format_status;
use crate::{Config, OutputFormat};

/// Arguments for the status command.
#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Batch to inspect.
    pub batch_id: String,
}

/// Execute the status command.
///
/// # Errors
///
/// Returns an error if the batch does not exist or the store is unreachable.
pub async fn execute(args: StatusArgs, config: &Config) -> Result<()> {
    let manager = config.queue_manager()?;
    let batch_id = BatchId::from_string(args.batch_id);

    let status = manager
        .get_status(&batch_id)
        .await
        .with_context(|| format!("Failed to read status of batch {}", batch_id))?;

    match config.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
        OutputFormat::Text => println!("{}", format_status(batch_id.as_str(), &status)),
    }

    Ok(())
}
