//! Start-batch command - enumerate combinations and seed a batch.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use simian_models::BatchId;
use simian_queue::JsonFileSource;

use crate::{Config, OutputFormat};

/// Arguments for the start-batch command.
#[derive(Debug, Args)]
pub struct StartBatchArgs {
    /// JSON file with the combinations to render.
    #[arg(long, short = 'c')]
    pub combinations: PathBuf,

    /// Batch id to use instead of a generated one.
    #[arg(long)]
    pub batch_id: Option<String>,
}

/// Execute the start-batch command.
///
/// # Errors
///
/// Returns an error if the file cannot be parsed, the batch id is taken,
/// or the store fails while seeding.
pub async fn execute(args: StartBatchArgs, config: &Config) -> Result<()> {
    let manager = config.queue_manager()?;
    let source = JsonFileSource::new(&args.combinations);

    let batch = manager
        .start_batch_from(&source, args.batch_id.map(BatchId::from_string))
        .await
        .with_context(|| format!("Failed to start batch from {}", args.combinations.display()))?;

    match config.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&batch)?),
        OutputFormat::Text => {
            println!("Started batch {}", batch.batch_id);
            println!("  combinations: {}", batch.total_count);
        }
    }

    Ok(())
}
