//! Dead-letters command - list combinations that exhausted their attempts.

use anyhow::{Context, Result};
use clap::Args;

use simian_models::BatchId;

use crate::{Config, OutputFormat};

/// Arguments for the dead-letters command.
#[derive(Debug, Args)]
pub struct DeadLettersArgs {
    /// Batch to inspect.
    pub batch_id: String,
}

/// Execute the dead-letters command.
///
/// # Errors
///
/// Returns an error if the batch does not exist or the store is unreachable.
pub async fn execute(args: DeadLettersArgs, config: &Config) -> Result<()> {
    let manager = config.queue_manager()?;
    let batch_id = BatchId::from_string(args.batch_id);

    let letters = manager
        .dead_letters(&batch_id)
        .await
        .with_context(|| format!("Failed to list dead letters of batch {}", batch_id))?;

    match config.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&letters)?),
        OutputFormat::Text => {
            if letters.is_empty() {
                println!("No dead-lettered combinations");
                return Ok(());
            }

            println!("Dead-lettered combinations:");
            println!();
            for letter in &letters {
                println!(
                    "  {} (attempts: {}, at {})",
                    letter.combination.id,
                    letter.combination.attempt_count,
                    letter.dead_lettered_at.format("%Y-%m-%d %H:%M:%S")
                );
                println!("    reason: {}", letter.reason);
            }
        }
    }

    Ok(())
}
