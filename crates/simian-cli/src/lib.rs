//! # simian-cli
//!
//! Operator commands for render batches.
//!
//! ## Commands
//!
//! - `simian start-batch` - Enumerate combinations and start a batch
//! - `simian status` - Show batch counters
//! - `simian sweep` - Requeue combinations whose leases expired
//! - `simian dead-letters` - List dead-lettered combinations
//! - `simian wait` - Block until a batch drains or a deadline passes
//!
//! ## Configuration
//!
//! Flags fall back to environment variables:
//!
//! - `REDIS_URL` - Coordination store (default: `redis://localhost:6379`)
//! - `SIMIAN_KEY_PREFIX` - Key namespace (default: `simian`)
//!
//! Queue tuning (`SIMIAN_MAX_ATTEMPTS`, `SIMIAN_LEASE_DURATION_SECS`, ...)
//! is read from the environment as the workers read it.

#![allow(clippy::print_stdout)]
#![allow(clippy::print_stderr)]

pub mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use simian_queue::{QueueConfig, QueueManager, DEFAULT_KEY_PREFIX};

/// Simian CLI - render batch operations.
#[derive(Debug, Parser)]
#[command(name = "simian")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Redis URL of the coordination store.
    #[arg(long, env = "REDIS_URL", default_value = "redis://localhost:6379")]
    pub redis_url: String,

    /// Key namespace shared with the workers.
    #[arg(long, env = "SIMIAN_KEY_PREFIX", default_value = DEFAULT_KEY_PREFIX)]
    pub key_prefix: String,

    /// Output format.
    #[arg(long, value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Get the effective configuration.
    #[must_use]
    pub fn config(&self) -> Config {
        Config {
            redis_url: self.redis_url.clone(),
            key_prefix: self.key_prefix.clone(),
            format: self.format,
        }
    }
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Enumerate combinations from a file and start a batch.
    StartBatch(commands::start_batch::StartBatchArgs),
    /// Show batch counters.
    Status(commands::status::StatusArgs),
    /// Requeue combinations whose leases expired.
    Sweep(commands::sweep::SweepArgs),
    /// List dead-lettered combinations.
    DeadLetters(commands::dead_letters::DeadLettersArgs),
    /// Wait for a batch to drain.
    Wait(commands::wait::WaitArgs),
}

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output.
    Json,
}

/// CLI configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub key_prefix: String,
    pub format: OutputFormat,
}

impl Config {
    /// Queue settings: flags for the connection, environment for tuning.
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            redis_url: self.redis_url.clone(),
            key_prefix: self.key_prefix.clone(),
            ..QueueConfig::from_env()
        }
    }

    /// Connect a queue manager to the configured store.
    pub fn queue_manager(&self) -> Result<QueueManager> {
        Ok(QueueManager::redis(self.queue_config())?)
    }
}
