//! The `simian` operator CLI.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use simian_cli::{Cli, Commands};

fn main() -> Result<()> {
    // Required for rediss:// URLs
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        eprintln!("rustls crypto provider already installed");
    }

    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.config();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        match cli.command {
            Commands::StartBatch(args) => simian_cli::commands::start_batch::execute(args, &config).await,
            Commands::Status(args) => simian_cli::commands::status::execute(args, &config).await,
            Commands::Sweep(args) => simian_cli::commands::sweep::execute(args, &config).await,
            Commands::DeadLetters(args) => {
                simian_cli::commands::dead_letters::execute(args, &config).await
            }
            Commands::Wait(args) => simian_cli::commands::wait::execute(args, &config).await,
        }
    })
}
