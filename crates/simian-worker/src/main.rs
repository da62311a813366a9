//! Render worker binary.

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use simian_queue::QueueManager;
use simian_render::CommandRenderEngine;
use simian_worker::{metrics, WorkerAgent, WorkerConfig};

#[tokio::main]
async fn main() {
    // Install rustls crypto provider (required for rediss:// and R2)
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        eprintln!("rustls crypto provider already installed");
    }

    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing with colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,simian=info,aws_config=warn,aws_smithy_runtime=warn"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }

    info!("Starting simian-worker");

    if let Ok(addr) = std::env::var("METRICS_ADDR") {
        match addr.parse() {
            Ok(addr) => match metrics::init_metrics(addr) {
                Ok(()) => info!("Serving metrics on {}", addr),
                Err(e) => warn!("Metrics disabled: {}", e),
            },
            Err(e) => warn!("Invalid METRICS_ADDR {}: {}", addr, e),
        }
    }

    // Load configuration
    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    let Some(batch_id) = config.batch_id.clone() else {
        error!("SIMIAN_BATCH_ID is required");
        std::process::exit(2);
    };

    let manager = match QueueManager::from_env() {
        Ok(m) => m,
        Err(e) => {
            error!("Failed to create queue manager: {}", e);
            std::process::exit(1);
        }
    };

    let engine = CommandRenderEngine::from_env();
    if let Err(e) = engine.check_available() {
        error!("Render engine unavailable: {}", e);
        std::process::exit(1);
    }

    let sink = match simian_storage::sink_from_env() {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create upload sink: {}", e);
            std::process::exit(1);
        }
    };

    let agent = match WorkerAgent::new(config, manager, Arc::new(engine), sink) {
        Ok(a) => Arc::new(a),
        Err(e) => {
            error!("Failed to create worker agent: {}", e);
            std::process::exit(1);
        }
    };

    // Stop claiming on Ctrl-C; in-flight cycles finish
    let signal_agent = Arc::clone(&agent);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            signal_agent.shutdown();
        }
    });

    match agent.run(&batch_id).await {
        Ok(summary) => info!(
            completed = summary.completed,
            requeued = summary.requeued,
            dead_lettered = summary.dead_lettered,
            "Worker shutdown complete"
        ),
        Err(e) => {
            error!("Worker error: {}", e);
            std::process::exit(1);
        }
    }
}
