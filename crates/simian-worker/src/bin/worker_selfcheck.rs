use std::path::Path;

use simian_queue::QueueConfig;
use simian_render::CommandRenderEngine;
use simian_worker::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env();
    let queue = QueueConfig::from_env();

    println!(
        "worker-selfcheck: starting with work_dir={}",
        config.work_dir.display()
    );
    queue.validate()?;
    config.validate(&queue)?;
    ensure_workdir(&config.work_dir).await?;
    ensure_renderer()?;
    ensure_env_present(&["REDIS_URL", "SIMIAN_BATCH_ID"])?;
    ensure_sink()?;

    println!("worker-selfcheck: ok");
    Ok(())
}

async fn ensure_workdir<P: AsRef<Path>>(path: P) -> anyhow::Result<()> {
    let path = path.as_ref();
    tokio::fs::create_dir_all(path).await?;
    Ok(())
}

fn ensure_renderer() -> anyhow::Result<()> {
    let engine = CommandRenderEngine::from_env();
    let program = engine
        .check_available()
        .map_err(|e| anyhow::anyhow!("renderer not available: {}", e))?;
    println!("worker-selfcheck: renderer at {}", program.display());
    Ok(())
}

fn ensure_sink() -> anyhow::Result<()> {
    simian_storage::sink_from_env()
        .map(|_| ())
        .map_err(|e| anyhow::anyhow!("upload sink not configured: {}", e))
}

fn ensure_env_present(vars: &[&str]) -> anyhow::Result<()> {
    for var in vars {
        if std::env::var(var).is_err() {
            return Err(anyhow::anyhow!("missing required env var {}", var));
        }
    }
    Ok(())
}
