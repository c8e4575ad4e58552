use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use courier_core::config::EngineSettings;
use courier_core::repository::Repositories;
use courier_core::telemetry::{init_tracing, LogFormat};
use courier_workflow::{shutdown_signal, LoggingStepExecutor, NotificationEngine};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let format = std::env::var("COURIER_LOG_FORMAT")
        .ok()
        .and_then(|raw| raw.parse::<LogFormat>().ok())
        .unwrap_or_default();
    init_tracing(format);

    let settings = EngineSettings::from_env()?;
    let repositories = Repositories::in_memory();
    let executor = Arc::new(LoggingStepExecutor);

    #[cfg(feature = "redis")]
    let engine = NotificationEngine::connect(&settings, repositories, executor).await?;
    #[cfg(not(feature = "redis"))]
    let engine = NotificationEngine::in_memory(&settings, repositories, executor)?;

    info!(
        queue = %settings.queue.name,
        concurrency = settings.queue.concurrency,
        env = %settings.env,
        "[courier-worker] starting"
    );
    engine.start();

    shutdown_signal().await;
    engine.shutdown().await?;
    Ok(())
}
