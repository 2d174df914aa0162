use std::sync::Arc;

use signage_engine::config::EngineConfig;
use signage_engine::engine::{RESTART_EXIT_CODE, SignageEngine};
use signage_engine::playback::LoggingRenderer;
use signage_engine::{logging, panic_hook, transport};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    transport::install_rustls_provider();

    let config = EngineConfig::from_env()?;

    // Initialize logging
    let (logging, log_guard) = logging::init_logging(&config.log_dir())?;
    let log_cancel = CancellationToken::new();
    logging.start_retention_cleanup(log_cancel.clone());

    let engine = SignageEngine::open(config, Arc::new(LoggingRenderer)).await?;
    panic_hook::install(engine.crash_journal().clone());
    panic_hook::forward_to(engine.supervisor_handle());
    engine.start().await?;

    let restart_reason = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
            None
        }
        reason = engine.restart_requested() => Some(reason),
    };

    engine.shutdown().await?;
    log_cancel.cancel();

    if let Some(reason) = restart_reason {
        tracing::warn!(reason = %reason, exit_code = RESTART_EXIT_CODE, "Exiting for restart");
        drop(log_guard);
        std::process::exit(RESTART_EXIT_CODE);
    }

    Ok(())
}
