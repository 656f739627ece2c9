mod adapter;
mod config;
mod db;
mod error;
mod gc;
mod idempotency;
mod locks;
mod managers;
mod models;
mod path;
mod router;
mod state;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{LogFormat, OrchestratorConfig};
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Phase 1: basic tracing so config-loading failures are still logged.
    // `set_default` installs a thread-local subscriber so it can be
    // replaced wholesale by phase 2's global one.
    let _basic_tracing = init_tracing_basic();

    info!("starting bay orchestrator v{}", env!("CARGO_PKG_VERSION"));

    let config = OrchestratorConfig::load().context("failed to load configuration")?;
    config.validate().context("configuration validation failed")?;

    // Phase 2: re-initialize tracing with the loaded config's format/level.
    drop(_basic_tracing);
    init_tracing_from_config(&config);

    info!(
        profiles = config.profiles.len(),
        gc_enabled = config.gc.enabled,
        driver = ?config.driver.kind,
        "configuration loaded"
    );

    let state = AppState::new(config).await.context("failed to initialize application state")?;

    let shutdown = CancellationToken::new();
    let gc_handle = if state.config.gc.enabled {
        let gc = state.gc.clone();
        let token = shutdown.clone();
        Some(tokio::spawn(async move { gc.run_loop(token).await }))
    } else {
        info!("gc scheduler disabled by configuration");
        None
    };

    info!("bay orchestrator core is ready (request dispatch is provided by an external layer)");

    wait_for_shutdown_signal().await;
    warn!("shutdown signal received, stopping gc scheduler");

    shutdown.cancel();
    if let Some(handle) = gc_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "gc scheduler task panicked during shutdown");
        }
    }

    info!("bay orchestrator shut down cleanly");
    Ok(())
}

/// Phase 1: basic tracing init so we can log during config loading.
fn init_tracing_basic() -> tracing::subscriber::DefaultGuard {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(filter).with_target(true).finish();
    tracing::subscriber::set_default(subscriber)
}

/// Phase 2: re-initialize tracing with configuration values. `RUST_LOG`
/// still takes precedence over `logging.level` when set.
fn init_tracing_from_config(config: &OrchestratorConfig) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            let _ = fmt().json().with_env_filter(filter).with_target(true).with_thread_ids(true).try_init();
        }
        LogFormat::Pretty => {
            let _ = fmt().pretty().with_env_filter(filter).with_target(true).try_init();
        }
        LogFormat::Compact => {
            let _ = fmt().compact().with_env_filter(filter).with_target(true).try_init();
        }
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { warn!("received ctrl-c"); }
        _ = terminate => { warn!("received sigterm"); }
    }
}

