//! `taskrelay daemon`.

use anyhow::{Context, Result};
use taskrelay_core::config::{Config, paths};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn run() -> Result<()> {
    let config = Config::load().context("load config")?;
    let config_path = paths::config_path();
    if config_path.exists() {
        info!(path = %config_path.display(), "Using config file");
    }
    info!(home = %paths::taskrelay_home().display(), "State directory");

    let cancel = CancellationToken::new();
    let signals = tokio::spawn(cancel_on_signal(cancel.clone()));

    let result = taskrelay_daemon::run(config, cancel).await;
    signals.abort();
    result
}

async fn cancel_on_signal(cancel: CancellationToken) {
    wait_for_shutdown_signal().await;
    info!("Shutdown requested");
    cancel.cancel();
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            warn!("Failed to install SIGTERM handler: {err}");
            wait_for_ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        () = wait_for_ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {err}");
        // Without a handler only SIGTERM (or a kill) can stop the daemon.
        std::future::pending::<()>().await;
    }
}
