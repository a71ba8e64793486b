use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::manager::Manager;
use crate::server::{self, AppState};
use crate::telemetry;

use super::CliHarness;

/// Run the manager over every registered repository plus the HTTP surface,
/// until SIGINT/SIGTERM. Shutdown order: cancel the root token, let the
/// controllers unwind, drain the server within its 10 second budget, then
/// close the store.
pub async fn run(harness: &CliHarness) -> anyhow::Result<()> {
    let config = &harness.config;

    let db = harness.open_store().await?;

    let metrics = config
        .telemetry
        .metrics
        .enabled
        .then(telemetry::install)
        .transpose()
        .context("install metrics recorder")?;

    let manager = Manager::new(db);
    let token = CancellationToken::new();

    let state = AppState {
        manager: Arc::clone(&manager),
        global_secret_env: config.webhook.secret_env.clone(),
        metrics,
    };
    let server_handle = tokio::spawn(server::serve(config.server.port, state, token.clone()));

    let signal_token = token.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        signal_token.cancel();
    });

    info!(port = config.server.port, "starting kedge");
    let result = manager.start(token.clone()).await;
    token.cancel();

    match tokio::time::timeout(Duration::from_secs(10), server_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => warn!(error = %err, "server error"),
        Ok(Err(err)) => warn!(error = %err, "server task failed"),
        Err(_) => warn!("server drain timed out"),
    }

    manager.close().await;
    result.context("manager start")
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
