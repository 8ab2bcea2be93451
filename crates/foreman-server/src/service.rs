//! Service lifecycle: startup recovery, background tasks, graceful shutdown.
//!
//! Startup order matters: crashed-Running commands are reclaimed before
//! the listener binds, so no request ever observes pre-recovery state.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info};

use foreman_types::ServerConfig;

use crate::http::{self, AppState};
use crate::reclaim;
use crate::store::CommandStore;

/// How long graceful shutdown may take before the process is forced out.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Run the control server until a shutdown signal arrives.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }

    let mut store = CommandStore::open(&config.db_path)
        .with_context(|| format!("opening store at {}", config.db_path.display()))?;

    // Server-side crash recovery, before any request is served.
    let reclaimed = store.reclaim_crashed_running(Utc::now())?;
    if reclaimed > 0 {
        info!(count = reclaimed, "reset crashed running commands to pending");
    }

    let state = Arc::new(AppState::new(store));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reclaimer = tokio::spawn(reclaim::run(
        state.clone(),
        config.stale_check_interval,
        config.command_timeout,
        shutdown_rx.clone(),
    ));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %addr, db = %config.db_path.display(), "control server listening");

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = signal_tx.send(true);
        // If graceful shutdown stalls past the grace period, force out.
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        error!("graceful shutdown timed out, forcing exit");
        std::process::exit(1);
    });

    let mut serve_shutdown = shutdown_rx;
    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(async move {
            let _ = serve_shutdown.wait_for(|&stop| stop).await;
        })
        .await
        .context("HTTP server error")?;

    // Listener is closed; stop the reclaimer and let the store drop.
    let _ = shutdown_tx.send(true);
    let _ = reclaimer.await;
    info!("control server stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
