//! Periodic stale-command reclamation.
//!
//! A Running command whose owner has not heartbeated within the command
//! timeout is returned to Pending for reassignment. Runs as one serial
//! task: each pass finishes (and its transaction commits) before the
//! next tick is considered, so passes never overlap.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::http::AppState;

/// Run the reclaimer until the shutdown channel flips to true.
pub async fn run(
    state: Arc<AppState>,
    period: Duration,
    stale_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        period_ms = period.as_millis() as u64,
        stale_timeout_ms = stale_timeout.as_millis() as u64,
        "stale reclaimer started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Utc::now();
                let cutoff = now - chrono::Duration::milliseconds(stale_timeout.as_millis() as i64);
                match state.reclaim_stale(cutoff, now) {
                    Ok(0) => {}
                    Ok(count) => info!(count, "reclaimed stale commands"),
                    Err(e) => warn!(error = %e, "stale reclamation pass failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("stale reclaimer stopped");
                    return;
                }
            }
        }
    }
}
