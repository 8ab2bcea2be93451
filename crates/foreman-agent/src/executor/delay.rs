//! Delay executor: sleep in bounded chunks, reporting progress.

use std::time::Duration;

use tokio::sync::mpsc;

use foreman_types::DelayOutcome;

/// Largest single sleep; keeps progress ticks flowing on long delays.
const MAX_CHUNK_MS: u64 = 1000;

/// Sleep `ms` milliseconds in chunks of at most [`MAX_CHUNK_MS`],
/// signalling progress after each chunk.
pub async fn run(ms: u64, progress: mpsc::Sender<()>) -> DelayOutcome {
    let started = tokio::time::Instant::now();

    let mut remaining = ms;
    while remaining > 0 {
        let chunk = remaining.min(MAX_CHUNK_MS);
        tokio::time::sleep(Duration::from_millis(chunk)).await;
        remaining -= chunk;
        // Best-effort: a full channel just means a heartbeat is already due.
        let _ = progress.try_send(());
    }

    DelayOutcome {
        ok: true,
        took_ms: started.elapsed().as_millis() as u64,
    }
}
