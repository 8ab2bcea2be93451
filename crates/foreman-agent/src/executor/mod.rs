//! Executor dispatch and the in-flight heartbeat.
//!
//! One command executes at a time. While it runs, a background task
//! heartbeats the server every 5 seconds bound to the command id, and
//! additionally whenever the executor reports progress. The task is
//! aborted on every exit path from [`execute`].

mod delay;
mod http_get;

pub use http_get::MAX_BODY_SIZE;

use std::time::Duration;

use tokio::sync::mpsc;

use foreman_types::{AgentId, Command, CommandId, CommandPayload, CommandResult};

use crate::client::ServerClient;

/// Period of the in-flight heartbeat timer.
const IN_FLIGHT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(5);

/// Execute one command to a result.
///
/// Soft failures inside the HTTP executor (non-2xx, parse errors,
/// transport errors) come back as `Ok` with descriptive result fields;
/// only a genuine executor failure returns `Err`, which the caller
/// reports as FAILED.
pub async fn execute(
    client: &ServerClient,
    http: &reqwest::Client,
    agent: &AgentId,
    command: &Command,
) -> Result<CommandResult, String> {
    let (progress_tx, progress_rx) = mpsc::channel::<()>(16);
    let heartbeats = tokio::spawn(in_flight_heartbeats(
        client.clone(),
        agent.clone(),
        command.id,
        progress_rx,
    ));

    let outcome = match &command.payload {
        CommandPayload::Delay { ms } => Ok(CommandResult::Delay(
            delay::run(*ms, progress_tx).await,
        )),
        CommandPayload::HttpGetJson { url } => Ok(CommandResult::HttpGetJson(
            http_get::run(http, url).await,
        )),
    };

    // Must not outlive execution on any exit path.
    heartbeats.abort();
    outcome
}

/// Heartbeat on a fixed period and on every progress tick, bound to the
/// executing command.
async fn in_flight_heartbeats(
    client: ServerClient,
    agent: AgentId,
    command_id: CommandId,
    mut progress: mpsc::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(IN_FLIGHT_HEARTBEAT_PERIOD);
    // The interval fires immediately; the poll loop already heartbeated.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                client.heartbeat(&agent, Some(command_id)).await;
            }
            tick = progress.recv() => match tick {
                Some(()) => client.heartbeat(&agent, Some(command_id)).await,
                // Executor dropped its sender; execution is winding down.
                None => return,
            },
        }
    }
}
