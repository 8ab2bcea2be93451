//! The agent poll loop.
//!
//! Single-threaded cooperative: at most one command executes at a time.
//! Each tick heartbeats, asks for work, executes, and reports. Transport
//! failures abandon the current cycle; the next tick retries. Startup
//! first resolves any command left over from a previous run.

use tracing::{info, warn};

use foreman_types::wire::ResultRequest;
use foreman_types::{AgentConfig, AgentId, Command, CommandStatus, ForemanError};

use crate::client::ServerClient;
use crate::executor;
use crate::identity;

/// Exit code used by injected crashes, distinguishable from clean exits.
const INJECTED_CRASH_EXIT_CODE: i32 = 42;

/// Probability of an injected crash at each labelled point.
const INJECTED_CRASH_PROBABILITY: f64 = 0.2;

/// Run the agent until the kill-after threshold (if any) is reached.
pub async fn run(config: AgentConfig) -> anyhow::Result<()> {
    let agent_id = identity::load_or_create(&config.data_path)?;
    let client = ServerClient::new(&config.server_url)?;
    let fault = FaultInjector::new(config.random_failures);

    info!(
        agent_id = %agent_id,
        server = %config.server_url,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        "agent starting"
    );

    recover_unfinished(&client, &agent_id).await;

    let executor_http = reqwest::Client::builder()
        .user_agent(concat!("foreman-agent/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ForemanError::Transport(format!("failed to build HTTP client: {e}")))?;

    let mut polls: u64 = 0;
    loop {
        polls += 1;
        if let Some(limit) = config.kill_after {
            if polls > limit {
                info!(polls = polls - 1, "kill-after threshold reached, exiting");
                return Ok(());
            }
        }

        // Idle liveness signal; the in-flight heartbeat takes over while
        // a command executes.
        client.heartbeat(&agent_id, None).await;

        let command = match client.fetch_next(&agent_id).await {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "fetch failed, abandoning this cycle");
                tokio::time::sleep(config.poll_interval).await;
                continue;
            }
        };

        let Some(command) = command else {
            tokio::time::sleep(config.poll_interval).await;
            continue;
        };

        fault.maybe_crash("after-fetch");
        execute_and_report(&client, &executor_http, &agent_id, &command, &fault).await;
        fault.maybe_crash("after-report");
    }
}

/// Startup sync: if the server still holds a command for this identity,
/// hand it back for retry without re-executing. We cannot tell whether
/// the previous run executed it before dying.
async fn recover_unfinished(client: &ServerClient, agent_id: &AgentId) {
    let unfinished = match client.sync(agent_id).await {
        Ok(unfinished) => unfinished,
        Err(e) => {
            warn!(error = %e, "startup sync failed; continuing to poll");
            return;
        }
    };

    let Some(command) = unfinished else {
        return;
    };

    warn!(
        command_id = %command.id,
        "found unfinished command from a previous run, requeueing without re-execution"
    );

    let report = ResultRequest {
        agent_id: agent_id.clone(),
        command_id: command.id,
        status: CommandStatus::Failed,
        result: None,
        error: Some("agent restarted before completion; outcome unknown".to_string()),
        requeue: true,
    };

    match client.report_result(&report).await {
        Ok(ack) => info!(
            command_id = %command.id,
            message = ack.message.as_deref().unwrap_or(""),
            "unfinished command handed back"
        ),
        Err(e) => warn!(
            command_id = %command.id,
            error = %e,
            "failed to hand back unfinished command; stale reclaim will recover it"
        ),
    }
}

async fn execute_and_report(
    client: &ServerClient,
    http: &reqwest::Client,
    agent_id: &AgentId,
    command: &Command,
    fault: &FaultInjector,
) {
    info!(command_id = %command.id, kind = command.kind().as_str(), "executing command");

    let outcome = executor::execute(client, http, agent_id, command).await;
    fault.maybe_crash("before-report");

    let report = match outcome {
        Ok(result) => ResultRequest {
            agent_id: agent_id.clone(),
            command_id: command.id,
            status: CommandStatus::Completed,
            result: Some(result),
            error: None,
            requeue: false,
        },
        Err(message) => ResultRequest {
            agent_id: agent_id.clone(),
            command_id: command.id,
            status: CommandStatus::Failed,
            result: None,
            error: Some(message),
            requeue: false,
        },
    };

    match client.report_result(&report).await {
        Ok(_) => info!(command_id = %command.id, status = %report.status, "result reported"),
        Err(ForemanError::Conflict(message)) => {
            // The command was reclaimed out from under us; the server's
            // copy wins and the work will be reassigned.
            warn!(command_id = %command.id, message, "report rejected, command was reclaimed");
        }
        Err(e) => {
            warn!(
                command_id = %command.id,
                error = %e,
                "failed to report result; stale reclaim will recover the command"
            );
        }
    }
}

/// Test hook: with `RANDOM_FAILURES` set, exit the process at labelled
/// points to exercise crash recovery.
struct FaultInjector {
    enabled: bool,
}

impl FaultInjector {
    fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    fn maybe_crash(&self, point: &str) {
        if self.enabled && rand::random::<f64>() < INJECTED_CRASH_PROBABILITY {
            warn!(point, "injected crash");
            std::process::exit(INJECTED_CRASH_EXIT_CODE);
        }
    }
}
