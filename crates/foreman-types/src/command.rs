//! The command state machine: payloads, statuses, results, and liveness.
//!
//! A command travels `Pending -> Running -> {Completed, Failed}`, with
//! reclamation returning a Running command to Pending when its owner goes
//! quiet. Commands are never deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, CommandId};

/// The kind of work a command represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    /// Sleep for a fixed number of milliseconds.
    #[serde(rename = "DELAY")]
    Delay,
    /// Issue an HTTP GET and capture the (possibly truncated) JSON body.
    #[serde(rename = "HTTP_GET_JSON")]
    HttpGetJson,
}

impl CommandKind {
    /// Stable wire/storage string for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Delay => "DELAY",
            CommandKind::HttpGetJson => "HTTP_GET_JSON",
        }
    }
}

/// Kind-tagged command input, matching the submission wire shape
/// `{"type": "...", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CommandPayload {
    #[serde(rename = "DELAY")]
    Delay {
        /// Milliseconds to sleep. Must be positive.
        ms: u64,
    },
    #[serde(rename = "HTTP_GET_JSON")]
    HttpGetJson {
        /// Absolute http(s) URL to fetch.
        url: String,
    },
}

impl CommandPayload {
    /// The kind this payload belongs to.
    pub fn kind(&self) -> CommandKind {
        match self {
            CommandPayload::Delay { .. } => CommandKind::Delay,
            CommandPayload::HttpGetJson { .. } => CommandKind::HttpGetJson,
        }
    }
}

/// Lifecycle state of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
}

impl CommandStatus {
    /// Stable wire/storage string for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "PENDING",
            CommandStatus::Running => "RUNNING",
            CommandStatus::Completed => "COMPLETED",
            CommandStatus::Failed => "FAILED",
        }
    }

    /// Parse the storage string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(CommandStatus::Pending),
            "RUNNING" => Some(CommandStatus::Running),
            "COMPLETED" => Some(CommandStatus::Completed),
            "FAILED" => Some(CommandStatus::Failed),
            _ => None,
        }
    }

    /// Whether this status is terminal (Completed or Failed).
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandStatus::Completed | CommandStatus::Failed)
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a Delay command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayOutcome {
    /// Always true for a delay that ran to completion.
    pub ok: bool,
    /// Wall-clock milliseconds actually slept.
    pub took_ms: u64,
}

/// Outcome of an HttpGetJson command.
///
/// A transport failure is still a valid outcome: `status` is 0, `body` is
/// absent, and `error` carries the message. The command completes either way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpOutcome {
    /// HTTP status code, or 0 on transport failure.
    pub status: u16,
    /// Parsed JSON body, or the body text (truncated if oversize).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    /// True when the body exceeded the size cap and was cut to a prefix.
    pub truncated: bool,
    /// Byte length of the full body before any truncation.
    pub bytes_returned: u64,
    /// Transport-level error message, if the request never got a response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a command that failed inside the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureOutcome {
    /// Human-readable failure reason.
    pub error: String,
}

/// Kind-tagged terminal result of a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandResult {
    Delay(DelayOutcome),
    HttpGetJson(HttpOutcome),
    Failure(FailureOutcome),
}

impl CommandResult {
    /// Fold an optional executor error into an optional result, as recorded
    /// at completion time. An error supersedes any partial result.
    pub fn fold(result: Option<CommandResult>, error: Option<String>) -> Option<CommandResult> {
        match error {
            Some(error) => Some(CommandResult::Failure(FailureOutcome { error })),
            None => result,
        }
    }
}

/// The central entity: one unit of work and its full lifecycle record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: CommandId,
    #[serde(flatten)]
    pub payload: CommandPayload,
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CommandResult>,
    /// Agent currently (or most recently) holding this command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<AgentId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Command {
    /// Create a fresh Pending command at submission time.
    pub fn new(payload: CommandPayload, now: DateTime<Utc>) -> Self {
        Self {
            id: CommandId::generate(),
            payload,
            status: CommandStatus::Pending,
            result: None,
            owner: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// The kind of this command.
    pub fn kind(&self) -> CommandKind {
        self.payload.kind()
    }
}

/// Per-agent liveness record mirrored on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentLiveness {
    pub agent_id: AgentId,
    pub last_heartbeat: DateTime<Utc>,
    /// What the server believes the agent is working on. May lag the
    /// command table by one transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_command: Option<CommandId>,
}
