//! Request/response envelopes for the two HTTP surfaces.
//!
//! Client surface: submit, query, list, health. Agent surface: fetch,
//! result, sync, heartbeat. Field names are camelCase on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandPayload, CommandResult, CommandStatus};
use crate::ids::{AgentId, CommandId};

/// Generic error body: `{"error": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

/// Response to `POST /commands`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub command_id: CommandId,
}

/// Response to `GET /commands/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandView {
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CommandResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
}

impl From<&Command> for CommandView {
    fn from(cmd: &Command) -> Self {
        Self {
            status: cmd.status,
            result: cmd.result.clone(),
            agent_id: cmd.owner.clone(),
        }
    }
}

/// Response to `GET /commands`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse {
    pub commands: Vec<Command>,
}

/// Response to `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub pending_commands: u64,
}

/// Body of `POST /agent/fetch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    pub agent_id: AgentId,
}

/// Response to `POST /agent/fetch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResponse {
    pub command: Option<Command>,
}

/// Body of `POST /agent/result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRequest {
    pub agent_id: AgentId,
    pub command_id: CommandId,
    /// Must be COMPLETED or FAILED.
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CommandResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set by crash recovery: a FAILED report with this flag asks the
    /// server to return the command to Pending instead of failing it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub requeue: bool,
}

/// Response to `POST /agent/result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultResponse {
    pub acknowledged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Body of `POST /agent/sync`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub agent_id: AgentId,
}

/// Response to `POST /agent/sync`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub unfinished_command: Option<Command>,
}

/// Body of `POST /agent/heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub agent_id: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<CommandId>,
}

/// Response to `POST /agent/heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub acknowledged: bool,
}

/// Validate a raw submission body into a typed payload.
///
/// Works on `serde_json::Value` rather than a derived struct so that
/// rejections carry a precise, human-readable message naming the
/// offending field.
pub fn validate_submission(body: &serde_json::Value) -> Result<CommandPayload, String> {
    let obj = body
        .as_object()
        .ok_or_else(|| "request body must be a JSON object".to_string())?;

    let kind = obj
        .get("type")
        .ok_or_else(|| "missing field: type".to_string())?
        .as_str()
        .ok_or_else(|| "type must be a string".to_string())?;

    let payload = obj
        .get("payload")
        .ok_or_else(|| "missing field: payload".to_string())?;

    match kind {
        "DELAY" => {
            let ms = payload
                .get("ms")
                .ok_or_else(|| "missing field: payload.ms".to_string())?;
            let ms = ms
                .as_u64()
                .filter(|&ms| ms > 0)
                .ok_or_else(|| "payload.ms must be a positive integer".to_string())?;
            Ok(CommandPayload::Delay { ms })
        }
        "HTTP_GET_JSON" => {
            let url = payload
                .get("url")
                .ok_or_else(|| "missing field: payload.url".to_string())?
                .as_str()
                .ok_or_else(|| "payload.url must be a string".to_string())?;
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err("payload.url must be an absolute http(s) URL".to_string());
            }
            let rest = url.splitn(2, "://").nth(1).unwrap_or("");
            if rest.is_empty() || rest.starts_with('/') {
                return Err("payload.url must include a host".to_string());
            }
            Ok(CommandPayload::HttpGetJson {
                url: url.to_string(),
            })
        }
        other => Err(format!("unknown command type: {other}")),
    }
}
