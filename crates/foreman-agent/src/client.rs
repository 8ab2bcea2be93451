//! Typed HTTP client for the server's agent-facing API.
//!
//! Coordination calls (fetch, sync, result) retry with exponential
//! backoff; a 409 is permanent and surfaces immediately. Heartbeats are
//! fire-and-forget: one attempt, failures logged and dropped.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use foreman_types::wire::{
    ErrorBody, FetchRequest, FetchResponse, HeartbeatRequest, HeartbeatResponse, ResultRequest,
    ResultResponse, SyncRequest, SyncResponse,
};
use foreman_types::{AgentId, Command, CommandId, ForemanError};

/// Attempts per coordination call.
const RETRY_ATTEMPTS: u32 = 3;

/// Delay before the first retry; doubles each attempt.
const RETRY_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Client for the control server's agent API.
#[derive(Clone)]
pub struct ServerClient {
    http: reqwest::Client,
    base_url: String,
}

impl ServerClient {
    /// Create a client targeting the given base URL.
    pub fn new(base_url: &str) -> Result<Self, ForemanError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("foreman-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ForemanError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Ask for work: the already-assigned command, or a fresh assignment.
    pub async fn fetch_next(&self, agent: &AgentId) -> Result<Option<Command>, ForemanError> {
        let req = FetchRequest {
            agent_id: agent.clone(),
        };
        let resp: FetchResponse = self.post_with_retry("/agent/fetch", &req).await?;
        Ok(resp.command)
    }

    /// Startup sync: any command the server still believes we hold.
    pub async fn sync(&self, agent: &AgentId) -> Result<Option<Command>, ForemanError> {
        let req = SyncRequest {
            agent_id: agent.clone(),
        };
        let resp: SyncResponse = self.post_with_retry("/agent/sync", &req).await?;
        Ok(resp.unfinished_command)
    }

    /// Report a terminal result (or a crash-recovery requeue).
    pub async fn report_result(
        &self,
        report: &ResultRequest,
    ) -> Result<ResultResponse, ForemanError> {
        self.post_with_retry("/agent/result", report).await
    }

    /// Fire-and-forget liveness signal. Never blocks progress on failure.
    pub async fn heartbeat(&self, agent: &AgentId, current: Option<CommandId>) {
        let req = HeartbeatRequest {
            agent_id: agent.clone(),
            command_id: current,
        };
        match self
            .post_once::<_, HeartbeatResponse>("/agent/heartbeat", &req)
            .await
        {
            Ok(_) => {}
            Err(e) => debug!(error = %e, "heartbeat dropped"),
        }
    }

    async fn post_once<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ForemanError> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await
            .map_err(|e| ForemanError::Transport(format!("{path}: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(|e| {
                ForemanError::Transport(format!("{path}: invalid response body: {e}"))
            });
        }

        let message = response
            .json::<ErrorBody>()
            .await
            .map(|b| b.error)
            .unwrap_or_else(|_| status.to_string());

        if status == reqwest::StatusCode::CONFLICT {
            Err(ForemanError::Conflict(message))
        } else if status.is_client_error() {
            Err(ForemanError::Validation(format!("{path}: {message}")))
        } else {
            Err(ForemanError::Transport(format!(
                "{path}: server returned {status}: {message}"
            )))
        }
    }

    /// Retry transient transport failures with exponential backoff.
    /// Conflicts and request errors are permanent and surface at once.
    async fn post_with_retry<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ForemanError> {
        let mut delay = RETRY_INITIAL_DELAY;
        let mut last_error = None;

        for attempt in 1..=RETRY_ATTEMPTS {
            match self.post_once(path, body).await {
                Ok(value) => return Ok(value),
                Err(e @ ForemanError::Transport(_)) => {
                    warn!(path, attempt, error = %e, "request failed");
                    last_error = Some(e);
                    if attempt < RETRY_ATTEMPTS {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| ForemanError::Transport(format!("{path}: retries exhausted"))))
    }
}
