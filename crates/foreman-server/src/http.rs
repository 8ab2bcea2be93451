//! HTTP surface for the control server.
//!
//! Uses axum to expose the client-facing submission/query API and the
//! agent-facing coordination API. Handlers hold the store lock only for
//! the duration of one store call; all coordination guarantees live in
//! the store transactions, not up here. The one piece of protocol logic
//! that belongs to this layer is idempotent-replay acknowledgement for
//! result reports.

use std::sync::{Arc, Mutex, MutexGuard};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use tracing::{info, warn};

use foreman_types::wire::{
    validate_submission, CommandView, ErrorBody, FetchRequest, FetchResponse, HealthResponse,
    HeartbeatRequest, HeartbeatResponse, ListResponse, ResultRequest, ResultResponse,
    SubmitResponse, SyncRequest, SyncResponse,
};
use foreman_types::{Command, CommandId, CommandStatus, ForemanError};

use crate::store::CommandStore;

/// Shared state for HTTP handlers.
pub struct AppState {
    store: Mutex<CommandStore>,
}

impl AppState {
    pub fn new(store: CommandStore) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }

    fn store(&self) -> MutexGuard<'_, CommandStore> {
        self.store.lock().expect("command store mutex poisoned")
    }

    /// Run one stale-reclamation pass. Used by the reclaim task.
    pub fn reclaim_stale(
        &self,
        cutoff: chrono::DateTime<Utc>,
        now: chrono::DateTime<Utc>,
    ) -> Result<usize, ForemanError> {
        self.store().reclaim_stale(cutoff, now)
    }
}

/// Build the full router over both API surfaces.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/commands", post(submit_command).get(list_commands))
        .route("/commands/{id}", get(get_command))
        .route("/health", get(health))
        .route("/agent/fetch", post(agent_fetch))
        .route("/agent/result", post(agent_result))
        .route("/agent/sync", post(agent_sync))
        .route("/agent/heartbeat", post(agent_heartbeat))
        .with_state(state)
}

fn store_error(err: ForemanError) -> Response {
    warn!(error = %err, "store operation failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody::new(err.to_string())),
    )
        .into_response()
}

async fn submit_command(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let payload = match validate_submission(&body) {
        Ok(payload) => payload,
        Err(message) => {
            return (StatusCode::BAD_REQUEST, Json(ErrorBody::new(message))).into_response()
        }
    };

    let command = Command::new(payload, Utc::now());
    if let Err(e) = state.store().insert_command(&command) {
        return store_error(e);
    }

    info!(command_id = %command.id, kind = command.kind().as_str(), "command submitted");
    (
        StatusCode::CREATED,
        Json(SubmitResponse {
            command_id: command.id,
        }),
    )
        .into_response()
}

async fn get_command(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let Ok(id) = CommandId::parse(&id) else {
        return not_found(&id);
    };

    match state.store().get_command(&id) {
        Ok(Some(cmd)) => (StatusCode::OK, Json(CommandView::from(&cmd))).into_response(),
        Ok(None) => not_found(&id.to_string()),
        Err(e) => store_error(e),
    }
}

async fn list_commands(State(state): State<Arc<AppState>>) -> Response {
    match state.store().list_commands() {
        Ok(commands) => (StatusCode::OK, Json(ListResponse { commands })).into_response(),
        Err(e) => store_error(e),
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    let pending = match state.store().count_pending() {
        Ok(n) => n,
        Err(e) => return store_error(e),
    };
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
            timestamp: Utc::now(),
            pending_commands: pending,
        }),
    )
        .into_response()
}

async fn agent_fetch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FetchRequest>,
) -> Response {
    match state.store().assign_next_to(&req.agent_id, Utc::now()) {
        Ok(command) => {
            if let Some(cmd) = &command {
                info!(command_id = %cmd.id, agent_id = %req.agent_id, "command assigned");
            }
            (StatusCode::OK, Json(FetchResponse { command })).into_response()
        }
        Err(e) => store_error(e),
    }
}

async fn agent_result(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ResultRequest>,
) -> Response {
    if !req.status.is_terminal() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody::new(format!(
                "status must be COMPLETED or FAILED, got {}",
                req.status
            ))),
        )
            .into_response();
    }

    if req.requeue {
        return requeue_report(&state, &req);
    }

    let now = Utc::now();
    let applied = match state.store().complete(
        &req.command_id,
        &req.agent_id,
        req.status,
        req.result.clone(),
        req.error.clone(),
        now,
    ) {
        Ok(applied) => applied,
        Err(e) => return store_error(e),
    };

    if applied {
        info!(
            command_id = %req.command_id,
            agent_id = %req.agent_id,
            status = %req.status,
            "result recorded"
        );
        return acknowledged(None);
    }

    // The store refused: either the command is gone, someone else owns it,
    // or this is a replay of a report we already applied.
    match state.store().get_command(&req.command_id) {
        Ok(None) => not_found(&req.command_id.to_string()),
        Ok(Some(cmd))
            if cmd.status == req.status && cmd.owner.as_ref() == Some(&req.agent_id) =>
        {
            acknowledged(Some("duplicate report ignored".to_string()))
        }
        Ok(Some(cmd)) => conflict(format!(
            "command {} is {} and not reportable by {}",
            req.command_id, cmd.status, req.agent_id
        )),
        Err(e) => store_error(e),
    }
}

/// Crash-recovery report: FAILED with the requeue flag returns the
/// command to Pending instead of failing it.
fn requeue_report(state: &AppState, req: &ResultRequest) -> Response {
    if req.status != CommandStatus::Failed {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody::new("requeue is only valid on a FAILED report")),
        )
            .into_response();
    }

    let applied = match state
        .store()
        .requeue_for(&req.command_id, &req.agent_id, Utc::now())
    {
        Ok(applied) => applied,
        Err(e) => return store_error(e),
    };

    if applied {
        info!(
            command_id = %req.command_id,
            agent_id = %req.agent_id,
            "command requeued after agent restart"
        );
        return acknowledged(Some("requeued for retry".to_string()));
    }

    match state.store().get_command(&req.command_id) {
        Ok(None) => not_found(&req.command_id.to_string()),
        Ok(Some(cmd)) => {
            // A replay only when this agent's earlier report is what made
            // the command Pending; Pending for any other reason (stale
            // reclaim, a later owner's requeue) is still a conflict.
            if cmd.status == CommandStatus::Pending {
                match state.store().requeued_by(&req.command_id) {
                    Ok(Some(by)) if by == req.agent_id => {
                        return acknowledged(Some("already requeued".to_string()));
                    }
                    Ok(_) => {}
                    Err(e) => return store_error(e),
                }
            }
            conflict(format!(
                "command {} is {} and cannot be requeued by {}",
                req.command_id, cmd.status, req.agent_id
            ))
        }
        Err(e) => store_error(e),
    }
}

async fn agent_sync(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SyncRequest>,
) -> Response {
    match state.store().get_running_for(&req.agent_id) {
        Ok(unfinished_command) => {
            if let Some(cmd) = &unfinished_command {
                info!(command_id = %cmd.id, agent_id = %req.agent_id, "sync found unfinished command");
            }
            (
                StatusCode::OK,
                Json(SyncResponse { unfinished_command }),
            )
                .into_response()
        }
        Err(e) => store_error(e),
    }
}

async fn agent_heartbeat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HeartbeatRequest>,
) -> Response {
    // Heartbeats never fail hard: log and acknowledge regardless.
    if let Err(e) = state
        .store()
        .touch_heartbeat(&req.agent_id, req.command_id, Utc::now())
    {
        warn!(agent_id = %req.agent_id, error = %e, "heartbeat not recorded");
    }
    (
        StatusCode::OK,
        Json(HeartbeatResponse { acknowledged: true }),
    )
        .into_response()
}

fn acknowledged(message: Option<String>) -> Response {
    (
        StatusCode::OK,
        Json(ResultResponse {
            acknowledged: true,
            message,
        }),
    )
        .into_response()
}

fn conflict(message: String) -> Response {
    (StatusCode::CONFLICT, Json(ErrorBody::new(message))).into_response()
}

fn not_found(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody::new(format!("no such command: {id}"))),
    )
        .into_response()
}
