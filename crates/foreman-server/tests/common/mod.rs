//! Shared helpers for HTTP-surface integration tests.
//!
//! Each integration test file compiles common/ as its own module, so not
//! every helper is used in every file.
#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use foreman_server::http::{router, AppState};
use foreman_server::CommandStore;

/// Build a router over a fresh in-memory store.
pub fn test_router() -> (Router, Arc<AppState>) {
    let store = CommandStore::open_in_memory().expect("should open in-memory store");
    let state = Arc::new(AppState::new(store));
    (router(state.clone()), state)
}

/// Send a JSON POST and return the response.
pub async fn post_json(app: &Router, uri: &str, body: serde_json::Value) -> Response<Body> {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("should build request");
    app.clone().oneshot(request).await.expect("request should not error")
}

/// Send a GET and return the response.
pub async fn get(app: &Router, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("should build request");
    app.clone().oneshot(request).await.expect("request should not error")
}

/// Read a response body as JSON.
pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("should read body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("body should be JSON")
}

/// Assert status and return the JSON body.
pub async fn expect_json(
    response: Response<Body>,
    expected: StatusCode,
) -> serde_json::Value {
    assert_eq!(response.status(), expected);
    body_json(response).await
}

/// Submit a DELAY command and return its id.
pub async fn submit_delay(app: &Router, ms: u64) -> String {
    let response = post_json(
        app,
        "/commands",
        serde_json::json!({"type": "DELAY", "payload": {"ms": ms}}),
    )
    .await;
    let body = expect_json(response, StatusCode::CREATED).await;
    body["commandId"]
        .as_str()
        .expect("commandId should be a string")
        .to_string()
}

/// Fetch the next command for an agent; returns the `command` field.
pub async fn fetch_for(app: &Router, agent_id: &str) -> serde_json::Value {
    let response = post_json(
        app,
        "/agent/fetch",
        serde_json::json!({"agentId": agent_id}),
    )
    .await;
    let body = expect_json(response, StatusCode::OK).await;
    body["command"].clone()
}
