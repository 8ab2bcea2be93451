//! HttpGetJson executor: fetch a URL and capture a bounded JSON body.
//!
//! The HTTP call is the command's purpose, so a non-2xx status, a parse
//! failure, or even a transport failure is a valid *outcome* -- the
//! command still completes, with the failure described in the result.

use std::time::Duration;

use tracing::debug;

use foreman_types::HttpOutcome;

/// Cap on the captured body; anything beyond is cut to this prefix.
pub const MAX_BODY_SIZE: usize = 10 * 1024;

/// Overall deadline for the request, including reading the body.
const REQUEST_DEADLINE: Duration = Duration::from_secs(30);

/// Appended to a text body that was cut at [`MAX_BODY_SIZE`].
const TRUNCATION_MARKER: &str = "... [truncated]";

/// Issue the GET and shape the outcome.
pub async fn run(http: &reqwest::Client, url: &str) -> HttpOutcome {
    let response = match http
        .get(url)
        .header(reqwest::header::ACCEPT, "application/json")
        .timeout(REQUEST_DEADLINE)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => return transport_failure(format!("request failed: {e}")),
    };

    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => return transport_failure(format!("failed to read body: {e}")),
    };

    let bytes_returned = bytes.len() as u64;
    let truncated = bytes.len() > MAX_BODY_SIZE;
    let prefix = &bytes[..bytes.len().min(MAX_BODY_SIZE)];

    let body = if content_type.contains("application/json") {
        match serde_json::from_slice::<serde_json::Value>(prefix) {
            Ok(value) => value,
            Err(e) => {
                debug!(url, error = %e, "body declared JSON but did not parse");
                text_body(prefix, truncated)
            }
        }
    } else {
        text_body(prefix, truncated)
    };

    HttpOutcome {
        status,
        body: Some(body),
        truncated,
        bytes_returned,
        error: None,
    }
}

fn text_body(prefix: &[u8], truncated: bool) -> serde_json::Value {
    let mut text = String::from_utf8_lossy(prefix).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    serde_json::Value::String(text)
}

fn transport_failure(message: String) -> HttpOutcome {
    HttpOutcome {
        status: 0,
        body: None,
        truncated: false,
        bytes_returned: 0,
        error: Some(message),
    }
}
