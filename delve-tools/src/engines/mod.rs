//! Search engine adapters.
//!
//! Each adapter keeps HTTP and response parsing apart: `parse_response`
//! functions are pure and take the decoded JSON body.

pub mod duckduckgo;
pub mod exa;
pub mod perplexity;

pub use duckduckgo::DuckDuckGoEngine;
pub use exa::ExaEngine;
pub use perplexity::PerplexityEngine;

use delve_core::error::EngineError;
use reqwest::{Client, Response};
use serde_json::Value;
use std::time::Duration;

/// Longest error body kept in an `EngineError::Status`.
const MAX_ERROR_BODY: usize = 500;

pub(crate) const USER_AGENT: &str = concat!("Delve/", env!("CARGO_PKG_VERSION"));

pub(crate) fn http_client(engine: &str, timeout: Duration) -> Result<Client, EngineError> {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| EngineError::Request {
            engine: engine.to_string(),
            message: format!("Failed to create HTTP client: {e}"),
        })
}

/// Read the API key from `env_var`.
pub(crate) fn api_key(engine: &str, env_var: &str) -> Result<String, EngineError> {
    std::env::var(env_var)
        .ok()
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| EngineError::MissingApiKey {
            engine: engine.to_string(),
            env_var: env_var.to_string(),
        })
}

pub(crate) fn transport_error(engine: &str, err: reqwest::Error, timeout: Duration) -> EngineError {
    if err.is_timeout() {
        EngineError::Timeout {
            engine: engine.to_string(),
            timeout_secs: timeout.as_secs(),
        }
    } else {
        EngineError::Request {
            engine: engine.to_string(),
            message: err.to_string(),
        }
    }
}

/// Decode a JSON body, turning non-2xx statuses into `EngineError::Status`.
pub(crate) async fn json_body(
    engine: &str,
    response: Response,
    timeout: Duration,
) -> Result<Value, EngineError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(EngineError::Status {
            engine: engine.to_string(),
            status: status.as_u16(),
            body: body.chars().take(MAX_ERROR_BODY).collect(),
        });
    }
    let text = response
        .text()
        .await
        .map_err(|e| transport_error(engine, e, timeout))?;
    serde_json::from_str(&text).map_err(|e| EngineError::Parse {
        engine: engine.to_string(),
        message: e.to_string(),
    })
}

/// Base URL override without a trailing slash.
pub(crate) fn base_url(configured: Option<&str>, default: &str) -> String {
    configured
        .unwrap_or(default)
        .trim_end_matches('/')
        .to_string()
}

/// Host of `url` without a `www.` prefix, or the url itself when it does not parse.
pub(crate) fn display_host(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_string()))
        .unwrap_or_else(|| url.to_string())
}
