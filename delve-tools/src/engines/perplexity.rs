//! Perplexity: conversational search returning an answer plus citations.

use super::{api_key, base_url, display_host, http_client, json_body, transport_error};
use async_trait::async_trait;
use delve_core::config::EngineConfig;
use delve_core::error::EngineError;
use delve_core::research::search::{EngineKind, SearchEngine, SearchParams, SearchResult};
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

const NAME: &str = "perplexity";
const DEFAULT_BASE_URL: &str = "https://api.perplexity.ai";
const DEFAULT_MODEL: &str = "sonar";

pub struct PerplexityEngine {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_results: usize,
    timeout: Duration,
}

impl PerplexityEngine {
    /// Fails with `MissingApiKey` when the configured env var is unset.
    pub fn new(config: &EngineConfig, timeout: Duration) -> Result<Self, EngineError> {
        let key = api_key(NAME, &config.api_key_env)?;
        Self::with_key(config, key, timeout)
    }

    pub fn with_key(config: &EngineConfig, api_key: String, timeout: Duration) -> Result<Self, EngineError> {
        Ok(Self {
            client: http_client(NAME, timeout)?,
            base_url: base_url(config.base_url.as_deref(), DEFAULT_BASE_URL),
            api_key,
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            max_results: config.max_results,
            timeout,
        })
    }

    fn request_body(&self, query: &str, params: &SearchParams) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": [
                {
                    "role": "system",
                    "content": "Answer the research question precisely and cite your sources."
                },
                { "role": "user", "content": query }
            ],
        });
        if params.time_sensitive {
            body["search_recency_filter"] = json!("month");
        }
        body
    }
}

/// Parse a chat completion into one aggregated answer and its citations.
///
/// Citations come from `search_results` (`{title, url}`) when present,
/// otherwise from the bare `citations` URL list.
pub fn parse_response(body: &Value, max_results: usize) -> Result<Vec<SearchResult>, EngineError> {
    let answer = body
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::Parse {
            engine: NAME.to_string(),
            message: "response has no choices[0].message.content".to_string(),
        })?;

    let mut results = Vec::new();
    if !answer.trim().is_empty() {
        results.push(SearchResult::aggregated_answer(NAME, answer.trim()));
    }

    let mut seen: Vec<String> = Vec::new();
    let mut push_citation = |url: &str, title: &str| {
        let url = url.trim();
        if url.is_empty() || seen.iter().any(|u| u == url) || seen.len() >= max_results {
            return;
        }
        seen.push(url.to_string());
        let title = if title.trim().is_empty() {
            display_host(url)
        } else {
            title.trim().to_string()
        };
        results.push(SearchResult::citation(NAME, url, title));
    };

    if let Some(items) = body.get("search_results").and_then(Value::as_array) {
        for item in items {
            if let Some(url) = item.get("url").and_then(Value::as_str) {
                let title = item.get("title").and_then(Value::as_str).unwrap_or("");
                push_citation(url, title);
            }
        }
    } else if let Some(urls) = body.get("citations").and_then(Value::as_array) {
        for url in urls.iter().filter_map(Value::as_str) {
            push_citation(url, "");
        }
    }
    Ok(results)
}

#[async_trait]
impl SearchEngine for PerplexityEngine {
    fn name(&self) -> &str {
        NAME
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Conversational
    }

    async fn search(&self, query: &str, params: &SearchParams) -> Result<Vec<SearchResult>, EngineError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.request_body(query, params))
            .send()
            .await
            .map_err(|e| transport_error(NAME, e, self.timeout))?;
        let body = json_body(NAME, response, self.timeout).await?;
        let results = parse_response(&body, params.max_results.min(self.max_results))?;
        debug!(query, results = results.len(), "Perplexity search complete");
        Ok(results)
    }
}
