//! DuckDuckGo instant answer API. Needs no API key.

use super::{base_url, http_client, json_body, transport_error};
use async_trait::async_trait;
use delve_core::config::EngineConfig;
use delve_core::error::EngineError;
use delve_core::research::search::{EngineKind, SearchEngine, SearchParams, SearchResult};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const NAME: &str = "duckduckgo";
const DEFAULT_BASE_URL: &str = "https://api.duckduckgo.com";

pub struct DuckDuckGoEngine {
    client: Client,
    base_url: String,
    max_results: usize,
    timeout: Duration,
}

impl DuckDuckGoEngine {
    pub fn new(config: &EngineConfig, timeout: Duration) -> Result<Self, EngineError> {
        Ok(Self {
            client: http_client(NAME, timeout)?,
            base_url: base_url(config.base_url.as_deref(), DEFAULT_BASE_URL),
            max_results: config.max_results,
            timeout,
        })
    }

    fn request_url(&self, query: &str) -> String {
        format!(
            "{}/?q={}&format=json&no_html=1&skip_disambig=1",
            self.base_url,
            urlencoding::encode(query)
        )
    }
}

/// Split a topic's `Text` into a title (before " - ") and the full text.
fn topic_title(text: &str) -> String {
    text.split(" - ").next().unwrap_or(text).trim().to_string()
}

fn push_topic(topic: &Value, results: &mut Vec<SearchResult>) {
    let text = topic.get("Text").and_then(Value::as_str).unwrap_or("").trim();
    let url = topic.get("FirstURL").and_then(Value::as_str).unwrap_or("").trim();
    if text.is_empty() || url.is_empty() {
        return;
    }
    results.push(SearchResult::result(NAME, url, topic_title(text), text));
}

/// Parse the abstract, `Results` and `RelatedTopics` (including grouped
/// topics) into results, deduplicated by URL.
pub fn parse_response(body: &Value, max_results: usize) -> Vec<SearchResult> {
    let mut results = Vec::new();

    let abstract_text = body.get("AbstractText").and_then(Value::as_str).unwrap_or("").trim();
    let abstract_url = body.get("AbstractURL").and_then(Value::as_str).unwrap_or("").trim();
    if !abstract_text.is_empty() && !abstract_url.is_empty() {
        let title = body
            .get("Heading")
            .and_then(Value::as_str)
            .filter(|h| !h.trim().is_empty())
            .or_else(|| body.get("AbstractSource").and_then(Value::as_str))
            .unwrap_or(abstract_url);
        results.push(SearchResult::result(NAME, abstract_url, title, abstract_text));
    }

    for item in body.get("Results").and_then(Value::as_array).into_iter().flatten() {
        push_topic(item, &mut results);
    }

    for topic in body.get("RelatedTopics").and_then(Value::as_array).into_iter().flatten() {
        match topic.get("Topics").and_then(Value::as_array) {
            Some(group) => group.iter().for_each(|t| push_topic(t, &mut results)),
            None => push_topic(topic, &mut results),
        }
    }

    let mut seen = std::collections::HashSet::new();
    results.retain(|r| r.url.as_ref().is_some_and(|u| seen.insert(u.clone())));
    results.truncate(max_results);
    results
}

#[async_trait]
impl SearchEngine for DuckDuckGoEngine {
    fn name(&self) -> &str {
        NAME
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Keyword
    }

    async fn search(&self, query: &str, params: &SearchParams) -> Result<Vec<SearchResult>, EngineError> {
        let response = self
            .client
            .get(self.request_url(query))
            .send()
            .await
            .map_err(|e| transport_error(NAME, e, self.timeout))?;
        let body = json_body(NAME, response, self.timeout).await?;
        let results = parse_response(&body, params.max_results.min(self.max_results));
        debug!(query, results = results.len(), "DuckDuckGo search complete");
        Ok(results)
    }
}
