//! Exa: neural search returning ranked pages with text excerpts.

use super::{api_key, base_url, http_client, json_body, transport_error};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use delve_core::config::EngineConfig;
use delve_core::error::EngineError;
use delve_core::research::search::{EngineKind, SearchEngine, SearchParams, SearchResult};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

const NAME: &str = "exa";
const DEFAULT_BASE_URL: &str = "https://api.exa.ai";
const MAX_TEXT_CHARS: usize = 2_000;
/// How far back a time-sensitive search reaches.
const RECENT_DAYS: i64 = 365;

pub struct ExaEngine {
    client: Client,
    base_url: String,
    api_key: String,
    max_results: usize,
    timeout: Duration,
}

#[derive(Deserialize)]
struct ExaResponse {
    #[serde(default)]
    results: Vec<ExaResult>,
}

#[derive(Deserialize)]
struct ExaResult {
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    score: Option<f64>,
}

impl ExaEngine {
    pub fn new(config: &EngineConfig, timeout: Duration) -> Result<Self, EngineError> {
        let key = api_key(NAME, &config.api_key_env)?;
        Self::with_key(config, key, timeout)
    }

    pub fn with_key(config: &EngineConfig, api_key: String, timeout: Duration) -> Result<Self, EngineError> {
        Ok(Self {
            client: http_client(NAME, timeout)?,
            base_url: base_url(config.base_url.as_deref(), DEFAULT_BASE_URL),
            api_key,
            max_results: config.max_results,
            timeout,
        })
    }

    fn request_body(&self, query: &str, params: &SearchParams) -> Value {
        let mut body = json!({
            "query": query,
            "numResults": params.max_results.min(self.max_results),
            "type": "neural",
            "contents": { "text": { "maxCharacters": MAX_TEXT_CHARS } },
        });
        if params.time_sensitive {
            let since = Utc::now() - ChronoDuration::days(RECENT_DAYS);
            body["startPublishedDate"] = json!(since.format("%Y-%m-%dT00:00:00.000Z").to_string());
        }
        body
    }
}

/// Parse `/search` results. Entries without a URL are rejected by serde,
/// blank titles fall back to the URL.
pub fn parse_response(body: Value, max_results: usize) -> Result<Vec<SearchResult>, EngineError> {
    let response: ExaResponse = serde_json::from_value(body).map_err(|e| EngineError::Parse {
        engine: NAME.to_string(),
        message: e.to_string(),
    })?;
    Ok(response
        .results
        .into_iter()
        .filter(|r| !r.url.trim().is_empty())
        .take(max_results)
        .map(|r| {
            let title = r
                .title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| r.url.clone());
            SearchResult::result(NAME, r.url, title, r.text.unwrap_or_default())
                .with_score(r.score.unwrap_or(0.0))
        })
        .collect())
}

#[async_trait]
impl SearchEngine for ExaEngine {
    fn name(&self) -> &str {
        NAME
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Neural
    }

    async fn search(&self, query: &str, params: &SearchParams) -> Result<Vec<SearchResult>, EngineError> {
        let response = self
            .client
            .post(format!("{}/search", self.base_url))
            .header("x-api-key", &self.api_key)
            .json(&self.request_body(query, params))
            .send()
            .await
            .map_err(|e| transport_error(NAME, e, self.timeout))?;
        let body = json_body(NAME, response, self.timeout).await?;
        let results = parse_response(body, params.max_results.min(self.max_results))?;
        debug!(query, results = results.len(), "Exa search complete");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use delve_core::config::EnginesConfig;

    #[test]
    fn test_parse_results() {
        let body = json!({
            "results": [
                {"url": "https://a.example/1", "title": "Sodium cells", "text": "Sodium ion...", "score": 0.82},
                {"url": "https://b.example/2", "title": "  "},
                {"url": "https://c.example/3", "title": "Third"}
            ]
        });
        let results = parse_response(body, 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].title, "Sodium cells");
        assert_eq!(results[0].score, 0.82);
        assert_eq!(results[1].title, "https://b.example/2");
        assert_eq!(results[1].text, "");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let err = parse_response(json!({"results": [{"title": "no url"}]}), 5).unwrap_err();
        assert!(matches!(err, EngineError::Parse { .. }));
    }

    #[test]
    fn test_parse_empty_body() {
        assert!(parse_response(json!({}), 5).unwrap().is_empty());
    }

    #[test]
    fn test_request_body() {
        let engine =
            ExaEngine::with_key(&EnginesConfig::default().neural, "k".into(), Duration::from_secs(5))
                .unwrap();
        let body = engine.request_body(
            "solid state batteries",
            &SearchParams {
                max_results: 50,
                time_sensitive: false,
            },
        );
        assert_eq!(body["numResults"], 10);
        assert_eq!(body["type"], "neural");
        assert_eq!(body["contents"]["text"]["maxCharacters"], 2000);
        assert!(body.get("startPublishedDate").is_none());
    }
}
