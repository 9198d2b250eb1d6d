//! OpenAI-compatible chat completions provider.
//!
//! Works with OpenAI, Azure OpenAI, Ollama, vLLM, LM Studio and any other
//! endpoint that speaks the `/chat/completions` protocol.

use super::{map_transport_error, with_retry};
use crate::config::{LlmConfig, RetryConfig};
use crate::error::LlmError;
use crate::generator::{CompletionOptions, TextGenerator};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Text generator backed by an OpenAI-compatible chat API.
pub struct OpenAiCompatibleGenerator {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: usize,
    temperature: f32,
    timeout_secs: u64,
    retry: RetryConfig,
}

impl OpenAiCompatibleGenerator {
    /// Create a generator from configuration.
    ///
    /// Local endpoints (localhost / 127.0.0.1) do not require an API key;
    /// remote endpoints fail with `LlmError::AuthFailed` when the key is missing.
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let api_key = match std::env::var(&config.api_key_env) {
            Ok(key) => Some(key),
            Err(_) if is_local_endpoint(&base_url) => None,
            Err(_) => {
                return Err(LlmError::AuthFailed {
                    provider: format!("{} (env var '{}' not set)", config.provider, config.api_key_env),
                });
            }
        };
        Self::build(config, base_url, api_key)
    }

    /// Create a generator with an explicitly provided API key.
    pub fn new_with_key(config: &LlmConfig, api_key: String) -> Result<Self, LlmError> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self::build(config, base_url, Some(api_key))
    }

    fn build(config: &LlmConfig, base_url: String, api_key: Option<String>) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::Connection {
                message: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            timeout_secs: config.timeout_secs,
            retry: config.retry.clone(),
        })
    }

    fn build_request_body(&self, prompt: &str, options: &CompletionOptions) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &options.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": prompt }));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": options.temperature.unwrap_or(self.temperature),
            "max_tokens": options.max_tokens.unwrap_or(self.max_tokens),
        });
        if options.json {
            body["response_format"] = json!({ "type": "json_object" });
        }
        body
    }

    fn parse_response(body: &Value) -> Result<String, LlmError> {
        body["choices"]
            .get(0)
            .and_then(|choice| choice["message"]["content"].as_str())
            .map(str::to_string)
            .ok_or_else(|| LlmError::ResponseParse {
                message: "No choices[0].message.content in response".to_string(),
            })
    }

    fn map_http_error(status: reqwest::StatusCode, body: &str) -> LlmError {
        match status.as_u16() {
            401 | 403 => LlmError::AuthFailed {
                provider: "OpenAI-compatible".to_string(),
            },
            429 => LlmError::RateLimited {
                retry_after_secs: 30,
            },
            500..=599 => LlmError::Connection {
                message: format!("HTTP {}: {}", status, body),
            },
            _ => LlmError::ApiRequest {
                message: format!("HTTP {}: {}", status, body),
            },
        }
    }

    async fn send_once(&self, body: &Value) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.timeout_secs))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| LlmError::ResponseParse {
            message: format!("Failed to read response body: {}", e),
        })?;
        if !status.is_success() {
            return Err(Self::map_http_error(status, &text));
        }

        let json: Value = serde_json::from_str(&text).map_err(|e| LlmError::ResponseParse {
            message: format!("Invalid JSON in response: {}", e),
        })?;
        Self::parse_response(&json)
    }
}

/// Whether a base URL points at a local model server.
fn is_local_endpoint(base_url: &str) -> bool {
    url::Url::parse(base_url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h == "localhost" || h == "127.0.0.1"))
        .unwrap_or(false)
}

#[async_trait]
impl TextGenerator for OpenAiCompatibleGenerator {
    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String, LlmError> {
        let body = self.build_request_body(prompt, options);
        debug!(
            model = self.model.as_str(),
            prompt_chars = prompt.len(),
            "Sending chat completion request"
        );
        let body = &body;
        with_retry(&self.retry, move || self.send_once(body)).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
