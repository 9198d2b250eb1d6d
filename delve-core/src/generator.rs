//! Text generation interface used by every reasoning phase of the pipeline.
//!
//! Intake, planning, query optimization, synthesis and report writing all
//! talk to a [`TextGenerator`]. Concrete HTTP providers live in
//! [`crate::providers`]; [`MockTextGenerator`] is a deterministic stand-in
//! for tests and offline runs.

use crate::error::LlmError;
use async_trait::async_trait;
use std::sync::Mutex;

/// Per-call generation options. Unset fields fall back to provider defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionOptions {
    /// Optional system instruction.
    pub system: Option<String>,
    /// Sampling temperature override.
    pub temperature: Option<f32>,
    /// Output token limit override.
    pub max_tokens: Option<usize>,
    /// Ask the provider for a JSON-only response when it supports that.
    pub json: bool,
}

impl CompletionOptions {
    /// Options for a call whose output is parsed as JSON.
    pub fn json() -> Self {
        Self {
            json: true,
            temperature: Some(0.2),
            ..Self::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// A text-completion collaborator.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Complete a prompt and return the generated text.
    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String, LlmError>;

    /// Return the model name.
    fn model_name(&self) -> &str;
}

/// A scripted generator for testing.
///
/// Responses are routed by substring: the first route whose needle occurs in
/// the prompt answers it. Prompts that match no route get the default
/// response. Every prompt is recorded.
pub struct MockTextGenerator {
    routes: Mutex<Vec<(String, String)>>,
    default_response: String,
    fail_all: bool,
    prompts: Mutex<Vec<String>>,
}

impl MockTextGenerator {
    /// A generator that answers every prompt with non-JSON text, so every
    /// structured call takes its fallback path.
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(Vec::new()),
            default_response: "I am unable to produce structured output for this request."
                .to_string(),
            fail_all: false,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// A generator whose every call fails with an API error.
    pub fn failing() -> Self {
        Self {
            fail_all: true,
            ..Self::new()
        }
    }

    /// Answer prompts containing `needle` with `response`.
    pub fn with_route(self, needle: impl Into<String>, response: impl Into<String>) -> Self {
        self.add_route(needle, response);
        self
    }

    /// Replace the response used when no route matches.
    pub fn with_default(mut self, response: impl Into<String>) -> Self {
        self.default_response = response.into();
        self
    }

    /// Add a route after construction. Earlier routes take precedence.
    pub fn add_route(&self, needle: impl Into<String>, response: impl Into<String>) {
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((needle.into(), response.into()));
    }

    /// All prompts received so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of prompts that contained `needle`.
    pub fn call_count(&self, needle: &str) -> usize {
        self.prompts()
            .iter()
            .filter(|p| p.contains(needle))
            .count()
    }
}

impl Default for MockTextGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TextGenerator for MockTextGenerator {
    async fn complete(&self, prompt: &str, _options: &CompletionOptions) -> Result<String, LlmError> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.to_string());

        if self.fail_all {
            return Err(LlmError::ApiRequest {
                message: "mock generator configured to fail".to_string(),
            });
        }

        let routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        let response = routes
            .iter()
            .find(|(needle, _)| prompt.contains(needle.as_str()))
            .map(|(_, response)| response.clone())
            .unwrap_or_else(|| self.default_response.clone());
        Ok(response)
    }

    fn model_name(&self) -> &str {
        "mock-model"
    }
}
