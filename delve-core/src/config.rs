//! Configuration system for Delve.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> CLI args.
//! Configuration is loaded from `~/.config/delve/config.toml` and/or `.delve/config.toml`
//! in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::research::planner::DagPolicy;
use crate::research::session::QueryMode;

/// Top-level configuration for Delve.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DelveConfig {
    pub llm: LlmConfig,
    pub engines: EnginesConfig,
    pub research: ResearchConfig,
    pub store: StoreConfig,
}

impl DelveConfig {
    /// Validate the configuration, returning human-readable warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.research.validate();
        if self.llm.model.trim().is_empty() {
            warnings.push("llm.model is empty".to_string());
        }
        let enabled = [
            &self.engines.conversational,
            &self.engines.neural,
            &self.engines.keyword,
        ]
        .iter()
        .filter(|e| e.enabled)
        .count();
        if enabled == 0 {
            warnings.push("no search engines are enabled; reports will have no sources".into());
        }
        warnings
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }
}

/// Configuration for the text-generation provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider name: "openai", "anthropic", or any OpenAI-compatible endpoint.
    pub provider: String,
    /// Model identifier (e.g., "gpt-4o", "claude-sonnet-4-20250514").
    pub model: String,
    /// Environment variable name containing the API key.
    pub api_key_env: String,
    /// Optional base URL override for the API endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Maximum tokens to generate in a response.
    pub max_tokens: usize,
    /// Default temperature for generation.
    pub temperature: f32,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Retry policy for transient failures.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            base_url: None,
            max_tokens: 4096,
            temperature: 0.3,
            timeout_secs: 120,
            retry: RetryConfig::default(),
        }
    }
}

/// Exponential backoff settings for provider calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Configuration for a single search engine adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Whether this engine participates in searches.
    pub enabled: bool,
    /// Environment variable holding the API key. Empty for keyless engines.
    pub api_key_env: String,
    /// Optional base URL override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Optional model name, for engines that take one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Maximum results requested per query.
    pub max_results: usize,
}

/// Configuration for the three search engines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnginesConfig {
    /// Conversational, citation-bearing engine (Perplexity).
    pub conversational: EngineConfig,
    /// Neural / semantic engine (Exa).
    pub neural: EngineConfig,
    /// Traditional keyword engine (DuckDuckGo).
    pub keyword: EngineConfig,
}

impl Default for EnginesConfig {
    fn default() -> Self {
        Self {
            conversational: EngineConfig {
                enabled: true,
                api_key_env: "PERPLEXITY_API_KEY".to_string(),
                base_url: None,
                model: Some("sonar".to_string()),
                max_results: 10,
            },
            neural: EngineConfig {
                enabled: true,
                api_key_env: "EXA_API_KEY".to_string(),
                base_url: None,
                model: None,
                max_results: 10,
            },
            keyword: EngineConfig {
                enabled: true,
                api_key_env: String::new(),
                base_url: None,
                model: None,
                max_results: 10,
            },
        }
    }
}

/// Limits and defaults for the research pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchConfig {
    /// Query mode used when the caller does not pick one and intake cannot infer one.
    pub default_mode: QueryMode,
    /// Maximum number of dependency levels in a plan.
    pub max_depth: u32,
    /// Maximum number of unique URLs fetched per session.
    pub max_sources: usize,
    /// Maximum concurrent fetches.
    pub fetch_concurrency: usize,
    /// Hard per-URL fetch timeout in seconds.
    pub fetch_timeout_secs: u64,
    /// Maximum characters of text kept per fetched document.
    pub max_document_chars: usize,
    /// Per-engine call timeout in seconds.
    pub engine_timeout_secs: u64,
    /// Maximum ranked sources from a single host.
    pub per_domain_cap: usize,
    /// Number of leading candidates scored by lexical overlap.
    pub scored_candidates: usize,
    /// Maximum number of ranked sources kept.
    pub max_ranked_sources: usize,
    /// Ranked sources handed to the synthesizer per sub-question.
    pub synthesis_sources: usize,
    /// Whether the dependency DAG gates search and synthesis.
    pub dag_policy: DagPolicy,
    /// Whether contradiction detection runs after synthesis.
    pub detect_contradictions: bool,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            default_mode: QueryMode::Hybrid,
            max_depth: 3,
            max_sources: 50,
            fetch_concurrency: 20,
            fetch_timeout_secs: 15,
            max_document_chars: 50_000,
            engine_timeout_secs: 60,
            per_domain_cap: 5,
            scored_candidates: 30,
            max_ranked_sources: 100,
            synthesis_sources: 5,
            dag_policy: DagPolicy::Informational,
            detect_contradictions: true,
        }
    }
}

impl ResearchConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.fetch_concurrency == 0 {
            warnings.push("research.fetch_concurrency is 0; one fetch will run at a time".into());
        }
        if !(30..=120).contains(&self.engine_timeout_secs) {
            warnings.push(format!(
                "research.engine_timeout_secs = {} is outside the recommended 30-120s range",
                self.engine_timeout_secs
            ));
        }
        if self.per_domain_cap == 0 {
            warnings.push("research.per_domain_cap is 0; no sources will be ranked".into());
        }
        if self.max_depth == 0 {
            warnings.push("research.max_depth is 0; treated as 1".into());
        }
        warnings
    }
}

/// Which session store backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    #[default]
    File,
}

/// Configuration for session persistence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Directory for the file store. Defaults to the platform data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    /// Resolve the directory used by the file store.
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            directories::ProjectDirs::from("dev", "delve", "delve")
                .map(|d| d.data_dir().join("sessions"))
                .unwrap_or_else(|| PathBuf::from(".delve").join("sessions"))
        })
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `DELVE_`)
/// 3. Workspace-local config (`.delve/config.toml`)
/// 4. User config (`~/.config/delve/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&DelveConfig>,
) -> Result<DelveConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(DelveConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "delve", "delve") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".delve").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // DELVE_LLM__MODEL, DELVE_RESEARCH__MAX_SOURCES, ...
    figment = figment.merge(Env::prefixed("DELVE_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Check whether any Delve configuration file exists (user-level or workspace-level).
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if let Some(config_dir) = directories::ProjectDirs::from("dev", "delve", "delve") {
        if config_dir.config_dir().join("config.toml").exists() {
            return true;
        }
    }
    workspace
        .map(|ws| ws.join(".delve").join("config.toml").exists())
        .unwrap_or(false)
}
