//! Error types for the Delve research core.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering text generation, search engines, content fetching, persistence,
//! configuration and planning.

use std::path::PathBuf;
use uuid::Uuid;

/// Top-level error type for the Delve core library.
#[derive(Debug, thiserror::Error)]
pub enum DelveError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    #[error("Research error: {0}")]
    Research(#[from] ResearchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from text-generation providers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },
}

/// Errors from a single search engine adapter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("{engine}: API key not configured (env var '{env_var}')")]
    MissingApiKey { engine: String, env_var: String },

    #[error("{engine}: request failed: {message}")]
    Request { engine: String, message: String },

    #[error("{engine}: HTTP {status}: {body}")]
    Status {
        engine: String,
        status: u16,
        body: String,
    },

    #[error("{engine}: could not parse response: {message}")]
    Parse { engine: String, message: String },

    #[error("{engine}: timed out after {timeout_secs}s")]
    Timeout { engine: String, timeout_secs: u64 },
}

impl EngineError {
    /// Name of the engine that produced the error.
    pub fn engine(&self) -> &str {
        match self {
            EngineError::MissingApiKey { engine, .. }
            | EngineError::Request { engine, .. }
            | EngineError::Status { engine, .. }
            | EngineError::Parse { engine, .. }
            | EngineError::Timeout { engine, .. } => engine,
        }
    }
}

/// Errors from retrieving a single URL.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("Invalid URL: {url}")]
    InvalidUrl { url: String },

    #[error("Fetch of {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("Fetch of {url} timed out after {timeout_secs}s")]
    Timeout { url: String, timeout_secs: u64 },

    #[error("Failed to read body of {url}: {message}")]
    Body { url: String, message: String },
}

/// Errors from the session state store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to persist session {session_id}: {message}")]
    WriteFailed { session_id: Uuid, message: String },

    #[error("Failed to read session state: {message}")]
    ReadFailed { message: String },

    #[error("Corrupt session file {path}: {message}")]
    Corrupt { path: PathBuf, message: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors raised while building an execution plan.
///
/// These are recovered inside the planner; they surface only in logs and
/// session warnings.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanError {
    #[error("Dependency cycle detected among sub-questions: {}", nodes.join(", "))]
    CycleDetected { nodes: Vec<String> },
}

/// Errors from driving a research session.
#[derive(Debug, thiserror::Error)]
pub enum ResearchError {
    #[error("Research session not found: {session_id}")]
    SessionNotFound { session_id: Uuid },

    #[error("Session {session_id} is in phase '{phase}', not awaiting clarification")]
    NotAwaitingClarification { session_id: Uuid, phase: String },

    #[error("Invalid phase transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Empty research query")]
    EmptyQuery,

    #[error("Phase '{phase}' failed: {message}")]
    PhaseFailed { phase: String, message: String },
}

/// A type alias for results using the top-level `DelveError`.
pub type Result<T> = std::result::Result<T, DelveError>;
