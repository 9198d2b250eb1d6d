//! # Delve Core
//!
//! Core library for the Delve deep-research pipeline.
//! Provides the research orchestrator, text-generation interface,
//! search and fetch abstractions, session storage and configuration.

pub mod config;
pub mod error;
pub mod generator;
pub mod providers;
pub mod research;

// Re-export commonly used types at the crate root.
pub use config::{DelveConfig, ResearchConfig, StoreBackend};
pub use error::{DelveError, Result};
pub use generator::{CompletionOptions, MockTextGenerator, TextGenerator};
pub use providers::create_generator;
pub use research::{
    ContentFetcher, FileStateStore, InMemoryStateStore, QueryMode, ResearchOptions,
    ResearchOrchestrator, ResearchOutcome, ResearchPhase, SearchEngine, StateStore,
};
