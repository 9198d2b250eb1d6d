//! # Delve Tools
//!
//! Network-facing implementations for the Delve research pipeline:
//! search engine adapters (Perplexity, Exa, DuckDuckGo) and an HTTP
//! content fetcher.

pub mod engines;
pub mod fetch;
pub mod html;

pub use engines::{DuckDuckGoEngine, ExaEngine, PerplexityEngine};
pub use fetch::HttpContentFetcher;

use delve_core::config::EnginesConfig;
use delve_core::error::EngineError;
use delve_core::research::search::SearchEngine;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Engines built from configuration, plus the ones that could not be.
#[derive(Default)]
pub struct EngineSet {
    pub engines: Vec<Arc<dyn SearchEngine>>,
    pub unavailable: Vec<EngineError>,
}

impl EngineSet {
    pub fn names(&self) -> Vec<String> {
        self.engines.iter().map(|e| e.name().to_string()).collect()
    }
}

fn collect(set: &mut EngineSet, built: Result<Arc<dyn SearchEngine>, EngineError>) {
    match built {
        Ok(engine) => set.engines.push(engine),
        Err(e) => {
            warn!(engine = e.engine(), error = %e, "Search engine unavailable");
            set.unavailable.push(e);
        }
    }
}

/// Build every enabled engine. An engine whose API key is missing is left
/// out and reported in [`EngineSet::unavailable`]; research continues with
/// the rest.
pub fn build_engines(config: &EnginesConfig, timeout: Duration) -> EngineSet {
    let mut set = EngineSet::default();
    if config.conversational.enabled {
        collect(
            &mut set,
            PerplexityEngine::new(&config.conversational, timeout)
                .map(|e| Arc::new(e) as Arc<dyn SearchEngine>),
        );
    }
    if config.neural.enabled {
        collect(
            &mut set,
            ExaEngine::new(&config.neural, timeout).map(|e| Arc::new(e) as Arc<dyn SearchEngine>),
        );
    }
    if config.keyword.enabled {
        collect(
            &mut set,
            DuckDuckGoEngine::new(&config.keyword, timeout)
                .map(|e| Arc::new(e) as Arc<dyn SearchEngine>),
        );
    }
    info!(engines = ?set.names(), unavailable = set.unavailable.len(), "Search engines ready");
    set
}
