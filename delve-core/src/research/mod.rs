//! Deep research pipeline.
//!
//! A session moves through intake, planning, searching, fetching, ranking,
//! synthesizing and writing. [`ResearchOrchestrator`] drives the phases and
//! checkpoints the session through a [`StateStore`] after each one.

pub mod contradiction;
pub mod fetch;
pub mod intake;
pub mod orchestrator;
pub mod planner;
pub mod ranker;
pub mod search;
pub mod session;
pub mod store;
pub mod structured;
pub mod synthesis;
pub mod writer;

pub use contradiction::{Contradiction, ContradictionDetector, LexicalContradictionDetector};
pub use fetch::{ContentFetcher, FetchReport, FetchedDocument, MockContentFetcher};
pub use orchestrator::{OutcomeMetadata, ResearchOrchestrator, ResearchOutcome};
pub use planner::{DagPolicy, ExecutionPlan, SubQuestion};
pub use ranker::RankedSource;
pub use search::{EngineKind, MockSearchEngine, SearchEngine, SearchParams, SearchResult};
pub use session::{
    NoOpResearchCallback, QueryMode, ResearchCallback, ResearchOptions, ResearchPhase,
    ResearchSession, SessionSummary,
};
pub use store::{FileStateStore, InMemoryStateStore, StateStore};
pub use synthesis::Synthesis;
pub use writer::{Citation, Report};
