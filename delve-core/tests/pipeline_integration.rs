//! Integration tests for the research pipeline.
//!
//! These drive the orchestrator end to end with scripted generators, search
//! engines and fetchers, checking phase order, degradation and persistence.

use async_trait::async_trait;
use delve_core::config::ResearchConfig;
use delve_core::error::{DelveError, ResearchError, StoreError};
use delve_core::generator::MockTextGenerator;
use delve_core::research::fetch::MockContentFetcher;
use delve_core::research::search::{EngineKind, MockSearchEngine, SearchEngine, SearchResult};
use delve_core::research::session::{
    QueryMode, ResearchCallback, ResearchOptions, ResearchPhase, ResearchSession, SessionSummary,
};
use delve_core::research::store::{FileStateStore, InMemoryStateStore, StateStore};
use delve_core::research::ResearchOrchestrator;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const BREADTH_QUESTIONS: &str = r#"{"sub_questions": [
    "What battery chemistries are used in grid storage?",
    "How do lithium iron phosphate cells compare on cost?",
    "What is the cycle life of sodium ion batteries?",
    "Which flow battery designs are commercially deployed?",
    "How do safety profiles differ between chemistries?",
    "What supply chain risks affect battery materials?",
    "How is grid storage capacity growing worldwide?",
    "What policies support grid battery deployment?"
]}"#;

const WRITER_RESPONSE: &str = r##"{
    "markdown": "# Grid storage\n\n## Executive Summary\n\nLFP dominates grid storage [1].",
    "sections": [
        {"title": "Executive Summary", "content": "LFP dominates grid storage [1]."},
        {"title": "Key Findings", "content": "Costs keep falling [2]."}
    ],
    "confidence": {"overall": 0.8, "sections": {"Key Findings": 0.75}},
    "summary": "LFP dominates grid storage."
}"##;

/// Records every callback in order.
#[derive(Default)]
struct RecordingCallback {
    phases: Mutex<Vec<ResearchPhase>>,
    searched: AtomicUsize,
}

impl RecordingCallback {
    fn phases(&self) -> Vec<ResearchPhase> {
        self.phases.lock().unwrap().clone()
    }
}

impl ResearchCallback for RecordingCallback {
    fn on_phase_change(&self, phase: ResearchPhase, _progress: f64) {
        self.phases.lock().unwrap().push(phase);
    }
    fn on_sub_question_searched(&self, _question: &str, _results: usize) {
        self.searched.fetch_add(1, Ordering::SeqCst);
    }
    fn on_contradiction_found(&self, _claim_a: &str, _claim_b: &str) {}
}

/// Saves succeed until the budget runs out, then every save fails.
struct FlakyStore {
    inner: InMemoryStateStore,
    saves_left: AtomicUsize,
}

impl FlakyStore {
    fn new(saves: usize) -> Self {
        Self {
            inner: InMemoryStateStore::new(),
            saves_left: AtomicUsize::new(saves),
        }
    }
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn save(&self, session: &ResearchSession) -> Result<(), StoreError> {
        let left = self.saves_left.load(Ordering::SeqCst);
        if left == 0 {
            return Err(StoreError::WriteFailed {
                session_id: session.id,
                message: "disk full".into(),
            });
        }
        self.saves_left.store(left - 1, Ordering::SeqCst);
        self.inner.save(session).await
    }

    async fn load(&self, id: Uuid) -> Result<Option<ResearchSession>, StoreError> {
        self.inner.load(id).await
    }

    async fn list(&self) -> Result<Vec<SessionSummary>, StoreError> {
        self.inner.list().await
    }
}

fn pipeline_generator() -> MockTextGenerator {
    MockTextGenerator::new()
        .with_route(
            "Task: intent-analysis",
            r#"{"type": "comparative", "domain": "energy", "complexity": "medium"}"#,
        )
        .with_route("Task: ambiguity-check", r#"{"is_ambiguous": false}"#)
        .with_route(
            "Task: query-expansion",
            r#"{"expanded_query": "Compare battery chemistries for grid-scale storage"}"#,
        )
        .with_route("Task: decompose", BREADTH_QUESTIONS)
        .with_route("Task: dependencies", r#"{"dependencies": {}}"#)
        .with_route("Task: optimize-query", r#"{"query": "grid battery storage"}"#)
        .with_route(
            "Task: synthesize",
            r#"{"answer": "LFP cells dominate new grid storage.", "key_points": ["LFP leads"],
                "confidence": 0.7, "supporting_source_indices": [1, 2]}"#,
        )
        .with_route("Task: write-report", WRITER_RESPONSE)
}

fn engines() -> Vec<Arc<dyn SearchEngine>> {
    vec![
        Arc::new(MockSearchEngine::new(
            "perplexity",
            EngineKind::Conversational,
            vec![
                SearchResult::aggregated_answer("perplexity", "Grid storage is mostly LFP."),
                SearchResult::citation("perplexity", "https://www.energy.example/lfp", "LFP report"),
            ],
        )),
        Arc::new(MockSearchEngine::new(
            "exa",
            EngineKind::Neural,
            vec![SearchResult::result(
                "exa",
                "https://research.example/sodium",
                "Sodium ion outlook",
                "Sodium ion batteries for grid storage",
            )],
        )),
        Arc::new(MockSearchEngine::new(
            "duckduckgo",
            EngineKind::Keyword,
            vec![SearchResult::result(
                "duckduckgo",
                "https://wiki.example/grid_storage",
                "Grid energy storage",
                "Battery storage on the grid",
            )],
        )),
    ]
}

fn fetcher() -> Arc<MockContentFetcher> {
    Arc::new(
        MockContentFetcher::new()
            .with_default_page("Grid battery storage chemistries compared: LFP, sodium ion, flow."),
    )
}

fn orchestrator_with(
    generator: Arc<MockTextGenerator>,
    engines: Vec<Arc<dyn SearchEngine>>,
    store: Arc<dyn StateStore>,
) -> (ResearchOrchestrator, Arc<RecordingCallback>) {
    let callback = Arc::new(RecordingCallback::default());
    let orchestrator =
        ResearchOrchestrator::new(ResearchConfig::default(), generator, engines, fetcher(), store)
            .with_callback(callback.clone());
    (orchestrator, callback)
}

#[tokio::test]
async fn test_breadth_first_run_completes_with_all_engines() {
    let generator = Arc::new(pipeline_generator());
    let (orchestrator, callback) =
        orchestrator_with(generator.clone(), engines(), Arc::new(InMemoryStateStore::new()));

    let options = ResearchOptions {
        mode: Some(QueryMode::BreadthFirst),
        ..Default::default()
    };
    let outcome = orchestrator
        .start("Compare electric vehicle battery chemistries", options)
        .await
        .unwrap();

    assert!(outcome.is_complete());
    assert!(
        generator
            .prompts()
            .iter()
            .any(|p| p.starts_with("Task: intent-analysis")
                && p.contains("Compare electric vehicle battery chemistries"))
    );
    assert!(outcome.error.is_none());
    assert_eq!(outcome.metadata.sub_question_count, 8);
    for engine in ["perplexity", "exa", "duckduckgo"] {
        assert!(
            outcome.metadata.engine_counts.get(engine).copied().unwrap_or(0) > 0,
            "{engine} contributed nothing"
        );
    }
    assert_eq!(outcome.metadata.total_sources, 3);
    assert!(outcome.report.as_deref().unwrap().contains("LFP dominates"));
    assert_eq!(outcome.summary.as_deref(), Some("LFP dominates grid storage."));
    assert!(!outcome.citations.is_empty());
    assert!(outcome.metadata.errors.is_empty());
    assert_eq!(callback.searched.load(Ordering::SeqCst), 8);

    assert_eq!(
        callback.phases(),
        vec![
            ResearchPhase::Planning,
            ResearchPhase::Searching,
            ResearchPhase::Fetching,
            ResearchPhase::Ranking,
            ResearchPhase::Synthesizing,
            ResearchPhase::Writing,
            ResearchPhase::Complete,
        ]
    );
}

#[tokio::test]
async fn test_failing_engine_degrades_but_completes() {
    let generator = Arc::new(pipeline_generator());
    let mut engines = engines();
    engines[1] = Arc::new(MockSearchEngine::failing("exa", EngineKind::Neural));
    let (orchestrator, _) =
        orchestrator_with(generator, engines, Arc::new(InMemoryStateStore::new()));

    let outcome = orchestrator
        .start("Compare battery chemistries", ResearchOptions::default())
        .await
        .unwrap();

    assert!(outcome.is_complete());
    assert!(!outcome.metadata.errors.is_empty());
    assert!(outcome.metadata.errors.iter().all(|e| e.contains("exa")));
    assert_eq!(outcome.metadata.engine_counts.get("exa"), Some(&0));
    assert!(outcome.metadata.total_sources > 0);
}

#[tokio::test]
async fn test_mode_inferred_from_intent() {
    let generator = Arc::new(pipeline_generator());
    let store = Arc::new(InMemoryStateStore::new());
    let (orchestrator, _) = orchestrator_with(generator, engines(), store);

    let outcome = orchestrator
        .start("Compare battery chemistries", ResearchOptions::default())
        .await
        .unwrap();
    let session = orchestrator.get_state(outcome.session_id).await.unwrap();
    assert_eq!(session.mode, QueryMode::BreadthFirst);
    assert_eq!(
        session.clarified_query.as_deref(),
        Some("Compare battery chemistries for grid-scale storage")
    );
}

#[tokio::test]
async fn test_clarification_gate_and_resume() {
    let generator = Arc::new(
        MockTextGenerator::new()
            .with_route(
                "Task: ambiguity-check",
                r#"{"is_ambiguous": true, "question": "The animal or the car?"}"#,
            )
            .with_route("Task: decompose", BREADTH_QUESTIONS)
            .with_route("Task: write-report", WRITER_RESPONSE),
    );
    let (orchestrator, callback) = orchestrator_with(
        generator.clone(),
        engines(),
        Arc::new(InMemoryStateStore::new()),
    );

    let paused = orchestrator
        .start("jaguar speed", ResearchOptions::default())
        .await
        .unwrap();
    assert!(!paused.is_complete());
    assert!(paused.needs_clarification());
    assert_eq!(paused.clarification_question.as_deref(), Some("The animal or the car?"));
    assert_eq!(paused.metadata.phase, "clarification_needed");
    assert!(paused.report.is_none());
    assert_eq!(callback.phases(), vec![ResearchPhase::ClarificationNeeded]);

    let resumed = orchestrator
        .resume(paused.session_id, "the animal")
        .await
        .unwrap();
    assert!(resumed.is_complete());
    assert_eq!(resumed.session_id, paused.session_id);
    assert_eq!(callback.phases()[1], ResearchPhase::Planning);

    let decompose_prompt = generator
        .prompts()
        .into_iter()
        .find(|p| p.starts_with("Task: decompose"))
        .unwrap();
    assert!(decompose_prompt.contains("jaguar speed (the animal)"));

    let session = orchestrator.get_state(paused.session_id).await.unwrap();
    assert_eq!(session.clarification.as_deref(), Some("the animal"));
    assert!(session.phase_timings_ms.contains_key("intake"));
    assert!(session.phase_timings_ms.contains_key("writing"));
}

#[tokio::test]
async fn test_resume_requires_pending_clarification() {
    let (orchestrator, _) = orchestrator_with(
        Arc::new(pipeline_generator()),
        engines(),
        Arc::new(InMemoryStateStore::new()),
    );
    let outcome = orchestrator
        .start("Compare battery chemistries", ResearchOptions::default())
        .await
        .unwrap();

    let err = orchestrator
        .resume(outcome.session_id, "anything")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DelveError::Research(ResearchError::NotAwaitingClarification { .. })
    ));
}

#[tokio::test]
async fn test_get_state_is_idempotent() {
    let (orchestrator, _) = orchestrator_with(
        Arc::new(pipeline_generator()),
        engines(),
        Arc::new(InMemoryStateStore::new()),
    );
    let outcome = orchestrator
        .start("Compare battery chemistries", ResearchOptions::default())
        .await
        .unwrap();

    let first = orchestrator.get_state(outcome.session_id).await.unwrap();
    let second = orchestrator.get_state(outcome.session_id).await.unwrap();
    assert_eq!(
        serde_json::to_value(&first).unwrap(),
        serde_json::to_value(&second).unwrap()
    );
    assert_eq!(first.phase, ResearchPhase::Complete);
    assert!(first.report.is_some());
}

#[tokio::test]
async fn test_store_failure_is_fatal_at_boundary() {
    // The initial checkpoint and the intake checkpoint succeed.
    let store = Arc::new(FlakyStore::new(2));
    let (orchestrator, callback) =
        orchestrator_with(Arc::new(pipeline_generator()), engines(), store.clone());

    let outcome = orchestrator
        .start("Compare battery chemistries", ResearchOptions::default())
        .await
        .unwrap();

    assert!(!outcome.is_complete());
    assert_eq!(outcome.metadata.phase, "error");
    let error = outcome.error.as_deref().unwrap();
    assert!(error.contains("disk full"));
    assert!(
        outcome
            .report
            .as_deref()
            .unwrap()
            .starts_with("Research encountered an error:")
    );
    assert_eq!(callback.phases().last(), Some(&ResearchPhase::Error));
}

#[tokio::test]
async fn test_max_sources_caps_fetches() {
    let fetcher = fetcher();
    let orchestrator = ResearchOrchestrator::new(
        ResearchConfig::default(),
        Arc::new(pipeline_generator()),
        engines(),
        fetcher.clone(),
        Arc::new(InMemoryStateStore::new()),
    );
    let options = ResearchOptions {
        max_sources: Some(2),
        ..Default::default()
    };
    let outcome = orchestrator
        .start("Compare battery chemistries", options)
        .await
        .unwrap();

    assert!(outcome.is_complete());
    assert_eq!(fetcher.requested().len(), 2);
    let session = orchestrator.get_state(outcome.session_id).await.unwrap();
    assert_eq!(session.fetch.unwrap().skipped.len(), 1);
}

#[tokio::test]
async fn test_file_store_persists_across_orchestrators() {
    let dir = tempfile::TempDir::new().unwrap();
    let (first, _) = orchestrator_with(
        Arc::new(pipeline_generator()),
        engines(),
        Arc::new(FileStateStore::new(dir.path())),
    );
    let outcome = first
        .start("Compare battery chemistries", ResearchOptions::default())
        .await
        .unwrap();

    let (second, _) = orchestrator_with(
        Arc::new(pipeline_generator()),
        engines(),
        Arc::new(FileStateStore::new(dir.path())),
    );
    let session = second.get_state(outcome.session_id).await.unwrap();
    assert!(session.complete);
    assert_eq!(session.ranked_sources.len(), outcome.metadata.total_sources);

    let listed = second.list_sessions().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, outcome.session_id);
}
