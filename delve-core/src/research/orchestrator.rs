//! Research orchestrator: drives a session through the phase pipeline.
//!
//! Each phase runs to completion, records its wall time and checkpoints the
//! session before the next one starts. Only the store and the state machine
//! can fail a run; every other failure degrades into a session error or
//! warning and the pipeline carries on.

use super::contradiction::{
    ContradictionDetector, LexicalContradictionDetector, NoopContradictionDetector,
};
use super::fetch::{ContentFetcher, FetchFailure, FetchSettings, fetch_all};
use super::intake::IntakeAnalyzer;
use super::planner::QuestionPlanner;
use super::ranker::{RankerSettings, rank};
use super::search::{SearchEngine, Searcher};
use super::session::{
    NoOpResearchCallback, ResearchCallback, ResearchOptions, ResearchPhase, ResearchSession,
    SessionSummary,
};
use super::store::StateStore;
use super::synthesis::Synthesizer;
use super::writer::{Citation, ConfidenceScores, ReportSection, ReportWriter};
use crate::config::ResearchConfig;
use crate::error::{DelveError, ResearchError, Result};
use crate::generator::TextGenerator;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Run statistics attached to every outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OutcomeMetadata {
    pub phase: String,
    pub complete: bool,
    pub phase_timings_ms: BTreeMap<String, u64>,
    /// Number of ranked sources.
    pub total_sources: usize,
    pub contradiction_count: usize,
    pub sub_question_count: usize,
    /// Results contributed per engine.
    pub engine_counts: BTreeMap<String, usize>,
    /// Non-fatal errors from engines and fetches.
    pub errors: Vec<String>,
    pub fetch_errors: Vec<FetchFailure>,
    pub warnings: Vec<String>,
}

/// What a caller gets back from `start`, `resume` or a status lookup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResearchOutcome {
    pub session_id: Uuid,
    /// Markdown report, or the error notice when the run failed.
    pub report: Option<String>,
    pub sections: Vec<ReportSection>,
    pub citations: Vec<Citation>,
    pub bibliography: Vec<String>,
    pub confidence: Option<ConfidenceScores>,
    pub summary: Option<String>,
    /// Set when the session stopped to ask the caller a question.
    pub clarification_question: Option<String>,
    pub error: Option<String>,
    pub metadata: OutcomeMetadata,
}

impl ResearchOutcome {
    /// Snapshot the caller-facing view of a session.
    pub fn from_session(session: &ResearchSession) -> Self {
        let report = session.report.as_ref();
        let markdown = match (&session.error, report) {
            (Some(err), _) => Some(format!("Research encountered an error: {err}")),
            (None, Some(report)) => Some(report.markdown.clone()),
            (None, None) => None,
        };
        let clarification_question = if session.phase == ResearchPhase::ClarificationNeeded {
            session.clarification_question.clone()
        } else {
            None
        };

        Self {
            session_id: session.id,
            report: markdown,
            sections: report.map(|r| r.sections.clone()).unwrap_or_default(),
            citations: report.map(|r| r.citations.clone()).unwrap_or_default(),
            bibliography: report.map(|r| r.bibliography.clone()).unwrap_or_default(),
            confidence: report.map(|r| r.confidence.clone()),
            summary: report.map(|r| r.summary.clone()),
            clarification_question,
            error: session.error.clone(),
            metadata: OutcomeMetadata {
                phase: session.phase.as_str().to_string(),
                complete: session.complete,
                phase_timings_ms: session.phase_timings_ms.clone(),
                total_sources: session.ranked_sources.len(),
                contradiction_count: session.contradictions.len(),
                sub_question_count: session.plan.as_ref().map_or(0, |p| p.len()),
                engine_counts: session
                    .search
                    .as_ref()
                    .map(|s| s.stats.engine_counts.clone())
                    .unwrap_or_default(),
                errors: session.errors.clone(),
                fetch_errors: session
                    .fetch
                    .as_ref()
                    .map(|f| f.errors.clone())
                    .unwrap_or_default(),
                warnings: session.warnings.clone(),
            },
        }
    }

    pub fn is_complete(&self) -> bool {
        self.metadata.complete
    }

    pub fn needs_clarification(&self) -> bool {
        self.clarification_question.is_some()
    }
}

/// Runs research sessions end to end.
pub struct ResearchOrchestrator {
    config: ResearchConfig,
    intake: IntakeAnalyzer,
    planner: QuestionPlanner,
    searcher: Searcher,
    fetcher: Arc<dyn ContentFetcher>,
    synthesizer: Synthesizer,
    detector: Arc<dyn ContradictionDetector>,
    writer: ReportWriter,
    store: Arc<dyn StateStore>,
    callback: Arc<dyn ResearchCallback>,
}

impl ResearchOrchestrator {
    pub fn new(
        config: ResearchConfig,
        generator: Arc<dyn TextGenerator>,
        engines: Vec<Arc<dyn SearchEngine>>,
        fetcher: Arc<dyn ContentFetcher>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let detector: Arc<dyn ContradictionDetector> = if config.detect_contradictions {
            Arc::new(LexicalContradictionDetector::new())
        } else {
            Arc::new(NoopContradictionDetector)
        };
        Self {
            intake: IntakeAnalyzer::new(generator.clone()),
            planner: QuestionPlanner::new(generator.clone()),
            searcher: Searcher::new(
                generator.clone(),
                engines,
                Duration::from_secs(config.engine_timeout_secs),
            ),
            fetcher,
            synthesizer: Synthesizer::new(generator.clone(), config.synthesis_sources),
            detector,
            writer: ReportWriter::new(generator),
            store,
            callback: Arc::new(NoOpResearchCallback),
            config,
        }
    }

    pub fn with_callback(mut self, callback: Arc<dyn ResearchCallback>) -> Self {
        self.callback = callback;
        self
    }

    pub fn with_contradiction_detector(mut self, detector: Arc<dyn ContradictionDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn config(&self) -> &ResearchConfig {
        &self.config
    }

    /// Start a new session and run it until it completes, fails, or stops
    /// to ask for clarification.
    pub async fn start(&self, query: &str, options: ResearchOptions) -> Result<ResearchOutcome> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ResearchError::EmptyQuery.into());
        }
        let session = ResearchSession::new(query, options, &self.config);
        info!(
            session_id = %session.id,
            mode = session.mode.as_str(),
            max_depth = session.max_depth,
            max_sources = session.max_sources,
            "Research session started"
        );
        Ok(self.drive(session).await)
    }

    /// Continue a session that stopped for clarification. The answer is
    /// appended to the original query and the run continues at planning.
    pub async fn resume(&self, session_id: Uuid, clarification: &str) -> Result<ResearchOutcome> {
        let mut session = self.load(session_id).await?;
        if session.phase != ResearchPhase::ClarificationNeeded {
            return Err(ResearchError::NotAwaitingClarification {
                session_id,
                phase: session.phase.to_string(),
            }
            .into());
        }
        let clarification = clarification.trim();
        if clarification.is_empty() {
            return Err(ResearchError::EmptyQuery.into());
        }

        session.clarification = Some(clarification.to_string());
        session.clarified_query = Some(format!("{} ({clarification})", session.query));
        session.clarification_question = None;
        info!(session_id = %session_id, "Resuming session with clarification");
        self.advance(&mut session, ResearchPhase::Planning)?;
        Ok(self.drive(session).await)
    }

    /// Current persisted state of a session. Has no side effects.
    pub async fn get_state(&self, session_id: Uuid) -> Result<ResearchSession> {
        self.load(session_id).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        Ok(self.store.list().await?)
    }

    async fn load(&self, session_id: Uuid) -> Result<ResearchSession> {
        self.store
            .load(session_id)
            .await?
            .ok_or_else(|| ResearchError::SessionNotFound { session_id }.into())
    }

    /// Run phases and turn any fatal error into a failed-session outcome.
    async fn drive(&self, mut session: ResearchSession) -> ResearchOutcome {
        if let Err(e) = self.run_phases(&mut session).await {
            error!(session_id = %session.id, phase = %session.phase, error = %e, "Research failed");
            session.fail(e.to_string());
            self.callback
                .on_phase_change(ResearchPhase::Error, session.progress);
            if let Err(save_err) = self.store.save(&session).await {
                warn!(session_id = %session.id, error = %save_err, "Failed to persist failed session");
            }
        }
        ResearchOutcome::from_session(&session)
    }

    async fn run_phases(&self, session: &mut ResearchSession) -> Result<()> {
        self.store.save(session).await?;
        loop {
            let phase = session.phase;
            let started = Instant::now();
            match phase {
                ResearchPhase::Intake => self.run_intake(session).await?,
                ResearchPhase::Planning => self.run_planning(session).await?,
                ResearchPhase::Searching => self.run_searching(session).await?,
                ResearchPhase::Fetching => self.run_fetching(session).await?,
                ResearchPhase::Ranking => self.run_ranking(session)?,
                ResearchPhase::Synthesizing => self.run_synthesizing(session).await?,
                ResearchPhase::Writing => self.run_writing(session).await?,
                ResearchPhase::ClarificationNeeded
                | ResearchPhase::Complete
                | ResearchPhase::Error => return Ok(()),
            }
            let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            session.record_timing(phase, elapsed);
            self.store.save(session).await?;
        }
    }

    fn advance(&self, session: &mut ResearchSession, next: ResearchPhase) -> Result<()> {
        session.transition(next)?;
        info!(session_id = %session.id, phase = %next, progress = session.progress, "Phase changed");
        self.callback.on_phase_change(next, session.progress);
        Ok(())
    }

    async fn run_intake(&self, session: &mut ResearchSession) -> Result<()> {
        let mut warnings = Vec::new();
        let query = session.query.clone();

        let intent = self.intake.analyze_intent(&query, &mut warnings).await;
        if session.options.mode.is_none() {
            if let Some(mode) = intent.suggested_mode() {
                session.mode = mode;
            }
        }

        let ambiguity = self.intake.check_ambiguity(&query, &mut warnings).await;
        if ambiguity.is_ambiguous {
            session.intent = Some(intent);
            session.clarification_question = ambiguity.question;
            session.warnings.extend(warnings);
            return self.advance(session, ResearchPhase::ClarificationNeeded);
        }

        let expanded = self.intake.expand_query(&query, &intent, &mut warnings).await;
        session.clarified_query = Some(expanded);
        session.intent = Some(intent);
        session.warnings.extend(warnings);
        self.advance(session, ResearchPhase::Planning)
    }

    async fn run_planning(&self, session: &mut ResearchSession) -> Result<()> {
        let mut warnings = Vec::new();
        let plan = self
            .planner
            .plan(
                session.effective_query(),
                session.mode,
                session.max_depth,
                &session.options.focus_areas,
                &mut warnings,
            )
            .await;
        info!(
            session_id = %session.id,
            sub_questions = plan.len(),
            levels = plan.levels.len(),
            "Plan ready"
        );
        session.plan = Some(plan);
        session.warnings.extend(warnings);
        self.advance(session, ResearchPhase::Searching)
    }

    async fn run_searching(&self, session: &mut ResearchSession) -> Result<()> {
        let plan = session
            .plan
            .as_ref()
            .ok_or_else(|| missing(ResearchPhase::Searching, "execution plan"))?;
        let time_sensitive = session.intent.as_ref().is_some_and(|i| i.time_sensitive);
        let mut warnings = Vec::new();
        let output = self
            .searcher
            .run(
                plan,
                self.config.dag_policy,
                time_sensitive,
                self.callback.as_ref(),
                &mut warnings,
            )
            .await;
        session.errors.extend(output.errors());
        session.search = Some(output);
        session.warnings.extend(warnings);
        self.advance(session, ResearchPhase::Fetching)
    }

    async fn run_fetching(&self, session: &mut ResearchSession) -> Result<()> {
        let urls = session
            .search
            .as_ref()
            .ok_or_else(|| missing(ResearchPhase::Fetching, "search results"))?
            .unique_urls();
        let settings = FetchSettings {
            concurrency: self.config.fetch_concurrency,
            timeout: Duration::from_secs(self.config.fetch_timeout_secs),
            max_chars: self.config.max_document_chars,
            max_sources: session.max_sources,
        };
        let report = fetch_all(self.fetcher.clone(), urls, &settings).await;
        session
            .errors
            .extend(report.errors.iter().map(|f| format!("fetch {}: {}", f.url, f.error)));
        session.fetch = Some(report);
        self.advance(session, ResearchPhase::Ranking)
    }

    fn run_ranking(&self, session: &mut ResearchSession) -> Result<()> {
        let search = session
            .search
            .as_ref()
            .ok_or_else(|| missing(ResearchPhase::Ranking, "search results"))?;
        let plan = session
            .plan
            .as_ref()
            .ok_or_else(|| missing(ResearchPhase::Ranking, "execution plan"))?;
        let documents = session
            .fetch
            .as_ref()
            .map(|f| f.documents.as_slice())
            .unwrap_or_default();
        let settings = RankerSettings {
            scored_candidates: self.config.scored_candidates,
            per_domain_cap: self.config.per_domain_cap,
            max_ranked_sources: self.config.max_ranked_sources,
            ..RankerSettings::default()
        };
        session.ranked_sources = rank(documents, search, plan, &settings);
        self.advance(session, ResearchPhase::Synthesizing)
    }

    async fn run_synthesizing(&self, session: &mut ResearchSession) -> Result<()> {
        let plan = session
            .plan
            .as_ref()
            .ok_or_else(|| missing(ResearchPhase::Synthesizing, "execution plan"))?;
        let mut warnings = Vec::new();
        let syntheses = self
            .synthesizer
            .synthesize_all(plan, &session.ranked_sources, self.config.dag_policy, &mut warnings)
            .await;

        let contradictions = self.detector.detect(&syntheses);
        for c in &contradictions {
            self.callback.on_contradiction_found(&c.claim_a, &c.claim_b);
        }
        if !contradictions.is_empty() {
            info!(session_id = %session.id, count = contradictions.len(), "Contradictions found");
        }

        session.syntheses = syntheses;
        session.contradictions = contradictions;
        session.warnings.extend(warnings);
        self.advance(session, ResearchPhase::Writing)
    }

    async fn run_writing(&self, session: &mut ResearchSession) -> Result<()> {
        let mut warnings = Vec::new();
        let report = self
            .writer
            .write(
                session.effective_query(),
                &session.syntheses,
                &session.ranked_sources,
                &session.contradictions,
                &mut warnings,
            )
            .await;
        session.report = Some(report);
        session.warnings.extend(warnings);
        self.advance(session, ResearchPhase::Complete)?;
        info!(
            session_id = %session.id,
            sources = session.ranked_sources.len(),
            warnings = session.warnings.len(),
            "Research complete"
        );
        Ok(())
    }
}

fn missing(phase: ResearchPhase, what: &str) -> DelveError {
    ResearchError::PhaseFailed {
        phase: phase.to_string(),
        message: format!("{what} missing from session"),
    }
    .into()
}
