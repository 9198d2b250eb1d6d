//! Research session state machine.
//!
//! A [`ResearchSession`] is the single record the pipeline threads through
//! every phase. Each phase fills in its own optional payload; the phase field
//! only moves along the fixed order checked by
//! [`ResearchPhase::can_transition_to`].

use super::contradiction::Contradiction;
use super::fetch::FetchReport;
use super::intake::IntentAnalysis;
use super::planner::ExecutionPlan;
use super::ranker::RankedSource;
use super::search::SearchOutput;
use super::synthesis::Synthesis;
use super::writer::Report;
use crate::config::ResearchConfig;
use crate::error::ResearchError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Current phase of a research session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResearchPhase {
    /// Classifying the query and checking for ambiguity.
    Intake,
    /// Paused until the caller supplies a clarification.
    ClarificationNeeded,
    /// Decomposing the query into a sub-question DAG.
    Planning,
    /// Fanning each sub-question out to the search engines.
    Searching,
    /// Downloading discovered URLs.
    Fetching,
    /// Scoring, deduplicating and capping sources.
    Ranking,
    /// Answering each sub-question from its sources.
    Synthesizing,
    /// Assembling the final report.
    Writing,
    /// Research complete.
    Complete,
    /// A phase failed; set only at the `start`/`resume` boundary.
    Error,
}

impl ResearchPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::ClarificationNeeded => "clarification_needed",
            Self::Planning => "planning",
            Self::Searching => "searching",
            Self::Fetching => "fetching",
            Self::Ranking => "ranking",
            Self::Synthesizing => "synthesizing",
            Self::Writing => "writing",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    /// The phase that follows this one on the straight-through path.
    pub fn next(&self) -> Option<ResearchPhase> {
        match self {
            Self::Intake | Self::ClarificationNeeded => Some(Self::Planning),
            Self::Planning => Some(Self::Searching),
            Self::Searching => Some(Self::Fetching),
            Self::Fetching => Some(Self::Ranking),
            Self::Ranking => Some(Self::Synthesizing),
            Self::Synthesizing => Some(Self::Writing),
            Self::Writing => Some(Self::Complete),
            Self::Complete | Self::Error => None,
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// The straight-through order plus two extras: intake may pause at
    /// `clarification_needed`, and any non-terminal phase may fail into `error`.
    pub fn can_transition_to(&self, next: ResearchPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Error => true,
            Self::ClarificationNeeded => *self == Self::Intake,
            _ => self.next() == Some(next),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// Progress fraction reported when a session enters this phase.
    pub fn progress(&self) -> f64 {
        match self {
            Self::Intake | Self::ClarificationNeeded => 0.05,
            Self::Planning => 0.15,
            Self::Searching => 0.3,
            Self::Fetching => 0.5,
            Self::Ranking => 0.65,
            Self::Synthesizing => 0.75,
            Self::Writing => 0.9,
            Self::Complete => 1.0,
            Self::Error => 0.0,
        }
    }
}

impl fmt::Display for ResearchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the planner spreads a query across sub-questions.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    /// Many independent angles on the topic.
    BreadthFirst,
    /// Fewer questions that build on one another.
    DepthFirst,
    #[default]
    Hybrid,
}

impl QueryMode {
    /// Number of sub-questions requested from the planner.
    pub fn sub_question_count(&self) -> usize {
        match self {
            Self::BreadthFirst => 8,
            Self::DepthFirst => 6,
            Self::Hybrid => 7,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BreadthFirst => "breadth_first",
            Self::DepthFirst => "depth_first",
            Self::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for QueryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "breadth_first" | "breadth" => Ok(Self::BreadthFirst),
            "depth_first" | "depth" => Ok(Self::DepthFirst),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!(
                "unknown query mode '{other}' (expected breadth_first, depth_first or hybrid)"
            )),
        }
    }
}

/// Caller-supplied knobs for a research run. Unset fields use configuration defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResearchOptions {
    /// Explicit query mode. When unset, intake picks one from the intent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<QueryMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sources: Option<usize>,
    /// Topics the planner should make sure to cover.
    #[serde(default)]
    pub focus_areas: Vec<String>,
}

/// A persistent research session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchSession {
    /// Unique session ID.
    pub id: Uuid,
    /// The query as first submitted.
    pub query: String,
    /// Query after clarification and expansion.
    pub clarified_query: Option<String>,
    /// Question put to the caller when the query was ambiguous.
    pub clarification_question: Option<String>,
    /// The caller's answer to `clarification_question`.
    pub clarification: Option<String>,
    /// Options as requested by the caller.
    pub options: ResearchOptions,
    /// Effective query mode.
    pub mode: QueryMode,
    /// Effective dependency-level cap.
    pub max_depth: u32,
    /// Effective cap on fetched URLs.
    pub max_sources: usize,
    /// Current phase.
    pub phase: ResearchPhase,
    /// Whether the run reached `complete`.
    pub complete: bool,
    /// Overall progress (0.0-1.0).
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Wall-clock milliseconds spent in each phase, keyed by phase name.
    pub phase_timings_ms: BTreeMap<String, u64>,
    /// Engine and fetch failures that were isolated rather than raised.
    pub errors: Vec<String>,
    /// Recovered degradations (parse fallbacks, discarded edges).
    pub warnings: Vec<String>,
    /// Fatal error message when the phase is `error`.
    pub error: Option<String>,

    pub intent: Option<IntentAnalysis>,
    pub plan: Option<ExecutionPlan>,
    pub search: Option<SearchOutput>,
    pub fetch: Option<FetchReport>,
    #[serde(default)]
    pub ranked_sources: Vec<RankedSource>,
    #[serde(default)]
    pub syntheses: Vec<Synthesis>,
    #[serde(default)]
    pub contradictions: Vec<Contradiction>,
    pub report: Option<Report>,
}

impl ResearchSession {
    /// Create a session at `intake`, resolving unset options against `config`.
    pub fn new(query: impl Into<String>, options: ResearchOptions, config: &ResearchConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            query: query.into(),
            clarified_query: None,
            clarification_question: None,
            clarification: None,
            mode: options.mode.unwrap_or(config.default_mode),
            max_depth: options.max_depth.unwrap_or(config.max_depth).max(1),
            max_sources: options.max_sources.unwrap_or(config.max_sources),
            options,
            phase: ResearchPhase::Intake,
            complete: false,
            progress: ResearchPhase::Intake.progress(),
            created_at: now,
            updated_at: now,
            phase_timings_ms: BTreeMap::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            error: None,
            intent: None,
            plan: None,
            search: None,
            fetch: None,
            ranked_sources: Vec::new(),
            syntheses: Vec::new(),
            contradictions: Vec::new(),
            report: None,
        }
    }

    /// The query downstream phases should work from.
    pub fn effective_query(&self) -> &str {
        self.clarified_query.as_deref().unwrap_or(&self.query)
    }

    /// Move to `next`, rejecting transitions the state machine does not allow.
    pub fn transition(&mut self, next: ResearchPhase) -> Result<(), ResearchError> {
        if !self.phase.can_transition_to(next) {
            return Err(ResearchError::InvalidTransition {
                from: self.phase.to_string(),
                to: next.to_string(),
            });
        }
        self.phase = next;
        self.updated_at = Utc::now();
        if next == ResearchPhase::Complete {
            self.complete = true;
        }
        if next != ResearchPhase::Error {
            self.progress = next.progress();
        }
        Ok(())
    }

    /// Mark the session as failed. Progress is left where it stopped.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.phase = ResearchPhase::Error;
        self.complete = false;
        self.updated_at = Utc::now();
    }

    pub fn record_timing(&mut self, phase: ResearchPhase, millis: u64) {
        *self
            .phase_timings_ms
            .entry(phase.as_str().to_string())
            .or_insert(0) += millis;
    }

    /// Whether the session can still make progress without caller input.
    pub fn is_active(&self) -> bool {
        !self.phase.is_terminal() && self.phase != ResearchPhase::ClarificationNeeded
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            query: self.query.clone(),
            phase: self.phase,
            mode: self.mode,
            progress: self.progress,
            complete: self.complete,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Summary of a research session for listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSummary {
    pub id: Uuid,
    pub query: String,
    pub phase: ResearchPhase,
    pub mode: QueryMode,
    pub progress: f64,
    pub complete: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Callback trait for progressive research UI updates.
pub trait ResearchCallback: Send + Sync {
    /// Called when the research phase changes.
    fn on_phase_change(&self, phase: ResearchPhase, progress: f64);
    /// Called when all engines have answered for a sub-question.
    fn on_sub_question_searched(&self, question: &str, results: usize);
    /// Called when a contradiction is found.
    fn on_contradiction_found(&self, claim_a: &str, claim_b: &str);
}

/// No-op callback for testing.
pub struct NoOpResearchCallback;

impl ResearchCallback for NoOpResearchCallback {
    fn on_phase_change(&self, _phase: ResearchPhase, _progress: f64) {}
    fn on_sub_question_searched(&self, _question: &str, _results: usize) {}
    fn on_contradiction_found(&self, _claim_a: &str, _claim_b: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session() -> ResearchSession {
        ResearchSession::new(
            "What is prompt caching?",
            ResearchOptions::default(),
            &ResearchConfig::default(),
        )
    }

    #[test]
    fn test_session_lifecycle() {
        let mut session = new_session();
        assert_eq!(session.phase, ResearchPhase::Intake);
        assert!(session.is_active());

        for phase in [
            ResearchPhase::Planning,
            ResearchPhase::Searching,
            ResearchPhase::Fetching,
            ResearchPhase::Ranking,
            ResearchPhase::Synthesizing,
            ResearchPhase::Writing,
            ResearchPhase::Complete,
        ] {
            session.transition(phase).unwrap();
        }
        assert!(session.complete);
        assert!(!session.is_active());
        assert!((session.progress - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rejects_skipped_phase() {
        let mut session = new_session();
        let err = session.transition(ResearchPhase::Fetching).unwrap_err();
        assert!(matches!(err, ResearchError::InvalidTransition { .. }));
        assert_eq!(session.phase, ResearchPhase::Intake);
    }

    #[test]
    fn test_clarification_branch_only_from_intake() {
        assert!(ResearchPhase::Intake.can_transition_to(ResearchPhase::ClarificationNeeded));
        assert!(ResearchPhase::ClarificationNeeded.can_transition_to(ResearchPhase::Planning));
        assert!(!ResearchPhase::Planning.can_transition_to(ResearchPhase::ClarificationNeeded));
        assert!(!ResearchPhase::ClarificationNeeded.can_transition_to(ResearchPhase::Searching));
    }

    #[test]
    fn test_terminal_phases_are_final() {
        assert!(!ResearchPhase::Complete.can_transition_to(ResearchPhase::Error));
        assert!(!ResearchPhase::Error.can_transition_to(ResearchPhase::Planning));
        assert!(ResearchPhase::Fetching.can_transition_to(ResearchPhase::Error));
    }

    #[test]
    fn test_fail_keeps_progress() {
        let mut session = new_session();
        session.transition(ResearchPhase::Planning).unwrap();
        session.fail("Network error");
        assert_eq!(session.phase, ResearchPhase::Error);
        assert_eq!(session.error.as_deref(), Some("Network error"));
        assert!((session.progress - 0.15).abs() < f64::EPSILON);
    }

    #[test]
    fn test_options_override_config_defaults() {
        let options = ResearchOptions {
            mode: Some(QueryMode::DepthFirst),
            max_depth: Some(0),
            max_sources: Some(7),
            focus_areas: vec!["cost".into()],
        };
        let session = ResearchSession::new("q", options, &ResearchConfig::default());
        assert_eq!(session.mode, QueryMode::DepthFirst);
        assert_eq!(session.max_depth, 1);
        assert_eq!(session.max_sources, 7);
    }

    #[test]
    fn test_timings_accumulate() {
        let mut session = new_session();
        session.record_timing(ResearchPhase::Planning, 10);
        session.record_timing(ResearchPhase::Planning, 5);
        assert_eq!(session.phase_timings_ms["planning"], 15);
    }

    #[test]
    fn test_query_mode_parsing() {
        assert_eq!("breadth-first".parse::<QueryMode>().unwrap(), QueryMode::BreadthFirst);
        assert_eq!("Depth_First".parse::<QueryMode>().unwrap(), QueryMode::DepthFirst);
        assert!("sideways".parse::<QueryMode>().is_err());
        assert_eq!(QueryMode::BreadthFirst.sub_question_count(), 8);
        assert_eq!(QueryMode::DepthFirst.sub_question_count(), 6);
        assert_eq!(QueryMode::Hybrid.sub_question_count(), 7);
    }

    #[test]
    fn test_session_serde_roundtrip() {
        let session = new_session();
        let json = serde_json::to_string(&session).unwrap();
        let back: ResearchSession = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, session.id);
        assert_eq!(back.phase, ResearchPhase::Intake);
        assert!(json.contains("\"phase\":\"intake\""));
    }
}
