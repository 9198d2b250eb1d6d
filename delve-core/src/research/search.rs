//! Searcher: per sub-question fan-out to every configured search engine.
//!
//! Each engine call runs under its own timeout. A failing or slow engine
//! contributes nothing for that sub-question and is recorded in the stats;
//! it never aborts the other engines or the phase.

use super::planner::{DagPolicy, ExecutionPlan, SubQuestion};
use super::ranker::normalize_url;
use super::session::ResearchCallback;
use super::structured::{complete_structured, prompt_safe};
use crate::error::EngineError;
use crate::generator::{CompletionOptions, TextGenerator};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Maximum length of an optimized search query, in chars.
pub const MAX_QUERY_CHARS: usize = 100;

const INTERROGATIVES: &[&str] = &[
    "what", "why", "how", "when", "where", "which", "who", "whom", "whose",
];

/// The three engine families. Declaration order is the result merge order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Answer engine that returns a synthesized answer plus citations.
    Conversational,
    /// Embedding-based semantic search.
    Neural,
    /// Classic keyword search.
    Keyword,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    /// An engine-written answer; usually has no URL.
    AggregatedAnswer,
    /// A URL the aggregated answer cites.
    Citation,
    /// An ordinary search hit.
    Result,
}

/// A search hit normalized across engines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    /// Name of the engine that produced it.
    pub engine: String,
    pub kind: ResultKind,
    pub url: Option<String>,
    pub title: String,
    /// Snippet or answer text.
    pub text: String,
    /// Engine-reported score, 0.0 when the engine gives none.
    pub score: f64,
    /// Sub-question this result was found for. Set by the searcher.
    pub sub_question_id: Option<String>,
}

impl SearchResult {
    pub fn aggregated_answer(engine: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            kind: ResultKind::AggregatedAnswer,
            url: None,
            title: String::new(),
            text: text.into(),
            score: 0.0,
            sub_question_id: None,
        }
    }

    pub fn citation(engine: impl Into<String>, url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            kind: ResultKind::Citation,
            url: Some(url.into()),
            title: title.into(),
            text: String::new(),
            score: 0.0,
            sub_question_id: None,
        }
    }

    pub fn result(
        engine: impl Into<String>,
        url: impl Into<String>,
        title: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            engine: engine.into(),
            kind: ResultKind::Result,
            url: Some(url.into()),
            title: title.into(),
            text: text.into(),
            score: 0.0,
            sub_question_id: None,
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }
}

/// Per-call search parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchParams {
    pub max_results: usize,
    /// Prefer recent content when the engine supports it.
    pub time_sensitive: bool,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            max_results: 10,
            time_sensitive: false,
        }
    }
}

/// A search service adapter.
#[async_trait]
pub trait SearchEngine: Send + Sync {
    /// Engine name used in results and stats.
    fn name(&self) -> &str;

    fn kind(&self) -> EngineKind;

    async fn search(&self, query: &str, params: &SearchParams) -> Result<Vec<SearchResult>, EngineError>;
}

/// Results for one sub-question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubQuestionResults {
    pub sub_question_id: String,
    /// The query actually sent to the engines.
    pub query: String,
    /// Results in engine declaration order.
    pub results: Vec<SearchResult>,
    /// Engines that failed for this sub-question.
    pub engine_errors: Vec<EngineFailure>,
}

/// One failed engine call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineFailure {
    pub engine: String,
    pub message: String,
}

/// Aggregate metadata for the searching phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchStats {
    /// Results contributed per engine (every engine listed, zeros included).
    pub engine_counts: BTreeMap<String, usize>,
    /// Failed calls per engine.
    pub engine_failures: BTreeMap<String, usize>,
    pub total_results: usize,
    pub unique_urls: usize,
}

/// Output of the searching phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchOutput {
    /// One entry per sub-question, in the order they were searched.
    pub per_question: Vec<SubQuestionResults>,
    pub stats: SearchStats,
}

impl SearchOutput {
    /// Every result in discovery order.
    pub fn all_results(&self) -> impl Iterator<Item = &SearchResult> {
        self.per_question.iter().flat_map(|q| q.results.iter())
    }

    /// Distinct URLs in discovery order. Two URLs that normalize the same
    /// count once; the first spelling seen is kept.
    pub fn unique_urls(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.all_results()
            .filter_map(|r| r.url.as_deref())
            .filter(|url| seen.insert(normalize_url(url)))
            .map(str::to_string)
            .collect()
    }

    /// Every engine failure as `"<sub-question>: <error>"`.
    pub fn errors(&self) -> Vec<String> {
        self.per_question
            .iter()
            .flat_map(|q| {
                q.engine_errors
                    .iter()
                    .map(move |f| format!("{}: {}", q.sub_question_id, f.message))
            })
            .collect()
    }

    fn compute_stats(&mut self, engine_names: &[String]) {
        let mut stats = SearchStats::default();
        for name in engine_names {
            stats.engine_counts.insert(name.clone(), 0);
        }
        for result in self.all_results() {
            *stats.engine_counts.entry(result.engine.clone()).or_insert(0) += 1;
            stats.total_results += 1;
        }
        for q in &self.per_question {
            for failure in &q.engine_errors {
                *stats
                    .engine_failures
                    .entry(failure.engine.clone())
                    .or_insert(0) += 1;
            }
        }
        stats.unique_urls = self.unique_urls().len();
        self.stats = stats;
    }
}

#[derive(Deserialize)]
struct OptimizedQuery {
    #[serde(alias = "search_query", alias = "optimized_query")]
    query: String,
}

/// Fans sub-questions out to the search engines.
pub struct Searcher {
    generator: Arc<dyn TextGenerator>,
    engines: Vec<Arc<dyn SearchEngine>>,
    engine_timeout: Duration,
    max_results: usize,
}

impl Searcher {
    /// Engines are reordered by [`EngineKind`]; ties keep the given order.
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        mut engines: Vec<Arc<dyn SearchEngine>>,
        engine_timeout: Duration,
    ) -> Self {
        engines.sort_by_key(|e| e.kind());
        Self {
            generator,
            engines,
            engine_timeout,
            max_results: SearchParams::default().max_results,
        }
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }

    pub fn engine_names(&self) -> Vec<String> {
        self.engines.iter().map(|e| e.name().to_string()).collect()
    }

    /// Search every sub-question of `plan`.
    ///
    /// Under [`DagPolicy::Leveled`] one dependency level completes before the
    /// next starts; otherwise all sub-questions run at once.
    pub async fn run(
        &self,
        plan: &ExecutionPlan,
        policy: DagPolicy,
        time_sensitive: bool,
        callback: &dyn ResearchCallback,
        warnings: &mut Vec<String>,
    ) -> SearchOutput {
        let batches = match policy {
            DagPolicy::Informational => vec![plan.ordered()],
            DagPolicy::Leveled => plan.ordered_levels(),
        };

        let mut output = SearchOutput::default();
        for batch in batches {
            let results = self.search_batch(&batch, time_sensitive, callback, warnings).await;
            output.per_question.extend(results);
        }
        output.compute_stats(&self.engine_names());
        info!(
            sub_questions = output.per_question.len(),
            total_results = output.stats.total_results,
            unique_urls = output.stats.unique_urls,
            "Search complete"
        );
        output
    }

    async fn search_batch(
        &self,
        batch: &[&SubQuestion],
        time_sensitive: bool,
        callback: &dyn ResearchCallback,
        warnings: &mut Vec<String>,
    ) -> Vec<SubQuestionResults> {
        let futures = batch.iter().map(|sq| async move {
            let mut local_warnings = Vec::new();
            let query = self.optimize_query(&sq.text, &mut local_warnings).await;
            let results = self.search_one(sq, &query, time_sensitive).await;
            callback.on_sub_question_searched(&sq.text, results.results.len());
            (results, local_warnings)
        });

        let mut out = Vec::with_capacity(batch.len());
        for (results, local_warnings) in join_all(futures).await {
            warnings.extend(local_warnings);
            out.push(results);
        }
        out
    }

    /// Turn a sub-question into a compact keyword query.
    pub async fn optimize_query(&self, question: &str, warnings: &mut Vec<String>) -> String {
        let body = format!(
            "Rewrite this research question as a compact web search query of at most \
             {MAX_QUERY_CHARS} characters. Respond with JSON: {{\"query\": \"...\"}}\n\nQuestion: {}",
            prompt_safe(question, 1_000)
        );
        let result = complete_structured::<OptimizedQuery>(
            self.generator.as_ref(),
            "optimize-query",
            &body,
            &CompletionOptions::json().with_max_tokens(100),
        )
        .await;
        match result.parsed("optimize-query", warnings) {
            Some(q) if !q.query.trim().is_empty() => truncate_chars(q.query.trim(), MAX_QUERY_CHARS),
            _ => fallback_query(question),
        }
    }

    /// Query every engine concurrently for one sub-question.
    pub async fn search_one(
        &self,
        sub_question: &SubQuestion,
        query: &str,
        time_sensitive: bool,
    ) -> SubQuestionResults {
        let params = SearchParams {
            max_results: self.max_results,
            time_sensitive,
        };
        let timeout_secs = self.engine_timeout.as_secs();
        let params = &params;

        let futures = self.engines.iter().map(|engine| async move {
            let outcome = tokio::time::timeout(self.engine_timeout, engine.search(query, params))
                .await
                .unwrap_or_else(|_| {
                    Err(EngineError::Timeout {
                        engine: engine.name().to_string(),
                        timeout_secs,
                    })
                });
            (engine.name().to_string(), outcome)
        });

        let mut results = Vec::new();
        let mut engine_errors = Vec::new();
        for (name, outcome) in join_all(futures).await {
            match outcome {
                Ok(found) => {
                    debug!(engine = name.as_str(), results = found.len(), "Engine returned");
                    results.extend(found.into_iter().map(|mut r| {
                        r.sub_question_id = Some(sub_question.id.clone());
                        r
                    }));
                }
                Err(e) => {
                    warn!(
                        engine = name.as_str(),
                        sub_question = sub_question.id.as_str(),
                        error = %e,
                        "Search engine failed"
                    );
                    engine_errors.push(EngineFailure {
                        engine: name,
                        message: e.to_string(),
                    });
                }
            }
        }

        SubQuestionResults {
            sub_question_id: sub_question.id.clone(),
            query: query.to_string(),
            results,
            engine_errors,
        }
    }
}

/// Strip interrogative words, collapse whitespace, cap at [`MAX_QUERY_CHARS`].
pub fn fallback_query(question: &str) -> String {
    let words: Vec<&str> = question
        .split_whitespace()
        .map(|w| w.trim_end_matches(['?', '!', '.', ',']))
        .filter(|w| !w.is_empty() && !INTERROGATIVES.contains(&w.to_lowercase().as_str()))
        .collect();
    let query = if words.is_empty() {
        question.split_whitespace().collect::<Vec<_>>().join(" ")
    } else {
        words.join(" ")
    };
    truncate_chars(&query, MAX_QUERY_CHARS)
}

/// Truncate to at most `max_chars` chars without splitting one.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

/// A scripted search engine for tests and offline runs.
pub struct MockSearchEngine {
    name: String,
    kind: EngineKind,
    results: Vec<SearchResult>,
    fail: bool,
    delay: Option<Duration>,
    queries: Mutex<Vec<String>>,
}

impl MockSearchEngine {
    /// An engine that returns `results` for every query.
    pub fn new(name: impl Into<String>, kind: EngineKind, results: Vec<SearchResult>) -> Self {
        Self {
            name: name.into(),
            kind,
            results,
            fail: false,
            delay: None,
            queries: Mutex::new(Vec::new()),
        }
    }

    /// An engine whose every call fails.
    pub fn failing(name: impl Into<String>, kind: EngineKind) -> Self {
        Self {
            fail: true,
            ..Self::new(name, kind, Vec::new())
        }
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl SearchEngine for MockSearchEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EngineKind {
        self.kind
    }

    async fn search(&self, query: &str, params: &SearchParams) -> Result<Vec<SearchResult>, EngineError> {
        self.queries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(query.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(EngineError::Request {
                engine: self.name.clone(),
                message: "mock engine configured to fail".to_string(),
            });
        }
        Ok(self.results.iter().take(params.max_results).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::MockTextGenerator;
    use crate::research::planner::build_plan;
    use crate::research::session::NoOpResearchCallback;

    fn engines() -> Vec<Arc<dyn SearchEngine>> {
        vec![
            Arc::new(MockSearchEngine::new(
                "keyword",
                EngineKind::Keyword,
                vec![SearchResult::result("keyword", "https://k.example/a", "K", "kw")],
            )),
            Arc::new(MockSearchEngine::new(
                "conversational",
                EngineKind::Conversational,
                vec![
                    SearchResult::aggregated_answer("conversational", "An answer"),
                    SearchResult::citation("conversational", "https://c.example/1", "C1"),
                ],
            )),
            Arc::new(MockSearchEngine::new(
                "neural",
                EngineKind::Neural,
                vec![SearchResult::result("neural", "https://c.example/1", "N", "dup url")],
            )),
        ]
    }

    fn searcher(engines: Vec<Arc<dyn SearchEngine>>) -> Searcher {
        Searcher::new(Arc::new(MockTextGenerator::new()), engines, Duration::from_secs(5))
    }

    fn plan(n: usize) -> ExecutionPlan {
        build_plan((1..=n).map(|i| format!("What is topic {i}?")).collect(), BTreeMap::new(), 3).0
    }

    #[test]
    fn test_fallback_query() {
        assert_eq!(
            fallback_query("  What   are the   costs of LFP batteries? "),
            "are the costs of LFP batteries"
        );
        assert_eq!(fallback_query("Why?"), "Why?");
        assert_eq!(fallback_query(&"x".repeat(300)).chars().count(), MAX_QUERY_CHARS);
    }

    #[test]
    fn test_truncate_chars_is_boundary_safe() {
        assert_eq!(truncate_chars("ééé", 2), "éé");
        assert_eq!(truncate_chars("ab", 5), "ab");
    }

    #[tokio::test]
    async fn test_results_in_declared_engine_order() {
        let searcher = searcher(engines());
        let sq = &plan(1).sub_questions[0];
        let out = searcher.search_one(sq, "topic", false).await;
        let engines: Vec<&str> = out.results.iter().map(|r| r.engine.as_str()).collect();
        assert_eq!(engines, vec!["conversational", "conversational", "neural", "keyword"]);
        assert_eq!(out.results[0].kind, ResultKind::AggregatedAnswer);
        assert!(out.results.iter().all(|r| r.sub_question_id.as_deref() == Some("q1")));
    }

    #[tokio::test]
    async fn test_failed_engine_is_isolated() {
        let mut list = engines();
        list[0] = Arc::new(MockSearchEngine::failing("keyword", EngineKind::Keyword));
        let searcher = searcher(list);
        let mut warnings = Vec::new();
        let out = searcher
            .run(&plan(2), DagPolicy::Informational, false, &NoOpResearchCallback, &mut warnings)
            .await;
        assert_eq!(out.per_question.len(), 2);
        assert_eq!(out.stats.engine_failures["keyword"], 2);
        assert_eq!(out.stats.engine_counts["keyword"], 0);
        assert_eq!(out.stats.engine_counts["conversational"], 4);
        assert_eq!(out.errors().len(), 2);
    }

    #[tokio::test]
    async fn test_slow_engine_times_out() {
        let slow: Arc<dyn SearchEngine> = Arc::new(
            MockSearchEngine::new("neural", EngineKind::Neural, Vec::new())
                .with_delay(Duration::from_secs(5)),
        );
        let searcher = Searcher::new(
            Arc::new(MockTextGenerator::new()),
            vec![slow],
            Duration::from_millis(20),
        );
        let out = searcher.search_one(&plan(1).sub_questions[0], "q", false).await;
        assert!(out.results.is_empty());
        assert_eq!(out.engine_errors[0].engine, "neural");
        assert!(out.engine_errors[0].message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_stats_count_unique_urls() {
        let searcher = searcher(engines());
        let mut warnings = Vec::new();
        let out = searcher
            .run(&plan(3), DagPolicy::Leveled, false, &NoOpResearchCallback, &mut warnings)
            .await;
        assert_eq!(out.stats.total_results, 12);
        assert_eq!(out.stats.unique_urls, 2);
        assert_eq!(
            out.unique_urls(),
            vec!["https://c.example/1".to_string(), "https://k.example/a".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unique_urls_merge_equivalent_spellings() {
        let searcher = searcher(vec![
            Arc::new(MockSearchEngine::new(
                "keyword",
                EngineKind::Keyword,
                vec![SearchResult::result("keyword", "https://a.example/", "A", "slash")],
            )),
            Arc::new(MockSearchEngine::new(
                "neural",
                EngineKind::Neural,
                vec![SearchResult::result("neural", "https://A.example#x", "A", "fragment")],
            )),
        ]);
        let mut warnings = Vec::new();
        let out = searcher
            .run(&plan(1), DagPolicy::Informational, false, &NoOpResearchCallback, &mut warnings)
            .await;
        assert_eq!(out.unique_urls(), vec!["https://a.example/".to_string()]);
        assert_eq!(out.stats.unique_urls, 1);
    }

    #[tokio::test]
    async fn test_optimized_query_is_used() {
        let generator = MockTextGenerator::new()
            .with_route("Task: optimize-query", r#"{"query": "lfp battery cost 2024"}"#);
        let engine = Arc::new(MockSearchEngine::new("neural", EngineKind::Neural, Vec::new()));
        let searcher = Searcher::new(
            Arc::new(generator),
            vec![engine.clone() as Arc<dyn SearchEngine>],
            Duration::from_secs(1),
        );
        let mut warnings = Vec::new();
        searcher
            .run(&plan(1), DagPolicy::Informational, true, &NoOpResearchCallback, &mut warnings)
            .await;
        assert_eq!(engine.queries(), vec!["lfp battery cost 2024"]);
        assert!(warnings.is_empty());
    }
}
