//! Intake: classify the query, gate on ambiguity, expand it for planning.
//!
//! All three calls are best effort. Malformed generator output falls back to
//! neutral defaults and is recorded as a session warning, never an error.

use super::session::QueryMode;
use super::structured::{Structured, complete_structured, prompt_safe};
use crate::generator::{CompletionOptions, TextGenerator};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

const MAX_QUERY_CHARS: usize = 2_000;

fn general() -> String {
    "general".to_string()
}

fn medium() -> String {
    "medium".to_string()
}

/// What kind of research the query asks for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntentAnalysis {
    /// Intent label, e.g. "comparative", "exploratory", "factual".
    #[serde(rename = "type", alias = "kind", alias = "intent", default = "general")]
    pub kind: String,
    #[serde(default = "general")]
    pub domain: String,
    /// "low", "medium" or "high".
    #[serde(default = "medium")]
    pub complexity: String,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default, alias = "timeSensitive")]
    pub time_sensitive: bool,
}

impl Default for IntentAnalysis {
    fn default() -> Self {
        Self {
            kind: general(),
            domain: general(),
            complexity: medium(),
            entities: Vec::new(),
            time_sensitive: false,
        }
    }
}

impl IntentAnalysis {
    /// Query mode implied by the intent: comparative and exploratory queries
    /// go wide, highly complex ones go deep. `None` leaves the configured
    /// default (hybrid unless changed) in place.
    pub fn suggested_mode(&self) -> Option<QueryMode> {
        let kind = self.kind.to_ascii_lowercase();
        if kind.contains("compar") || kind.contains("explor") {
            Some(QueryMode::BreadthFirst)
        } else if self.complexity.eq_ignore_ascii_case("high") {
            Some(QueryMode::DepthFirst)
        } else {
            None
        }
    }
}

/// Ambiguity verdict for a query.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Ambiguity {
    #[serde(default, alias = "isAmbiguous", alias = "ambiguous")]
    pub is_ambiguous: bool,
    /// Question to put to the caller.
    #[serde(
        default,
        alias = "clarification_question",
        alias = "clarificationQuestion"
    )]
    pub question: Option<String>,
}

#[derive(Deserialize)]
struct Expansion {
    #[serde(alias = "expandedQuery", alias = "query")]
    expanded_query: String,
}

/// Runs the intake calls against a text generator.
pub struct IntakeAnalyzer {
    generator: Arc<dyn TextGenerator>,
}

impl IntakeAnalyzer {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    /// Classify intent, domain, complexity and named entities.
    pub async fn analyze_intent(&self, query: &str, warnings: &mut Vec<String>) -> IntentAnalysis {
        let body = format!(
            "Classify this research query. Respond with JSON: \
             {{\"type\": \"factual|comparative|exploratory|analytical|...\", \
             \"domain\": \"...\", \"complexity\": \"low|medium|high\", \
             \"entities\": [\"...\"], \"time_sensitive\": true|false}}\n\n\
             Query: {}",
            prompt_safe(query, MAX_QUERY_CHARS)
        );
        let result = complete_structured::<IntentAnalysis>(
            self.generator.as_ref(),
            "intent-analysis",
            &body,
            &CompletionOptions::json(),
        )
        .await;
        let intent = result
            .parsed("intent-analysis", warnings)
            .unwrap_or_default();
        debug!(kind = intent.kind.as_str(), domain = intent.domain.as_str(), "Intent analyzed");
        intent
    }

    /// Decide whether the query needs clarification before planning.
    pub async fn check_ambiguity(&self, query: &str, warnings: &mut Vec<String>) -> Ambiguity {
        let body = format!(
            "Decide whether this research query is too ambiguous to research without asking \
             the user a question first. Only flag genuinely ambiguous queries. Respond with \
             JSON: {{\"is_ambiguous\": true|false, \"question\": \"clarifying question or null\"}}\n\n\
             Query: {}",
            prompt_safe(query, MAX_QUERY_CHARS)
        );
        let result = complete_structured::<Ambiguity>(
            self.generator.as_ref(),
            "ambiguity-check",
            &body,
            &CompletionOptions::json(),
        )
        .await;
        let mut ambiguity = result
            .parsed("ambiguity-check", warnings)
            .unwrap_or_default();
        if ambiguity.is_ambiguous
            && ambiguity
                .question
                .as_deref()
                .is_none_or(|q| q.trim().is_empty())
        {
            ambiguity.question = Some(format!(
                "Could you clarify which aspect of \"{query}\" you want researched?"
            ));
        }
        ambiguity
    }

    /// Rewrite the query into a fuller research statement.
    /// Returns the original query when expansion fails or comes back empty.
    pub async fn expand_query(
        &self,
        query: &str,
        intent: &IntentAnalysis,
        warnings: &mut Vec<String>,
    ) -> String {
        let body = format!(
            "Expand this {} query in the {} domain into a precise, self-contained research \
             statement. Keep the user's intent. Respond with JSON: \
             {{\"expanded_query\": \"...\"}}\n\nQuery: {}",
            intent.kind,
            intent.domain,
            prompt_safe(query, MAX_QUERY_CHARS)
        );
        let result = complete_structured::<Expansion>(
            self.generator.as_ref(),
            "query-expansion",
            &body,
            &CompletionOptions::json(),
        )
        .await;
        match result.parsed("query-expansion", warnings) {
            Some(expansion) if !expansion.expanded_query.trim().is_empty() => {
                expansion.expanded_query.trim().to_string()
            }
            _ => query.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::MockTextGenerator;

    fn analyzer(generator: MockTextGenerator) -> IntakeAnalyzer {
        IntakeAnalyzer::new(Arc::new(generator))
    }

    #[tokio::test]
    async fn test_intent_parsed() {
        let generator = MockTextGenerator::new().with_route(
            "Task: intent-analysis",
            r#"{"type": "comparative", "domain": "energy", "complexity": "high",
                "entities": ["LFP", "NMC"], "timeSensitive": true}"#,
        );
        let mut warnings = Vec::new();
        let intent = analyzer(generator)
            .analyze_intent("Compare LFP and NMC", &mut warnings)
            .await;
        assert_eq!(intent.kind, "comparative");
        assert_eq!(intent.entities, vec!["LFP", "NMC"]);
        assert!(intent.time_sensitive);
        assert!(warnings.is_empty());
        assert_eq!(intent.suggested_mode(), Some(QueryMode::BreadthFirst));
    }

    #[tokio::test]
    async fn test_intent_defaults_on_garbage() {
        let mut warnings = Vec::new();
        let intent = analyzer(MockTextGenerator::new())
            .analyze_intent("anything", &mut warnings)
            .await;
        assert_eq!(intent, IntentAnalysis::default());
        assert_eq!(intent.kind, "general");
        assert_eq!(intent.suggested_mode(), None);
        assert_eq!(warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_partial_intent_fills_defaults() {
        let generator =
            MockTextGenerator::new().with_route("Task: intent-analysis", r#"{"complexity": "high"}"#);
        let mut warnings = Vec::new();
        let intent = analyzer(generator).analyze_intent("q", &mut warnings).await;
        assert_eq!(intent.domain, "general");
        assert_eq!(intent.suggested_mode(), Some(QueryMode::DepthFirst));
    }

    #[tokio::test]
    async fn test_ambiguity_gets_default_question() {
        let generator =
            MockTextGenerator::new().with_route("Task: ambiguity-check", r#"{"isAmbiguous": true}"#);
        let mut warnings = Vec::new();
        let ambiguity = analyzer(generator).check_ambiguity("jaguar", &mut warnings).await;
        assert!(ambiguity.is_ambiguous);
        assert!(ambiguity.question.unwrap().contains("jaguar"));
    }

    #[tokio::test]
    async fn test_ambiguity_defaults_to_false() {
        let mut warnings = Vec::new();
        let ambiguity = analyzer(MockTextGenerator::failing())
            .check_ambiguity("jaguar", &mut warnings)
            .await;
        assert!(!ambiguity.is_ambiguous);
        assert!(warnings[0].contains("generation failed"));
    }

    #[tokio::test]
    async fn test_expand_query_falls_back_to_original() {
        let generator =
            MockTextGenerator::new().with_route("Task: query-expansion", r#"{"expanded_query": "  "}"#);
        let mut warnings = Vec::new();
        let expanded = analyzer(generator)
            .expand_query("solid state batteries", &IntentAnalysis::default(), &mut warnings)
            .await;
        assert_eq!(expanded, "solid state batteries");
    }

    #[tokio::test]
    async fn test_expand_query() {
        let generator = MockTextGenerator::new().with_route(
            "Task: query-expansion",
            r#"{"expandedQuery": "State of solid-state battery commercialization"}"#,
        );
        let mut warnings = Vec::new();
        let expanded = analyzer(generator)
            .expand_query("solid state batteries", &IntentAnalysis::default(), &mut warnings)
            .await;
        assert_eq!(expanded, "State of solid-state battery commercialization");
    }
}
