//! Per sub-question synthesis from ranked sources.
//!
//! Sources are numbered in prompts by their rank position, and the
//! generator cites them by that number. Citations of numbers that are not
//! in the ranked list are dropped. A failed or unparseable synthesis
//! degrades to a zero-confidence placeholder instead of failing the run.

use super::planner::{DagPolicy, ExecutionPlan, SubQuestion};
use super::ranker::RankedSource;
use super::structured::{complete_structured, prompt_safe};
use crate::generator::{CompletionOptions, TextGenerator};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Answer text of a degraded synthesis.
pub const FAILED_ANSWER: &str = "Synthesis failed";

const EXCERPT_CHARS: usize = 1_500;

/// The answer to one sub-question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Synthesis {
    pub sub_question_id: String,
    pub sub_question: String,
    pub answer: String,
    pub key_points: Vec<String>,
    /// Confidence in [0, 1].
    pub confidence: f64,
    /// Rank positions (1-based) of the sources the answer relies on.
    pub supporting_sources: Vec<usize>,
    /// Whether this is a placeholder for a failed synthesis.
    pub degraded: bool,
}

impl Synthesis {
    pub fn failed(sub_question: &SubQuestion) -> Self {
        Self {
            sub_question_id: sub_question.id.clone(),
            sub_question: sub_question.text.clone(),
            answer: FAILED_ANSWER.to_string(),
            key_points: Vec::new(),
            confidence: 0.0,
            supporting_sources: Vec::new(),
            degraded: true,
        }
    }
}

fn default_confidence() -> f64 {
    0.5
}

#[derive(Deserialize)]
struct SynthesisResponse {
    #[serde(default)]
    answer: String,
    #[serde(default, alias = "keyPoints")]
    key_points: Vec<String>,
    #[serde(default = "default_confidence")]
    confidence: f64,
    #[serde(
        default,
        alias = "supportingSourceIndices",
        alias = "supporting_sources",
        alias = "sources"
    )]
    supporting_source_indices: Vec<usize>,
}

/// The `n` best ranked sources. Every sub-question is answered from the
/// same top of the ranking, so citation numbers agree across answers.
pub fn select_sources(ranked: &[RankedSource], n: usize) -> Vec<&RankedSource> {
    ranked.iter().take(n).collect()
}

/// Writes per sub-question answers.
pub struct Synthesizer {
    generator: Arc<dyn TextGenerator>,
    sources_per_question: usize,
}

impl Synthesizer {
    pub fn new(generator: Arc<dyn TextGenerator>, sources_per_question: usize) -> Self {
        Self {
            generator,
            sources_per_question,
        }
    }

    /// Synthesize every sub-question, returning results in execution order.
    ///
    /// Under [`DagPolicy::Leveled`] levels run one after another and each
    /// question sees the answers of its dependencies.
    pub async fn synthesize_all(
        &self,
        plan: &ExecutionPlan,
        ranked: &[RankedSource],
        policy: DagPolicy,
        warnings: &mut Vec<String>,
    ) -> Vec<Synthesis> {
        let batches = match policy {
            DagPolicy::Informational => vec![plan.ordered()],
            DagPolicy::Leveled => plan.ordered_levels(),
        };

        let mut done: HashMap<String, Synthesis> = HashMap::new();
        for batch in batches {
            let futures = batch.iter().map(|sq| {
                let prior: Vec<&Synthesis> = match policy {
                    DagPolicy::Informational => Vec::new(),
                    DagPolicy::Leveled => sq
                        .depends_on
                        .iter()
                        .filter_map(|dep| done.get(dep))
                        .collect(),
                };
                async move {
                    let mut local_warnings = Vec::new();
                    let synthesis = self.synthesize(sq, ranked, &prior, &mut local_warnings).await;
                    (synthesis, local_warnings)
                }
            });
            let results = join_all(futures).await;
            for (synthesis, local_warnings) in results {
                warnings.extend(local_warnings);
                done.insert(synthesis.sub_question_id.clone(), synthesis);
            }
        }

        let syntheses: Vec<Synthesis> = plan
            .order
            .iter()
            .filter_map(|id| done.remove(id))
            .collect();
        info!(
            syntheses = syntheses.len(),
            degraded = syntheses.iter().filter(|s| s.degraded).count(),
            "Synthesis complete"
        );
        syntheses
    }

    /// Answer one sub-question from its selected sources.
    pub async fn synthesize(
        &self,
        sub_question: &SubQuestion,
        ranked: &[RankedSource],
        prior: &[&Synthesis],
        warnings: &mut Vec<String>,
    ) -> Synthesis {
        let sources = select_sources(ranked, self.sources_per_question);
        let body = build_prompt(sub_question, &sources, prior);
        let task = "synthesize";
        let result = complete_structured::<SynthesisResponse>(
            self.generator.as_ref(),
            task,
            &body,
            &CompletionOptions::json(),
        )
        .await;

        let Some(response) = result.parsed(task, warnings) else {
            return Synthesis::failed(sub_question);
        };
        if response.answer.trim().is_empty() {
            warnings.push(format!("{task}: empty answer for {}", sub_question.id));
            return Synthesis::failed(sub_question);
        }

        let mut supporting: Vec<usize> = Vec::new();
        for n in response.supporting_source_indices {
            if (1..=ranked.len()).contains(&n) && !supporting.contains(&n) {
                supporting.push(n);
            }
        }
        debug!(
            sub_question = sub_question.id.as_str(),
            sources = supporting.len(),
            "Sub-question synthesized"
        );

        Synthesis {
            sub_question_id: sub_question.id.clone(),
            sub_question: sub_question.text.clone(),
            answer: response.answer.trim().to_string(),
            key_points: response
                .key_points
                .into_iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            confidence: if response.confidence.is_finite() {
                response.confidence.clamp(0.0, 1.0)
            } else {
                0.0
            },
            supporting_sources: supporting,
            degraded: false,
        }
    }
}

fn build_prompt(sub_question: &SubQuestion, sources: &[&RankedSource], prior: &[&Synthesis]) -> String {
    let mut body = format!(
        "Answer the research sub-question using only the numbered sources. Cite sources by \
         their number. Respond with JSON: {{\"answer\": \"...\", \"key_points\": [\"...\"], \
         \"confidence\": 0.0-1.0, \"supporting_source_indices\": [1, 2]}}\n\n\
         Sub-question: {}\n\nSources:\n",
        prompt_safe(&sub_question.text, 1_000)
    );
    if sources.is_empty() {
        body.push_str("(no sources were found)\n");
    }
    for source in sources {
        body.push_str(&format!(
            "[{}] {} ({})\n{}\n\n",
            source.rank,
            prompt_safe(&source.title, 300),
            source.url,
            prompt_safe(&source.excerpt, EXCERPT_CHARS)
        ));
    }
    if !prior.is_empty() {
        body.push_str("Findings this question builds on:\n");
        for p in prior {
            body.push_str(&format!(
                "- {}: {}\n",
                prompt_safe(&p.sub_question, 300),
                prompt_safe(&p.answer, 1_000)
            ));
        }
    }
    body
}
