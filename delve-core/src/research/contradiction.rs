//! Contradiction detection across sub-question findings.
//!
//! The default detector compares key points from different sub-questions
//! using keyword overlap plus negation asymmetry or numeric disagreement.

use super::ranker::extract_keywords;
use super::synthesis::Synthesis;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const NEGATIONS: &[&str] = &[
    "not", "no", "never", "neither", "nor", "without", "lack", "lacks", "doesn't", "don't",
    "isn't", "aren't", "wasn't", "weren't", "won't", "cannot", "can't", "fails", "unlikely",
];

/// A detected conflict between two findings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contradiction {
    pub claim_a: String,
    pub claim_b: String,
    pub sub_question_a: String,
    pub sub_question_b: String,
    /// Rank positions of the sources behind each claim.
    pub sources_a: Vec<usize>,
    pub sources_b: Vec<usize>,
    pub kind: ContradictionKind,
    /// Confidence that this is a real contradiction (0.0-1.0).
    pub confidence: f64,
}

/// Type of contradiction between claims.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContradictionKind {
    /// One claim negates the other.
    DirectNegation,
    /// Same topic, different figures.
    NumericDisagreement,
}

/// Finds contradictions among syntheses.
pub trait ContradictionDetector: Send + Sync {
    fn detect(&self, syntheses: &[Synthesis]) -> Vec<Contradiction>;
}

/// Reports nothing. Use when contradiction detection is switched off.
pub struct NoopContradictionDetector;

impl ContradictionDetector for NoopContradictionDetector {
    fn detect(&self, _syntheses: &[Synthesis]) -> Vec<Contradiction> {
        Vec::new()
    }
}

/// Keyword-overlap detector over synthesis key points.
pub struct LexicalContradictionDetector {
    /// Minimum Jaccard overlap for two claims to be about the same thing.
    min_overlap: f64,
}

struct ClaimRef<'a> {
    text: &'a str,
    synthesis: &'a Synthesis,
    keywords: HashSet<String>,
    negated: bool,
    numbers: Vec<f64>,
}

impl LexicalContradictionDetector {
    pub fn new() -> Self {
        Self { min_overlap: 0.3 }
    }

    pub fn with_min_overlap(min_overlap: f64) -> Self {
        Self { min_overlap }
    }

    fn check_pair(&self, a: &ClaimRef<'_>, b: &ClaimRef<'_>) -> Option<Contradiction> {
        let overlap = jaccard(&a.keywords, &b.keywords);
        if overlap < self.min_overlap {
            return None;
        }

        let kind = if a.negated != b.negated && overlap > 0.4 {
            ContradictionKind::DirectNegation
        } else if numbers_disagree(&a.numbers, &b.numbers) {
            ContradictionKind::NumericDisagreement
        } else {
            return None;
        };
        let weight = match kind {
            ContradictionKind::DirectNegation => 0.8,
            ContradictionKind::NumericDisagreement => 0.6,
        };

        Some(Contradiction {
            claim_a: a.text.to_string(),
            claim_b: b.text.to_string(),
            sub_question_a: a.synthesis.sub_question_id.clone(),
            sub_question_b: b.synthesis.sub_question_id.clone(),
            sources_a: a.synthesis.supporting_sources.clone(),
            sources_b: b.synthesis.supporting_sources.clone(),
            kind,
            confidence: (overlap * weight).clamp(0.0, 1.0),
        })
    }
}

impl Default for LexicalContradictionDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ContradictionDetector for LexicalContradictionDetector {
    fn detect(&self, syntheses: &[Synthesis]) -> Vec<Contradiction> {
        let claims: Vec<ClaimRef<'_>> = syntheses
            .iter()
            .filter(|s| !s.degraded)
            .flat_map(|s| s.key_points.iter().map(move |p| (s, p)))
            .map(|(synthesis, text)| ClaimRef {
                text,
                synthesis,
                keywords: extract_keywords(text)
                    .into_iter()
                    .filter(|w| !NEGATIONS.contains(&w.as_str()))
                    .collect(),
                negated: is_negated(text),
                numbers: extract_numbers(text),
            })
            .collect();

        let mut found = Vec::new();
        for i in 0..claims.len() {
            for j in (i + 1)..claims.len() {
                if claims[i].synthesis.sub_question_id == claims[j].synthesis.sub_question_id {
                    continue;
                }
                if let Some(c) = self.check_pair(&claims[i], &claims[j]) {
                    found.push(c);
                }
            }
        }
        found
    }
}

fn is_negated(text: &str) -> bool {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .any(|w| NEGATIONS.contains(&w))
}

fn extract_numbers(text: &str) -> Vec<f64> {
    text.split(|c: char| !c.is_ascii_digit() && c != '.')
        .map(|s| s.trim_matches('.'))
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<f64>().ok())
        .collect()
}

/// Two claims disagree when neither shares any figure with the other and
/// some pair differs by more than 10%.
fn numbers_disagree(a: &[f64], b: &[f64]) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    let shares_figure = a
        .iter()
        .any(|x| b.iter().any(|y| (x - y).abs() <= f64::EPSILON));
    !shares_figure
        && a.iter()
            .any(|x| b.iter().any(|y| (x - y).abs() / x.abs().max(1.0) > 0.1))
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthesis(id: &str, points: &[&str]) -> Synthesis {
        Synthesis {
            sub_question_id: id.to_string(),
            sub_question: format!("question {id}"),
            answer: String::new(),
            key_points: points.iter().map(|p| p.to_string()).collect(),
            confidence: 0.8,
            supporting_sources: vec![1],
            degraded: false,
        }
    }

    #[test]
    fn test_detect_negation() {
        let syntheses = vec![
            synthesis("q1", &["Solid state batteries are commercially viable today"]),
            synthesis("q2", &["Solid state batteries are not commercially viable today"]),
        ];
        let found = LexicalContradictionDetector::new().detect(&syntheses);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, ContradictionKind::DirectNegation);
        assert_eq!(found[0].sub_question_a, "q1");
        assert!(found[0].confidence > 0.0);
    }

    #[test]
    fn test_detect_numeric_disagreement() {
        let syntheses = vec![
            synthesis("q1", &["LFP cell energy density reaches 160 Wh/kg"]),
            synthesis("q2", &["LFP cell energy density reaches 250 Wh/kg"]),
        ];
        let found = LexicalContradictionDetector::new().detect(&syntheses);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, ContradictionKind::NumericDisagreement);
    }

    #[test]
    fn test_same_sub_question_ignored() {
        let syntheses = vec![synthesis(
            "q1",
            &["Prices are falling fast", "Prices are not falling fast"],
        )];
        assert!(LexicalContradictionDetector::new().detect(&syntheses).is_empty());
    }

    #[test]
    fn test_unrelated_claims() {
        let syntheses = vec![
            synthesis("q1", &["Lithium mining expands in Chile"]),
            synthesis("q2", &["Sodium cells do not need cobalt"]),
        ];
        assert!(LexicalContradictionDetector::new().detect(&syntheses).is_empty());
    }

    #[test]
    fn test_negation_is_word_based() {
        assert!(!is_negated("We know the answer"));
        assert!(is_negated("It doesn't scale"));
    }

    #[test]
    fn test_degraded_syntheses_skipped() {
        let mut failed = synthesis("q2", &["Solid state batteries are not viable"]);
        failed.degraded = true;
        let syntheses = vec![synthesis("q1", &["Solid state batteries are viable"]), failed];
        assert!(LexicalContradictionDetector::new().detect(&syntheses).is_empty());
    }

    #[test]
    fn test_noop_detector() {
        let syntheses = vec![
            synthesis("q1", &["A is true"]),
            synthesis("q2", &["A is not true"]),
        ];
        assert!(NoopContradictionDetector.detect(&syntheses).is_empty());
    }
}
