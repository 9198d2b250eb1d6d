//! Relevance ranking with URL deduplication and a per-host diversity cap.

use super::fetch::FetchedDocument;
use super::planner::ExecutionPlan;
use super::search::{SearchOutput, truncate_chars};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tracing::info;

/// Score given to candidates that are not lexically scored.
pub const BASELINE_SCORE: f64 = 0.5;
/// Score for a scored candidate sharing no keyword with the plan.
pub const NO_OVERLAP_SCORE: f64 = 0.2;
pub const MAX_SCORE: f64 = 0.9;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
    "do", "does", "did", "will", "would", "shall", "should", "may", "might", "must", "can",
    "could", "of", "in", "to", "for", "with", "on", "at", "from", "by", "about", "as", "into",
    "through", "during", "before", "after", "above", "below", "between", "this", "that",
    "these", "those", "it", "its", "and", "but", "or", "what", "why", "how", "when", "where",
    "which", "who", "whom", "whose", "their", "there", "than", "then", "them", "they",
];

/// Lower-cased words longer than two chars, stop-words removed, in order of appearance.
pub fn extract_keywords(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 2 && !STOP_WORDS.contains(w))
        .map(String::from)
        .collect()
}

/// Canonical form used for deduplication: lower-cased host, no fragment,
/// no trailing slash.
pub fn normalize_url(raw: &str) -> String {
    let raw = raw.trim();
    match url::Url::parse(raw) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.as_str().trim_end_matches('/').to_string()
        }
        Err(_) => raw
            .split('#')
            .next()
            .unwrap_or_default()
            .trim_end_matches('/')
            .to_string(),
    }
}

/// Host bucket for the diversity cap, without a leading `www.`.
pub fn host_of(raw: &str) -> String {
    url::Url::parse(raw.trim())
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
        .map(|h| h.strip_prefix("www.").map(str::to_string).unwrap_or(h))
        .unwrap_or_else(|| "unknown".to_string())
}

/// A source considered for ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub url: String,
    pub normalized_url: String,
    pub title: String,
    pub text: String,
    /// Whether the text came from a fetched document rather than a snippet.
    pub fetched: bool,
    /// Sub-questions whose searches surfaced this URL.
    pub sub_question_ids: Vec<String>,
}

/// A ranked, deduplicated source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedSource {
    pub url: String,
    pub title: String,
    /// Leading text of the source, bounded for prompt use.
    pub excerpt: String,
    /// Relevance score in [0.2, 0.9].
    pub score: f64,
    /// 1-based rank position.
    pub rank: usize,
    pub host: String,
    pub sub_question_ids: Vec<String>,
}

/// Ranking limits.
#[derive(Debug, Clone)]
pub struct RankerSettings {
    /// Leading candidates scored by keyword overlap; the rest keep the baseline.
    pub scored_candidates: usize,
    pub per_domain_cap: usize,
    pub max_ranked_sources: usize,
    pub excerpt_chars: usize,
}

impl Default for RankerSettings {
    fn default() -> Self {
        Self {
            scored_candidates: 30,
            per_domain_cap: 5,
            max_ranked_sources: 100,
            excerpt_chars: 2_000,
        }
    }
}

/// Build candidates in discovery order: fetched documents first, then search
/// results whose URL was not fetched. Duplicate URLs are merged.
pub fn collect_candidates(documents: &[FetchedDocument], search: &SearchOutput) -> Vec<Candidate> {
    // normalized url -> sub-question ids that found it
    let mut found_by: HashMap<String, Vec<String>> = HashMap::new();
    for result in search.all_results() {
        if let (Some(url), Some(sq)) = (&result.url, &result.sub_question_id) {
            let ids = found_by.entry(normalize_url(url)).or_default();
            if !ids.contains(sq) {
                ids.push(sq.clone());
            }
        }
    }

    let mut candidates: Vec<Candidate> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for doc in documents {
        let normalized_url = normalize_url(&doc.url);
        if index.contains_key(&normalized_url) {
            continue;
        }
        index.insert(normalized_url.clone(), candidates.len());
        candidates.push(Candidate {
            url: doc.url.clone(),
            title: doc.title.clone(),
            text: doc.text.clone(),
            fetched: true,
            sub_question_ids: found_by.get(&normalized_url).cloned().unwrap_or_default(),
            normalized_url,
        });
    }

    for result in search.all_results() {
        let Some(url) = &result.url else { continue };
        let normalized_url = normalize_url(url);
        if let Some(&i) = index.get(&normalized_url) {
            let existing = &mut candidates[i];
            if existing.title.trim().is_empty() && !result.title.trim().is_empty() {
                existing.title = result.title.clone();
            }
            if !existing.fetched && existing.text.is_empty() {
                existing.text = result.text.clone();
            }
            continue;
        }
        index.insert(normalized_url.clone(), candidates.len());
        candidates.push(Candidate {
            url: url.clone(),
            title: result.title.clone(),
            text: result.text.clone(),
            fetched: false,
            sub_question_ids: found_by.get(&normalized_url).cloned().unwrap_or_default(),
            normalized_url,
        });
    }
    candidates
}

/// Union of the keywords of every sub-question in the plan.
pub fn plan_keywords(plan: &ExecutionPlan) -> HashSet<String> {
    plan.sub_questions
        .iter()
        .flat_map(|q| extract_keywords(&q.text))
        .collect()
}

/// Lexical relevance: baseline plus 0.4 times the fraction of `keywords`
/// found in the candidate, 0.2 with no overlap. With no keywords at all
/// every candidate keeps the baseline.
pub fn lexical_score(candidate: &Candidate, keywords: &HashSet<String>) -> f64 {
    if keywords.is_empty() {
        return BASELINE_SCORE;
    }
    let words: HashSet<String> = extract_keywords(&candidate.title)
        .into_iter()
        .chain(extract_keywords(&candidate.text))
        .collect();
    let hits = keywords.iter().filter(|k| words.contains(*k)).count();
    if hits == 0 {
        return NO_OVERLAP_SCORE;
    }
    let fraction = hits as f64 / keywords.len() as f64;
    (BASELINE_SCORE + 0.4 * fraction).clamp(NO_OVERLAP_SCORE, MAX_SCORE)
}

/// Score, stably sort, cap per host, truncate and number the candidates.
pub fn rank_sources(
    candidates: Vec<Candidate>,
    keywords: &HashSet<String>,
    settings: &RankerSettings,
) -> Vec<RankedSource> {
    let mut scored: Vec<(Candidate, f64)> = candidates
        .into_iter()
        .enumerate()
        .map(|(i, c)| {
            let score = if i < settings.scored_candidates {
                lexical_score(&c, keywords)
            } else {
                BASELINE_SCORE
            };
            (c, score)
        })
        .collect();

    // sort_by is stable: ties keep discovery order.
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

    let mut per_host: HashMap<String, usize> = HashMap::new();
    let mut ranked = Vec::new();
    for (candidate, score) in scored {
        if ranked.len() >= settings.max_ranked_sources {
            break;
        }
        let host = host_of(&candidate.url);
        let count = per_host.entry(host.clone()).or_insert(0);
        if *count >= settings.per_domain_cap {
            continue;
        }
        *count += 1;
        ranked.push(RankedSource {
            rank: ranked.len() + 1,
            excerpt: truncate_chars(candidate.text.trim(), settings.excerpt_chars),
            url: candidate.url,
            title: candidate.title,
            score,
            host,
            sub_question_ids: candidate.sub_question_ids,
        });
    }
    ranked
}

/// Run the whole ranking phase over a session's payloads.
pub fn rank(
    documents: &[FetchedDocument],
    search: &SearchOutput,
    plan: &ExecutionPlan,
    settings: &RankerSettings,
) -> Vec<RankedSource> {
    let candidates = collect_candidates(documents, search);
    let candidate_count = candidates.len();
    let ranked = rank_sources(candidates, &plan_keywords(plan), settings);
    info!(candidates = candidate_count, ranked = ranked.len(), "Ranking complete");
    ranked
}
