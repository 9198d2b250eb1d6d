//! Final report assembly.
//!
//! One generator call turns the syntheses into an eight-section report.
//! Whatever the generator leaves out is filled in locally: citations come
//! from the ranked sources, the markdown body from the sections. If the
//! response cannot be parsed the raw text is kept as the body; if the call
//! fails the whole report is rendered locally. Either way the report is
//! marked degraded with zero confidence.

use super::contradiction::Contradiction;
use super::ranker::RankedSource;
use super::search::truncate_chars;
use super::structured::{Structured, complete_structured, prompt_safe};
use super::synthesis::Synthesis;
use crate::generator::{CompletionOptions, TextGenerator};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

/// Report sections, in order.
pub const SECTION_TITLES: [&str; 8] = [
    "Executive Summary",
    "Introduction",
    "Findings",
    "Takeaways",
    "Analysis",
    "Limitations",
    "Further Research",
    "Conclusion",
];

/// Citations derived when no synthesis names a source.
const DEFAULT_CITATIONS: usize = 10;
const SUMMARY_CHARS: usize = 280;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportSection {
    pub title: String,
    pub content: String,
}

/// A numbered reference. `id` is the source's rank position, so `[id]`
/// markers in synthesized text resolve to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    pub id: usize,
    pub url: String,
    pub title: String,
    /// Access date, `YYYY-MM-DD`.
    pub accessed: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceScores {
    pub overall: f64,
    /// Per-section confidence keyed by section title.
    pub sections: BTreeMap<String, f64>,
}

/// The final research report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Report {
    pub markdown: String,
    pub sections: Vec<ReportSection>,
    pub citations: Vec<Citation>,
    pub bibliography: Vec<String>,
    pub confidence: ConfidenceScores,
    /// One-line summary.
    pub summary: String,
    /// Whether the report came from a fallback path.
    pub degraded: bool,
}

#[derive(Deserialize)]
struct CitationIn {
    #[serde(default)]
    id: Option<usize>,
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default, alias = "access_date", alias = "accessDate")]
    accessed: Option<String>,
}

#[derive(Deserialize)]
struct WriterResponse {
    #[serde(default, alias = "report", alias = "body")]
    markdown: Option<String>,
    #[serde(default)]
    sections: Value,
    #[serde(default)]
    citations: Vec<CitationIn>,
    #[serde(default)]
    bibliography: Vec<String>,
    #[serde(default)]
    confidence: Value,
    #[serde(default, alias = "one_line_summary", alias = "oneLineSummary")]
    summary: Option<String>,
}

/// Writes the final report.
pub struct ReportWriter {
    generator: Arc<dyn TextGenerator>,
}

impl ReportWriter {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    /// Produce the report. Never fails.
    pub async fn write(
        &self,
        query: &str,
        syntheses: &[Synthesis],
        ranked: &[RankedSource],
        contradictions: &[Contradiction],
        warnings: &mut Vec<String>,
    ) -> Report {
        let body = build_prompt(query, syntheses, ranked, contradictions);
        let result = complete_structured::<WriterResponse>(
            self.generator.as_ref(),
            "write-report",
            &body,
            &CompletionOptions::json().with_max_tokens(8_192),
        )
        .await;

        let accessed = today();
        let report = match result {
            Structured::Parsed(response) => {
                assemble(query, response, syntheses, ranked, &accessed)
            }
            Structured::Unparsed { raw, reason } => {
                warn!(reason = reason.as_str(), "Report output unparseable, keeping raw text");
                warnings.push(format!("write-report: unparseable output ({reason})"));
                raw_report(raw, syntheses, ranked, &accessed)
            }
            Structured::Failed(e) => {
                warn!(error = %e, "Report generation failed, rendering locally");
                warnings.push(format!("write-report: generation failed ({e})"));
                render_fallback(query, syntheses, ranked, contradictions, &accessed)
            }
        };
        info!(
            sections = report.sections.len(),
            citations = report.citations.len(),
            degraded = report.degraded,
            "Report written"
        );
        report
    }
}

fn today() -> String {
    Utc::now().date_naive().format("%Y-%m-%d").to_string()
}

fn build_prompt(
    query: &str,
    syntheses: &[Synthesis],
    ranked: &[RankedSource],
    contradictions: &[Contradiction],
) -> String {
    let mut body = format!(
        "Write a research report answering the query below. Use exactly these markdown \
         sections: {}. Cite sources with their bracketed numbers. Respond with JSON: \
         {{\"markdown\": \"...\", \"sections\": [{{\"title\": \"...\", \"content\": \"...\"}}], \
         \"citations\": [{{\"id\": 1, \"url\": \"...\", \"title\": \"...\"}}], \
         \"bibliography\": [\"...\"], \"confidence\": {{\"overall\": 0.0-1.0, \
         \"sections\": {{\"Findings\": 0.0-1.0}}}}, \"summary\": \"one line\"}}\n\n\
         Query: {}\n\nFindings:\n",
        SECTION_TITLES.join(", "),
        prompt_safe(query, 2_000)
    );
    for s in syntheses {
        let sources: Vec<String> = s.supporting_sources.iter().map(|n| format!("[{n}]")).collect();
        body.push_str(&format!(
            "- {} (confidence {:.2}) {}\n  {}\n",
            prompt_safe(&s.sub_question, 300),
            s.confidence,
            sources.join(""),
            prompt_safe(&s.answer, 2_000)
        ));
        for point in &s.key_points {
            body.push_str(&format!("  * {}\n", prompt_safe(point, 300)));
        }
    }
    body.push_str("\nSources:\n");
    for source in cited_sources(syntheses, ranked) {
        body.push_str(&format!(
            "[{}] {} ({})\n",
            source.rank,
            prompt_safe(&source.title, 300),
            source.url
        ));
    }
    if !contradictions.is_empty() {
        body.push_str("\nContradictions:\n");
        for c in contradictions {
            body.push_str(&format!(
                "- \"{}\" vs \"{}\"\n",
                prompt_safe(&c.claim_a, 300),
                prompt_safe(&c.claim_b, 300)
            ));
        }
    }
    body
}

/// Ranked sources named by any synthesis, in rank order. Falls back to the
/// top ranked sources when none are named.
fn cited_sources<'a>(syntheses: &[Synthesis], ranked: &'a [RankedSource]) -> Vec<&'a RankedSource> {
    let named: BTreeSet<usize> = syntheses
        .iter()
        .flat_map(|s| s.supporting_sources.iter().copied())
        .collect();
    if named.is_empty() {
        ranked.iter().take(DEFAULT_CITATIONS).collect()
    } else {
        ranked.iter().filter(|s| named.contains(&s.rank)).collect()
    }
}

/// Citations for the sources the syntheses relied on.
pub fn derive_citations(
    syntheses: &[Synthesis],
    ranked: &[RankedSource],
    accessed: &str,
) -> Vec<Citation> {
    cited_sources(syntheses, ranked)
        .into_iter()
        .map(|s| Citation {
            id: s.rank,
            url: s.url.clone(),
            title: if s.title.trim().is_empty() {
                s.host.clone()
            } else {
                s.title.clone()
            },
            accessed: accessed.to_string(),
        })
        .collect()
}

fn bibliography_for(citations: &[Citation]) -> Vec<String> {
    citations
        .iter()
        .map(|c| format!("[{}] {}. {}. Accessed {}.", c.id, c.title, c.url, c.accessed))
        .collect()
}

/// Render sections as a markdown document.
pub fn render_markdown(title: &str, sections: &[ReportSection], bibliography: &[String]) -> String {
    let mut out = format!("# {title}\n\n");
    for section in sections {
        out.push_str(&format!("## {}\n\n{}\n\n", section.title, section.content.trim()));
    }
    if !bibliography.is_empty() {
        out.push_str("## References\n\n");
        for entry in bibliography {
            out.push_str(&format!("- {entry}\n"));
        }
    }
    out
}

/// Split a markdown body on `## ` headings.
fn sections_from_markdown(markdown: &str) -> Vec<ReportSection> {
    let mut sections: Vec<ReportSection> = Vec::new();
    for line in markdown.lines() {
        if let Some(title) = line.strip_prefix("## ") {
            sections.push(ReportSection {
                title: title.trim().to_string(),
                content: String::new(),
            });
        } else if let Some(current) = sections.last_mut() {
            current.content.push_str(line);
            current.content.push('\n');
        }
    }
    for section in &mut sections {
        section.content = section.content.trim().to_string();
    }
    sections
}

fn parse_sections(value: &Value) -> Vec<ReportSection> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                let title = item.get("title").or_else(|| item.get("name"))?.as_str()?;
                let content = item
                    .get("content")
                    .or_else(|| item.get("text"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Some(ReportSection {
                    title: title.to_string(),
                    content: content.to_string(),
                })
            })
            .collect(),
        Value::Object(map) => {
            // Keep the canonical section order when the generator used a map.
            let mut sections: Vec<ReportSection> = map
                .iter()
                .filter_map(|(title, content)| {
                    Some(ReportSection {
                        title: title.clone(),
                        content: content.as_str()?.to_string(),
                    })
                })
                .collect();
            sections.sort_by_key(|s| {
                SECTION_TITLES
                    .iter()
                    .position(|t| t.eq_ignore_ascii_case(&s.title))
                    .unwrap_or(SECTION_TITLES.len())
            });
            sections
        }
        _ => Vec::new(),
    }
}

fn parse_confidence(value: &Value, syntheses: &[Synthesis]) -> ConfidenceScores {
    let clamp = |v: f64| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
    match value {
        Value::Number(n) => ConfidenceScores {
            overall: clamp(n.as_f64().unwrap_or(0.0)),
            sections: BTreeMap::new(),
        },
        Value::Object(map) => {
            let sections = map
                .get("sections")
                .or_else(|| map.get("per_section"))
                .and_then(Value::as_object)
                .map(|s| {
                    s.iter()
                        .filter_map(|(k, v)| Some((k.clone(), clamp(v.as_f64()?))))
                        .collect()
                })
                .unwrap_or_default();
            let overall = map
                .get("overall")
                .and_then(Value::as_f64)
                .map(clamp)
                .unwrap_or_else(|| mean_confidence(syntheses));
            ConfidenceScores { overall, sections }
        }
        _ => ConfidenceScores {
            overall: mean_confidence(syntheses),
            sections: BTreeMap::new(),
        },
    }
}

/// Mean confidence of the non-degraded syntheses; 0 when there are none.
fn mean_confidence(syntheses: &[Synthesis]) -> f64 {
    let usable: Vec<f64> = syntheses
        .iter()
        .filter(|s| !s.degraded)
        .map(|s| s.confidence)
        .collect();
    if usable.is_empty() {
        0.0
    } else {
        usable.iter().sum::<f64>() / usable.len() as f64
    }
}

/// First non-heading line of the body, bounded.
fn summary_from(sections: &[ReportSection], markdown: &str) -> String {
    let source = sections
        .first()
        .map(|s| s.content.as_str())
        .filter(|c| !c.trim().is_empty())
        .unwrap_or(markdown);
    let line = source
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .unwrap_or_default();
    truncate_chars(line, SUMMARY_CHARS)
}

fn assemble(
    query: &str,
    response: WriterResponse,
    syntheses: &[Synthesis],
    ranked: &[RankedSource],
    accessed: &str,
) -> Report {
    let mut citations: Vec<Citation> = response
        .citations
        .into_iter()
        .enumerate()
        .map(|(i, c)| Citation {
            id: c.id.unwrap_or(i + 1),
            url: c.url,
            title: c.title,
            accessed: c.accessed.unwrap_or_else(|| accessed.to_string()),
        })
        .collect();
    if citations.is_empty() {
        citations = derive_citations(syntheses, ranked, accessed);
    }

    let bibliography = if response.bibliography.is_empty() {
        bibliography_for(&citations)
    } else {
        response.bibliography
    };

    let mut sections = parse_sections(&response.sections);
    let markdown = match response.markdown.filter(|m| !m.trim().is_empty()) {
        Some(markdown) => {
            if sections.is_empty() {
                sections = sections_from_markdown(&markdown);
            }
            markdown
        }
        None => render_markdown(query, &sections, &bibliography),
    };

    let summary = response
        .summary
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| summary_from(&sections, &markdown));

    Report {
        confidence: parse_confidence(&response.confidence, syntheses),
        markdown,
        sections,
        citations,
        bibliography,
        summary,
        degraded: false,
    }
}

fn raw_report(raw: String, syntheses: &[Synthesis], ranked: &[RankedSource], accessed: &str) -> Report {
    let citations = derive_citations(syntheses, ranked, accessed);
    let sections = sections_from_markdown(&raw);
    Report {
        summary: summary_from(&sections, &raw),
        bibliography: bibliography_for(&citations),
        markdown: raw,
        sections,
        citations,
        confidence: ConfidenceScores::default(),
        degraded: true,
    }
}

/// Render a complete report from the syntheses without the generator.
pub fn render_fallback(
    query: &str,
    syntheses: &[Synthesis],
    ranked: &[RankedSource],
    contradictions: &[Contradiction],
    accessed: &str,
) -> Report {
    let answered: Vec<&Synthesis> = syntheses.iter().filter(|s| !s.degraded).collect();
    let refs = |s: &Synthesis| -> String {
        s.supporting_sources.iter().map(|n| format!(" [{n}]")).collect()
    };

    let executive = match answered.first() {
        Some(first) => format!(
            "{} of {} sub-questions were answered from {} ranked sources. {}",
            answered.len(),
            syntheses.len(),
            ranked.len(),
            first.answer
        ),
        None => format!(
            "No sub-question could be answered from the {} ranked sources.",
            ranked.len()
        ),
    };

    let mut findings = String::new();
    for s in syntheses {
        findings.push_str(&format!("### {}\n\n{}{}\n\n", s.sub_question, s.answer, refs(s)));
    }

    let takeaways: Vec<String> = answered
        .iter()
        .flat_map(|s| s.key_points.iter().map(|p| format!("- {p}")))
        .collect();

    let analysis = if contradictions.is_empty() {
        "No contradictions were detected across sub-questions.".to_string()
    } else {
        contradictions
            .iter()
            .map(|c| format!("- **{}** vs **{}** ({:?})", c.claim_a, c.claim_b, c.kind))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let failed = syntheses.len() - answered.len();
    let mut limitations = vec![
        "This report was assembled locally because the report writer was unavailable.".to_string(),
    ];
    if failed > 0 {
        limitations.push(format!("{failed} sub-question(s) could not be synthesized."));
    }

    let further: Vec<String> = syntheses
        .iter()
        .filter(|s| s.degraded || s.confidence < 0.5)
        .map(|s| format!("- {}", s.sub_question))
        .collect();

    let mean = mean_confidence(syntheses);
    let contents = [
        executive.clone(),
        format!("Research query: {query}"),
        findings,
        if takeaways.is_empty() {
            "No key points were extracted.".to_string()
        } else {
            takeaways.join("\n")
        },
        analysis,
        limitations.join(" "),
        if further.is_empty() {
            "All sub-questions were answered with reasonable confidence.".to_string()
        } else {
            further.join("\n")
        },
        format!(
            "Average confidence across answered sub-questions is {:.0}%.",
            mean * 100.0
        ),
    ];
    let sections: Vec<ReportSection> = SECTION_TITLES
        .iter()
        .zip(contents)
        .map(|(title, content)| ReportSection {
            title: title.to_string(),
            content,
        })
        .collect();

    let citations = derive_citations(syntheses, ranked, accessed);
    let bibliography = bibliography_for(&citations);
    Report {
        markdown: render_markdown(query, &sections, &bibliography),
        summary: truncate_chars(&executive, SUMMARY_CHARS),
        sections,
        citations,
        bibliography,
        confidence: ConfidenceScores::default(),
        degraded: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::MockTextGenerator;

    fn synthesis(id: &str, sources: &[usize]) -> Synthesis {
        Synthesis {
            sub_question_id: id.into(),
            sub_question: format!("Question {id}?"),
            answer: format!("Answer {id}."),
            key_points: vec![format!("Point {id}")],
            confidence: 0.8,
            supporting_sources: sources.to_vec(),
            degraded: false,
        }
    }

    fn ranked(n: usize) -> Vec<RankedSource> {
        (1..=n)
            .map(|rank| RankedSource {
                url: format!("https://s{rank}.example"),
                title: format!("Source {rank}"),
                excerpt: String::new(),
                score: 0.5,
                rank,
                host: format!("s{rank}.example"),
                sub_question_ids: Vec::new(),
            })
            .collect()
    }

    async fn write_with(generator: MockTextGenerator) -> (Report, Vec<String>) {
        let writer = ReportWriter::new(Arc::new(generator));
        let mut warnings = Vec::new();
        let report = writer
            .write(
                "EV batteries",
                &[synthesis("q1", &[2]), synthesis("q2", &[3, 2])],
                &ranked(4),
                &[],
                &mut warnings,
            )
            .await;
        (report, warnings)
    }

    #[tokio::test]
    async fn test_structured_report_with_derived_citations() {
        let generator = MockTextGenerator::new().with_route(
            "Task: write-report",
            r#"{"sections": [{"title": "Executive Summary", "content": "Batteries differ."},
                             {"title": "Findings", "content": "LFP is cheaper [2]."}],
                "confidence": {"overall": 0.7, "sections": {"Findings": 0.9}},
                "summary": "LFP wins on cost."}"#,
        );
        let (report, warnings) = write_with(generator).await;
        assert!(warnings.is_empty());
        assert!(!report.degraded);
        let ids: Vec<usize> = report.citations.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert!(report.markdown.starts_with("# EV batteries"));
        assert!(report.markdown.contains("## Findings\n\nLFP is cheaper [2]."));
        assert!(report.markdown.contains("## References"));
        assert_eq!(report.confidence.overall, 0.7);
        assert_eq!(report.confidence.sections["Findings"], 0.9);
        assert_eq!(report.summary, "LFP wins on cost.");
        assert_eq!(report.bibliography.len(), 2);
    }

    #[tokio::test]
    async fn test_markdown_only_response_gets_sections() {
        let generator = MockTextGenerator::new().with_route(
            "Task: write-report",
            "{\"markdown\": \"# R\\n\\n## Executive Summary\\n\\nShort answer.\\n\\n## Conclusion\\n\\nDone.\"}",
        );
        let (report, _) = write_with(generator).await;
        assert_eq!(report.sections.len(), 2);
        assert_eq!(report.sections[1].title, "Conclusion");
        assert_eq!(report.summary, "Short answer.");
        assert!((report.confidence.overall - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unparseable_output_kept_verbatim() {
        let generator = MockTextGenerator::new()
            .with_route("Task: write-report", "## Executive Summary\n\nPlain prose report.");
        let (report, warnings) = write_with(generator).await;
        assert!(report.degraded);
        assert_eq!(report.markdown, "## Executive Summary\n\nPlain prose report.");
        assert_eq!(report.confidence.overall, 0.0);
        assert_eq!(report.summary, "Plain prose report.");
        assert_eq!(warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_generator_failure_renders_locally() {
        let (report, warnings) = write_with(MockTextGenerator::failing()).await;
        assert!(report.degraded);
        assert_eq!(report.sections.len(), SECTION_TITLES.len());
        let titles: Vec<&str> = report.sections.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, SECTION_TITLES.to_vec());
        assert!(report.markdown.contains("### Question q1?"));
        assert!(report.markdown.contains("Answer q2. [3] [2]"));
        assert_eq!(report.confidence.overall, 0.0);
        assert!(warnings[0].contains("generation failed"));
    }

    #[test]
    fn test_citations_fall_back_to_top_sources() {
        let citations = derive_citations(&[synthesis("q1", &[])], &ranked(15), "2026-01-01");
        assert_eq!(citations.len(), DEFAULT_CITATIONS);
        assert_eq!(citations[0].accessed, "2026-01-01");
    }

    #[test]
    fn test_section_map_uses_canonical_order() {
        let value = serde_json::json!({"Conclusion": "c", "Findings": "f", "Extra": "x"});
        let titles: Vec<String> = parse_sections(&value).into_iter().map(|s| s.title).collect();
        assert_eq!(titles, vec!["Findings", "Conclusion", "Extra"]);
    }
}
