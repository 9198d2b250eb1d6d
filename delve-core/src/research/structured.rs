//! Structured completions: ask the generator for JSON, parse it leniently.
//!
//! Every reasoning phase goes through [`complete_structured`]. A response is
//! accepted when a JSON value can be cut out of it (markdown fences and
//! surrounding prose are tolerated). Callers decide how to degrade when it
//! cannot; [`Structured::parsed`] logs the degradation and records it on the
//! session's warning list.

use crate::error::LlmError;
use crate::generator::{CompletionOptions, TextGenerator};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

/// Outcome of a structured completion.
#[derive(Debug)]
pub enum Structured<T> {
    /// The response contained a JSON value of the expected shape.
    Parsed(T),
    /// The generator answered, but not with usable JSON.
    Unparsed { raw: String, reason: String },
    /// The generator call itself failed.
    Failed(LlmError),
}

impl<T> Structured<T> {
    /// Keep a parsed value; log and record anything else as a warning.
    pub fn parsed(self, task: &str, warnings: &mut Vec<String>) -> Option<T> {
        match self {
            Structured::Parsed(value) => Some(value),
            Structured::Unparsed { reason, .. } => {
                warn!(task, reason = reason.as_str(), "Unparseable structured output, using fallback");
                warnings.push(format!("{task}: unparseable output ({reason})"));
                None
            }
            Structured::Failed(e) => {
                warn!(task, error = %e, "Structured completion failed, using fallback");
                warnings.push(format!("{task}: generation failed ({e})"));
                None
            }
        }
    }
}

/// First line of every pipeline prompt. Also the marker test generators route on.
pub fn task_header(task: &str) -> String {
    format!("Task: {task}\n\n")
}

/// Run one structured completion for `task`.
pub async fn complete_structured<T: DeserializeOwned>(
    generator: &dyn TextGenerator,
    task: &str,
    body: &str,
    options: &CompletionOptions,
) -> Structured<T> {
    let prompt = format!("{}{}", task_header(task), body);
    let raw = match generator.complete(&prompt, options).await {
        Ok(raw) => raw,
        Err(e) => return Structured::Failed(e),
    };
    debug!(task, response_chars = raw.len(), "Structured completion returned");

    let mut first_error: Option<String> = None;
    for json in json_candidates(&raw) {
        match serde_json::from_str::<T>(json) {
            Ok(value) => return Structured::Parsed(value),
            Err(e) => {
                first_error.get_or_insert_with(|| e.to_string());
            }
        }
    }
    Structured::Unparsed {
        reason: first_error.unwrap_or_else(|| "no JSON value found".to_string()),
        raw,
    }
}

/// Body of the first markdown code fence, language tag skipped.
fn fenced_block(response: &str) -> Option<&str> {
    let open = response.find("```")?;
    let after = &response[open + 3..];
    let body = &after[after.find('\n')? + 1..];
    let close = body.find("```")?;
    Some(body[..close].trim())
}

/// The complete JSON value at the start of `text`, if there is one.
fn leading_value(text: &str) -> Option<&str> {
    let mut stream = serde_json::Deserializer::from_str(text).into_iter::<Value>();
    match stream.next() {
        Some(Ok(_)) => Some(text[..stream.byte_offset()].trim()),
        _ => None,
    }
}

/// Complete JSON values found in a model response, most likely first: the
/// body of a fenced block, then every top-level object or array in order of
/// its opening bracket. Values nested inside an earlier candidate are not
/// yielded. Prose such as "source [1]" yields a candidate too, so callers
/// try each one against the shape they expect.
pub fn json_candidates(response: &str) -> impl Iterator<Item = &str> {
    let fenced = fenced_block(response).and_then(leading_value);
    let mut covered = 0;
    let inline = response
        .match_indices(['{', '['])
        .filter_map(move |(start, _)| {
            if start < covered {
                return None;
            }
            let value = leading_value(&response[start..])?;
            covered = start + value.len();
            Some(value)
        });
    fenced.into_iter().chain(inline)
}

/// The first complete JSON value in a model response.
pub fn extract_json(response: &str) -> Option<&str> {
    json_candidates(response).next()
}

/// Prepare untrusted text (queries, page excerpts) for embedding in a prompt:
/// truncate to `max_chars`, neutralize angle brackets, drop control characters.
pub fn prompt_safe(input: &str, max_chars: usize) -> String {
    let mut result = String::with_capacity(input.len().min(max_chars));
    for ch in input.chars().take(max_chars) {
        match ch {
            '<' => result.push_str("&lt;"),
            '>' => result.push_str("&gt;"),
            c if c.is_control() && c != '\n' && c != '\t' => {}
            c => result.push(c),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::MockTextGenerator;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Answer {
        answer: String,
    }

    #[test]
    fn test_extract_json_from_fenced_block() {
        let raw = "Here you go:\n```json\n{\"answer\": \"42\"}\n```\nAnything else?";
        assert_eq!(extract_json(raw), Some("{\"answer\": \"42\"}"));
    }

    #[test]
    fn test_extract_json_array() {
        assert_eq!(extract_json("list: [1, 2, 3]."), Some("[1, 2, 3]"));
    }

    #[test]
    fn test_candidates_skip_bracketed_prose() {
        let raw = "Based on source [1], here is the result:\n{\"answer\": \"x\", \"ids\": [1]}";
        let found: Vec<&str> = json_candidates(raw).collect();
        assert_eq!(found[0], "[1]");
        assert_eq!(found[1], "{\"answer\": \"x\", \"ids\": [1]}");
    }

    #[test]
    fn test_candidates_skip_nested_values() {
        let found: Vec<&str> = json_candidates("{\"data\": {\"answer\": \"x\"}}").collect();
        assert_eq!(found, vec!["{\"data\": {\"answer\": \"x\"}}"]);
    }

    #[test]
    fn test_candidates_skip_unbalanced_brackets() {
        let raw = "{ draft... [see notes\n```json\n{\"answer\": \"ok\"}\n```";
        assert_eq!(extract_json(raw), Some("{\"answer\": \"ok\"}"));
    }

    #[test]
    fn test_extract_json_none() {
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json("} backwards {"), None);
    }

    #[test]
    fn test_prompt_safe() {
        assert_eq!(prompt_safe("<b>hi</b>\u{7}", 100), "&lt;b&gt;hi&lt;/b&gt;");
        assert_eq!(prompt_safe("héllo world", 5), "héllo");
    }

    #[tokio::test]
    async fn test_complete_structured_parsed() {
        let generator =
            MockTextGenerator::new().with_route("Task: answer", "Sure! {\"answer\": \"yes\"}");
        let result: Structured<Answer> =
            complete_structured(&generator, "answer", "Is it?", &CompletionOptions::json()).await;
        assert!(matches!(result, Structured::Parsed(Answer { ref answer }) if answer == "yes"));
        assert!(generator.prompts()[0].starts_with("Task: answer\n\n"));
    }

    #[tokio::test]
    async fn test_complete_structured_after_citation_marker() {
        let generator = MockTextGenerator::new().with_route(
            "Task: answer",
            "Based on source [1], here is the result:\n{\"answer\": \"x\", \"ids\": [1]}",
        );
        let result: Structured<Answer> =
            complete_structured(&generator, "answer", "", &CompletionOptions::json()).await;
        assert!(matches!(result, Structured::Parsed(Answer { ref answer }) if answer == "x"));
    }

    #[tokio::test]
    async fn test_complete_structured_unparsed_records_warning() {
        let generator = MockTextGenerator::new();
        let result: Structured<Answer> =
            complete_structured(&generator, "answer", "Is it?", &CompletionOptions::json()).await;
        let mut warnings = Vec::new();
        assert!(result.parsed("answer", &mut warnings).is_none());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("answer: unparseable output"));
    }

    #[tokio::test]
    async fn test_complete_structured_wrong_shape() {
        let generator = MockTextGenerator::new().with_route("Task: answer", "{\"other\": 1}");
        let result: Structured<Answer> =
            complete_structured(&generator, "answer", "", &CompletionOptions::json()).await;
        assert!(matches!(result, Structured::Unparsed { .. }));
    }

    #[tokio::test]
    async fn test_complete_structured_failed() {
        let generator = MockTextGenerator::failing();
        let result: Structured<Answer> =
            complete_structured(&generator, "answer", "", &CompletionOptions::json()).await;
        assert!(matches!(result, Structured::Failed(LlmError::ApiRequest { .. })));
    }
}
