//! Parsing of raw model output into reasoning, verdict and visible content.
//!
//! A final answer may carry a private reasoning block, free text, and a
//! trailing JSON verdict (optionally inside a ```json fence). Two reasoning
//! formats are recognised: a tag pair (`<think>...</think>`) and an open
//! marker whose close marker may be missing (`<unused94>thought ...`). When
//! the close marker is missing the block runs up to the verdict, or to the
//! end of the text when there is no verdict.

pub mod directive;
pub mod verdict;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use directive::extract_directive;
pub use verdict::{TriageLevel, TriageVerdict};

/// An open/close marker pair delimiting a reasoning block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningDelimiter {
    pub open: String,
    /// Empty for formats that never emit a close marker.
    #[serde(default)]
    pub close: String,
}

impl ReasoningDelimiter {
    pub fn new(open: impl Into<String>, close: impl Into<String>) -> Self {
        Self {
            open: open.into(),
            close: close.into(),
        }
    }

    fn markers(&self) -> impl Iterator<Item = &str> {
        [self.open.as_str(), self.close.as_str()]
            .into_iter()
            .filter(|marker| !marker.is_empty())
    }
}

pub fn default_delimiters() -> Vec<ReasoningDelimiter> {
    vec![
        ReasoningDelimiter::new("<think>", "</think>"),
        ReasoningDelimiter::new("<thinking>", "</thinking>"),
        ReasoningDelimiter::new("<unused94>thought", "<unused95>"),
    ]
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedModelOutput {
    pub reasoning: String,
    pub final_verdict: Option<Value>,
    pub remaining_content: String,
}

impl ParsedModelOutput {
    pub fn verdict(&self) -> Option<TriageVerdict> {
        self.final_verdict.as_ref().map(TriageVerdict::from_value)
    }

    /// Visible assessment: remaining text followed by the verdict card.
    /// The reasoning block is never rendered.
    pub fn render(&self) -> String {
        let mut sections = Vec::new();
        if !self.remaining_content.is_empty() {
            sections.push(self.remaining_content.clone());
        }
        if let Some(verdict) = self.verdict() {
            sections.push(verdict.to_string());
        }
        if sections.is_empty() {
            return "No assessment was returned.".to_string();
        }
        sections.join("\n\n")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseParser {
    delimiters: Vec<ReasoningDelimiter>,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new(default_delimiters())
    }
}

impl ResponseParser {
    pub fn new(delimiters: Vec<ReasoningDelimiter>) -> Self {
        let delimiters = delimiters
            .into_iter()
            .filter(|d| !d.open.is_empty())
            .collect();
        Self { delimiters }
    }

    pub fn delimiters(&self) -> &[ReasoningDelimiter] {
        &self.delimiters
    }

    /// Total: every input, including the empty string, yields a value.
    pub fn parse(&self, raw: &str) -> ParsedModelOutput {
        let (mut text, thoughts) = self.extract_reasoning(raw);
        text = self.scrub_markers(text);

        let final_verdict = match locate_verdict(&text) {
            Some(found) => {
                let (start, end) = widen_to_fence(&text, found.start, found.end);
                text.replace_range(start..end, "");
                Some(found.value)
            }
            None => None,
        };
        // Removing the verdict can splice a marker back together.
        text = self.scrub_markers(text);

        ParsedModelOutput {
            reasoning: thoughts.join("\n\n"),
            final_verdict,
            remaining_content: text.trim().to_string(),
        }
    }

    fn extract_reasoning(&self, raw: &str) -> (String, Vec<String>) {
        let mut text = raw.to_string();
        let mut thoughts = Vec::new();

        while let Some((start, delimiter)) = self.earliest_open(&text) {
            let content_start = start + delimiter.open.len();
            let closed = (!delimiter.close.is_empty())
                .then(|| text[content_start..].find(delimiter.close.as_str()))
                .flatten();

            let (content_end, remove_end) = match closed {
                Some(rel_end) => {
                    let end = content_start + rel_end;
                    (end, end + delimiter.close.len())
                }
                None => {
                    let end = verdict_start(&text[content_start..])
                        .map(|rel| content_start + rel)
                        .unwrap_or(text.len());
                    (end, end)
                }
            };

            let thought = text[content_start..content_end].trim();
            if !thought.is_empty() {
                thoughts.push(thought.to_string());
            }
            text.replace_range(start..remove_end, "");
        }

        (text, thoughts)
    }

    fn earliest_open(&self, text: &str) -> Option<(usize, ReasoningDelimiter)> {
        self.delimiters
            .iter()
            .filter_map(|d| text.find(d.open.as_str()).map(|pos| (pos, d)))
            .min_by(|(a_pos, a), (b_pos, b)| {
                a_pos
                    .cmp(b_pos)
                    .then_with(|| b.open.len().cmp(&a.open.len()))
            })
            .map(|(pos, d)| (pos, d.clone()))
    }

    /// Drops stray markers (e.g. a close tag with no opener) until none remain.
    fn scrub_markers(&self, mut text: String) -> String {
        loop {
            let next = self
                .delimiters
                .iter()
                .flat_map(ReasoningDelimiter::markers)
                .filter_map(|marker| text.find(marker).map(|pos| (pos, marker.len())))
                .min();
            match next {
                Some((pos, len)) => text.replace_range(pos..pos + len, ""),
                None => return text,
            }
        }
    }
}

struct VerdictSpan {
    start: usize,
    end: usize,
    value: Value,
}

/// The span from the first `{` to the last `}`, if it parses as a JSON object.
fn locate_verdict(text: &str) -> Option<VerdictSpan> {
    let start = text.find('{')?;
    let close = text.rfind('}')?;
    if close < start {
        return None;
    }
    let end = close + 1;
    match serde_json::from_str::<Value>(&text[start..end]) {
        Ok(value) if value.is_object() => Some(VerdictSpan { start, end, value }),
        _ => None,
    }
}

/// Where an open-only reasoning block ends: at the verdict (or its fence).
fn verdict_start(text: &str) -> Option<usize> {
    let found = locate_verdict(text)?;
    Some(widen_to_fence(text, found.start, found.end).0)
}

/// Extends a verdict span over a surrounding ```json ... ``` fence.
fn widen_to_fence(text: &str, start: usize, end: usize) -> (usize, usize) {
    let before = text[..start].trim_end();
    let after = &text[end..];
    let after_trimmed = after.trim_start();

    let fence_open = ["```json", "```JSON", "```"]
        .iter()
        .find(|fence| before.ends_with(*fence))
        .map(|fence| before.len() - fence.len());

    match (fence_open, after_trimmed.starts_with("```")) {
        (Some(open), true) => {
            let close = end + (after.len() - after_trimmed.len()) + 3;
            (open, close)
        }
        _ => (start, end),
    }
}

/// Parses with the default delimiter set.
pub fn parse(raw: &str) -> ParsedModelOutput {
    ResponseParser::default().parse(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_text_has_no_reasoning_or_verdict() {
        let parsed = parse("  Just a report.\n");
        assert_eq!(parsed.reasoning, "");
        assert_eq!(parsed.final_verdict, None);
        assert_eq!(parsed.remaining_content, "Just a report.");
    }

    #[test]
    fn empty_input_is_valid() {
        assert_eq!(parse(""), ParsedModelOutput::default());
    }

    #[test]
    fn closed_think_block_and_verdict() {
        let raw = "<think>\nThis is a thought.\n</think>\n{\n  \"triage_level\": \"EMERGENCY\",\n  \"reason\": \"Test\"\n}";
        let parsed = parse(raw);
        assert_eq!(parsed.reasoning, "This is a thought.");
        assert_eq!(
            parsed.final_verdict,
            Some(json!({"triage_level": "EMERGENCY", "reason": "Test"}))
        );
        assert_eq!(parsed.remaining_content, "");
    }

    #[test]
    fn think_block_report_and_trailing_verdict() {
        let raw = "<think>Thinking about the patient...</think>\n        Here is the report.\n        { \"score\": 5 }\n        ";
        let parsed = parse(raw);
        assert_eq!(parsed.reasoning, "Thinking about the patient...");
        assert_eq!(parsed.final_verdict, Some(json!({"score": 5})));
        assert_eq!(parsed.remaining_content, "Here is the report.");
    }

    #[test]
    fn unused_token_format_with_close_marker() {
        let parsed = parse("<unused94>thought\nThinking...\n<unused95>\nHello World");
        assert_eq!(parsed.reasoning, "Thinking...");
        assert_eq!(parsed.remaining_content, "Hello World");
        assert!(parsed.final_verdict.is_none());
    }

    #[test]
    fn open_only_marker_runs_until_verdict() {
        let raw = "<unused94>thought\nHR 130, hypotensive.\n{\"triage_level\": \"URGENT\"}";
        let parsed = parse(raw);
        assert_eq!(parsed.reasoning, "HR 130, hypotensive.");
        assert_eq!(parsed.final_verdict, Some(json!({"triage_level": "URGENT"})));
        assert_eq!(parsed.remaining_content, "");
    }

    #[test]
    fn open_only_marker_without_verdict_runs_to_end() {
        let parsed = parse("Visible preamble <think> unfinished reasoning");
        assert_eq!(parsed.reasoning, "unfinished reasoning");
        assert_eq!(parsed.remaining_content, "Visible preamble");
    }

    #[test]
    fn fenced_json_verdict_is_removed_with_its_fence() {
        let raw = "<think>\n        Analysis complete.\n        </think>\n        # Report\n        Patient stable.\n\n        ```json\n        {\"news2_score\": 5, \"triage_level\": \"Urgent\"}\n        ```\n        ";
        let parsed = parse(raw);
        assert_eq!(parsed.reasoning, "Analysis complete.");
        assert_eq!(parsed.final_verdict.as_ref().unwrap()["news2_score"], 5);
        assert!(!parsed.remaining_content.contains("```"));
        assert!(parsed.remaining_content.contains("# Report"));
        assert_eq!(parsed.verdict().unwrap().triage_level, TriageLevel::Urgent);
    }

    #[test]
    fn malformed_braces_leave_content_untouched() {
        let raw = "<think>x</think>Assessment {not json at all}";
        let parsed = parse(raw);
        assert!(parsed.final_verdict.is_none());
        assert_eq!(parsed.remaining_content, "Assessment {not json at all}");
    }

    #[test]
    fn unbalanced_braces_do_not_panic() {
        for raw in ["}{", "{", "}", "{{{", "text } then {"] {
            let parsed = parse(raw);
            assert!(parsed.final_verdict.is_none(), "input {raw:?}");
            assert_eq!(parsed.remaining_content, raw.trim());
        }
    }

    #[test]
    fn stray_close_marker_is_scrubbed() {
        let parsed = parse("Result </think> follows");
        assert_eq!(parsed.reasoning, "");
        assert_eq!(parsed.remaining_content, "Result  follows");
    }

    #[test]
    fn multiple_blocks_are_joined() {
        let parsed = parse("<thinking>plan</thinking>\n<think>detail</think>\nDone");
        assert_eq!(parsed.reasoning, "plan\n\ndetail");
        assert_eq!(parsed.remaining_content, "Done");
    }

    #[test]
    fn round_trips_reasoning_and_verdict() {
        let verdict = json!({
            "triage_level": "STABLE",
            "clinical_rationale": "Normal vitals",
            "recommended_actions": ["Discharge with advice"]
        });
        let raw = format!("<think>Vitals within range</think>{}", verdict);
        let parsed = parse(&raw);
        assert_eq!(parsed.reasoning, "Vitals within range");
        assert_eq!(parsed.final_verdict, Some(verdict));
        assert_eq!(parsed.remaining_content, "");
    }

    #[test]
    fn reparsing_remaining_content_is_stable() {
        let samples = [
            "<think>a</think> intro {\"k\": 1} outro",
            "pre ```json\n{\"k\": [1, 2]}\n``` post",
            "<unused94>thought r {\"k\": true}",
            "text } then { more",
            "{\"a\": 1} and {\"b\": 2}",
            "<thi</think>nk> odd",
            "<th{\"x\": 1}ink> spliced",
        ];
        for raw in samples {
            let first = parse(raw);
            let second = parse(&first.remaining_content);
            assert_eq!(second.reasoning, "", "input {raw:?}");
            assert_eq!(
                second.remaining_content, first.remaining_content,
                "input {raw:?}"
            );
        }
    }

    #[test]
    fn remaining_content_never_contains_markers() {
        let parser = ResponseParser::default();
        for raw in [
            "<think>a</think></think>b",
            "<unused95> c <unused94>thought",
            "<th{\"x\": 1}ink> spliced",
        ] {
            let parsed = parser.parse(raw);
            for d in parser.delimiters() {
                assert!(!parsed.remaining_content.contains(d.open.as_str()));
                if !d.close.is_empty() {
                    assert!(!parsed.remaining_content.contains(d.close.as_str()));
                }
            }
        }
    }

    #[test]
    fn custom_delimiters_replace_defaults() {
        let parser = ResponseParser::new(vec![ReasoningDelimiter::new("[[", "]]")]);
        let parsed = parser.parse("[[hidden]] shown <think>kept</think>");
        assert_eq!(parsed.reasoning, "hidden");
        assert_eq!(parsed.remaining_content, "shown <think>kept</think>");
    }

    #[test]
    fn renders_remaining_content_and_card() {
        let parsed = parse(
            "Chest pain, diaphoretic.\n{\"triage_level\": \"EMERGENCY\", \"clinical_rationale\": \"Possible ACS\", \"recommended_actions\": [\"ECG within 10 minutes\"]}",
        );
        assert_eq!(
            parsed.render(),
            "Chest pain, diaphoretic.\n\nTriage level: EMERGENCY\nRationale: Possible ACS\nRecommended actions:\n- ECG within 10 minutes"
        );
        assert_eq!(parse("").render(), "No assessment was returned.");
    }
}
