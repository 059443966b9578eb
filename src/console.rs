//! Plain-terminal rendering of backend events.

use crate::api::{ConsoleEvent, RunSummary};

const TOOL_RESULT_PREVIEW_CHARS: usize = 400;
const DIM: &str = "\x1b[2m";
const BOLD: &str = "\x1b[1m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Running view of one consultation.
#[derive(Debug, Default)]
pub struct Console {
    color: bool,
    errors: usize,
    summary: Option<RunSummary>,
}

impl Console {
    pub fn new(color: bool) -> Self {
        Self {
            color,
            ..Self::default()
        }
    }

    /// Render `event` and remember anything that affects the exit status.
    pub fn render(&mut self, event: &ConsoleEvent) -> String {
        match event {
            ConsoleEvent::Status(message) => self.paint(DIM, &format!("· {}", message)),
            ConsoleEvent::ToolCall(call) => format!("→ {}", call),
            ConsoleEvent::ToolResult(output) => {
                format!("← {}", truncate(output, TOOL_RESULT_PREVIEW_CHARS))
            }
            ConsoleEvent::Assessment(text) => {
                format!("\n{}\n{}", self.paint(BOLD, "Assessment"), text)
            }
            ConsoleEvent::Error(message) => {
                self.errors += 1;
                self.paint(RED, &format!("error: {}", message))
            }
            ConsoleEvent::Finished(summary) => {
                self.summary = Some(summary.clone());
                self.paint(
                    DIM,
                    &format!(
                        "Finished ({}) after {} model call(s), {} tool call(s)",
                        summary.termination, summary.model_calls, summary.tool_calls
                    ),
                )
            }
        }
    }

    /// Non-zero when the backend reported an error or the run did not finish.
    pub fn exit_code(&self) -> i32 {
        match &self.summary {
            _ if self.errors > 0 => 1,
            Some(summary) if summary.termination == "failed" => 1,
            Some(_) => 0,
            None => 2,
        }
    }

    fn paint(&self, code: &str, text: &str) -> String {
        if self.color {
            format!("{}{}{}", code, text, RESET)
        } else {
            text.to_string()
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}… ({} chars total)", &text[..cut], text.chars().count()),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(termination: &str) -> ConsoleEvent {
        ConsoleEvent::Finished(RunSummary {
            termination: termination.to_string(),
            model_calls: 2,
            tool_calls: 1,
        })
    }

    #[test]
    fn plain_rendering_without_color() {
        let mut console = Console::new(false);
        assert_eq!(
            console.render(&ConsoleEvent::Status("Consulting model (turn 1/5)".into())),
            "· Consulting model (turn 1/5)"
        );
        assert_eq!(
            console.render(&ConsoleEvent::ToolCall("search_pubmed {\"query\":\"sepsis\"}".into())),
            "→ search_pubmed {\"query\":\"sepsis\"}"
        );
        assert_eq!(
            console.render(&summary("completed")),
            "Finished (completed) after 2 model call(s), 1 tool call(s)"
        );
        assert_eq!(console.exit_code(), 0);
    }

    #[test]
    fn long_tool_results_are_truncated_on_char_boundaries() {
        let long = "é".repeat(TOOL_RESULT_PREVIEW_CHARS + 10);
        let mut console = Console::new(false);
        let rendered = console.render(&ConsoleEvent::ToolResult(long));
        assert!(rendered.ends_with(&format!("… ({} chars total)", TOOL_RESULT_PREVIEW_CHARS + 10)));
        assert_eq!(truncate("short", 10), "short");
    }

    #[test]
    fn errors_force_nonzero_exit() {
        let mut console = Console::new(true);
        let rendered = console.render(&ConsoleEvent::Error("model warming up".into()));
        assert!(rendered.starts_with(RED));
        console.render(&summary("failed"));
        assert_eq!(console.exit_code(), 1);
    }

    #[test]
    fn missing_done_frame_is_reported() {
        let mut console = Console::new(false);
        console.render(&ConsoleEvent::Assessment("Triage level: STABLE".into()));
        assert_eq!(console.exit_code(), 2);
    }
}
