//! Progress events and the pull-based handle a caller drains them from.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::task::JoinHandle;

use super::conversation::Conversation;
use crate::response::ParsedModelOutput;
use crate::tools::ToolCallRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Status,
    Tool,
    ToolResult,
    Content,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Tool => "tool",
            Self::ToolResult => "tool_result",
            Self::Content => "content",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub kind: EventKind,
    pub message: String,
}

impl AgentEvent {
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn status(message: impl Into<String>) -> Self {
        Self::new(EventKind::Status, message)
    }

    pub fn tool(message: impl Into<String>) -> Self {
        Self::new(EventKind::Tool, message)
    }

    pub fn tool_result(message: impl Into<String>) -> Self {
        Self::new(EventKind::ToolResult, message)
    }

    pub fn content(message: impl Into<String>) -> Self {
        Self::new(EventKind::Content, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventKind::Error, message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Init,
    AwaitingModel,
    HandlingToolCalls,
    Done,
    Failed,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The model gave a final answer.
    Completed,
    /// The turn budget ran out while the model still wanted tools; its last
    /// response was emitted as the answer.
    TurnBudgetExhausted,
    Failed,
    /// The caller stopped consuming events.
    Cancelled,
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::TurnBudgetExhausted => "turn_budget_exhausted",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub conversation: Conversation,
    pub termination: Termination,
    pub model_calls: usize,
    /// Parsed final answer, present for `Completed` and `TurnBudgetExhausted`.
    pub final_output: Option<ParsedModelOutput>,
    pub tool_calls: Vec<ToolCallRecord>,
}

impl RunOutcome {
    fn lost() -> Self {
        Self {
            conversation: Conversation::default(),
            termination: Termination::Failed,
            model_calls: 0,
            final_output: None,
            tool_calls: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
#[error("event consumer went away")]
pub struct Cancelled;

/// Sending half used by the loop. Each emit parks until the caller takes
/// the event.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: flume::Sender<AgentEvent>,
}

impl EventSink {
    pub(crate) fn new(tx: flume::Sender<AgentEvent>) -> Self {
        Self { tx }
    }

    pub(crate) async fn emit(&self, event: AgentEvent) -> Result<(), Cancelled> {
        self.tx.send_async(event).await.map_err(|_| Cancelled)
    }
}

/// A running consultation.
///
/// Events are produced lazily: the loop only advances past an event once it
/// has been received. Dropping the handle (or calling [`TriageRun::finish`]
/// early) cancels the run at its next emission.
pub struct TriageRun {
    events: flume::Receiver<AgentEvent>,
    task: JoinHandle<RunOutcome>,
}

impl TriageRun {
    pub(crate) fn new(events: flume::Receiver<AgentEvent>, task: JoinHandle<RunOutcome>) -> Self {
        Self { events, task }
    }

    /// Next event, or `None` once the loop has finished.
    pub async fn next_event(&self) -> Option<AgentEvent> {
        self.events.recv_async().await.ok()
    }

    /// Stop consuming and wait for the loop to settle.
    pub async fn finish(self) -> RunOutcome {
        drop(self.events);
        join_outcome(self.task).await
    }

    /// Drain every event, then return them with the outcome.
    pub async fn collect(self) -> (Vec<AgentEvent>, RunOutcome) {
        let mut events = Vec::new();
        while let Ok(event) = self.events.recv_async().await {
            events.push(event);
        }
        (events, join_outcome(self.task).await)
    }
}

pub async fn join_outcome(task: JoinHandle<RunOutcome>) -> RunOutcome {
    match task.await {
        Ok(outcome) => outcome,
        Err(error) => {
            tracing::error!("Triage run task did not complete: {}", error);
            RunOutcome::lost()
        }
    }
}
