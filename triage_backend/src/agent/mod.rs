//! Multi-turn tool-calling loop.
//!
//! One run goes `Init -> AwaitingModel -> (HandlingToolCalls <-> AwaitingModel)
//! -> Done | Failed`:
//! 1. Build the conversation (instruction + history + new user turn)
//! 2. Ask the model, offering the tools this run can back
//! 3. Execute requested tools in order, feeding each result back
//! 4. Parse and emit the first answer without tool requests
//!
//! Progress is reported through a [`TriageRun`]; the loop advances only as
//! fast as the caller pulls events.

pub mod conversation;
pub mod events;
pub mod prompt;

use futures_util::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::config::TriageConfig;
use crate::context::AttachedContext;
use crate::model::{ModelCaller, ModelReply};
use crate::response::{extract_directive, ParsedModelOutput, ResponseParser};
use crate::tools::inject::inject_context;
use crate::tools::{
    is_registered, tool_definitions_for_context, ToolArguments, ToolCallRecord, ToolDef,
    ToolInvoker, LITERATURE_SEARCH_TOOL,
};

use conversation::{Conversation, LlmToolCall, Message, Role};
use events::{AgentEvent, Cancelled, EventSink, LoopState, RunOutcome, Termination, TriageRun};

pub const DEFAULT_MAX_TURNS: usize = 5;

/// Per-orchestrator knobs for the loop
#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Maximum model calls per run (at least 1)
    pub max_turns: usize,
    pub temperature: f32,
    /// Base instruction; attachment notes are appended per run
    pub system_prompt: String,
    /// Send the tool registry through the structured channel
    pub supports_tool_calls: bool,
    /// Honour `[SEARCH: ...]` in plain-text replies
    pub directive_fallback: bool,
    /// Also inline the image into the user turn
    pub inline_image: bool,
    pub parser: ResponseParser,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            temperature: 0.2,
            system_prompt: prompt::DEFAULT_SYSTEM_PROMPT.to_string(),
            supports_tool_calls: true,
            directive_fallback: true,
            inline_image: false,
            parser: ResponseParser::default(),
        }
    }
}

impl LoopSettings {
    pub fn from_config(config: &TriageConfig) -> Self {
        Self {
            max_turns: config.max_turns.max(1),
            temperature: config.temperature,
            system_prompt: config.system_prompt.clone(),
            supports_tool_calls: config.supports_tool_calls,
            directive_fallback: config.directive_fallback,
            inline_image: config.inline_image,
            parser: ResponseParser::default(),
        }
    }

    /// The directive channel is always on for backends without tool calls.
    pub fn directive_channel(&self) -> bool {
        self.directive_fallback || !self.supports_tool_calls
    }
}

/// What the model asked for on one turn.
enum TurnRequest {
    Tools(PendingTools),
    Final(String),
}

enum PendingTools {
    Structured {
        content: Option<String>,
        calls: Vec<LlmToolCall>,
    },
    Directive {
        text: String,
        query: String,
    },
}

impl PendingTools {
    /// The response emitted when no turn is left to execute these calls.
    fn raw_text(&self) -> String {
        match self {
            Self::Structured { content, calls } => content
                .as_deref()
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| {
                    let names = calls
                        .iter()
                        .map(LlmToolCall::name)
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("Turn budget exhausted with tool calls still pending: {}", names)
                }),
            Self::Directive { text, .. } => text.clone(),
        }
    }
}

struct RunState {
    conversation: Conversation,
    state: LoopState,
    model_calls: usize,
    tool_calls: Vec<ToolCallRecord>,
    final_output: Option<ParsedModelOutput>,
}

impl RunState {
    fn transition(&mut self, next: LoopState) {
        tracing::debug!("Triage loop {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn into_outcome(self, termination: Termination) -> RunOutcome {
        RunOutcome {
            conversation: self.conversation,
            termination,
            model_calls: self.model_calls,
            final_output: self.final_output,
            tool_calls: self.tool_calls,
        }
    }
}

/// Drives triage runs against a model backend and a tool invoker.
#[derive(Clone)]
pub struct Orchestrator {
    model: Arc<dyn ModelCaller>,
    tools: Arc<dyn ToolInvoker>,
    settings: Arc<LoopSettings>,
}

impl Orchestrator {
    pub fn new(
        model: Arc<dyn ModelCaller>,
        tools: Arc<dyn ToolInvoker>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            model,
            tools,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    /// Start a run on the current tokio runtime.
    pub fn run(
        &self,
        user_input: impl Into<String>,
        context: AttachedContext,
        history: Vec<Message>,
    ) -> TriageRun {
        let (tx, rx) = flume::bounded(0);
        let orchestrator = self.clone();
        let user_input = user_input.into();
        let task = tokio::spawn(async move {
            orchestrator
                .drive(user_input, context, history, EventSink::new(tx))
                .await
        });
        TriageRun::new(rx, task)
    }

    /// Run to the end, collecting every event.
    pub async fn run_to_completion(
        &self,
        user_input: impl Into<String>,
        context: AttachedContext,
        history: Vec<Message>,
    ) -> (Vec<AgentEvent>, RunOutcome) {
        self.run(user_input, context, history).collect().await
    }

    async fn drive(
        &self,
        user_input: String,
        context: AttachedContext,
        history: Vec<Message>,
        sink: EventSink,
    ) -> RunOutcome {
        let mut run = self.init(&user_input, &context, history);
        let tools = if self.settings.supports_tool_calls {
            tool_definitions_for_context(&context)
        } else {
            Vec::new()
        };

        let result = AssertUnwindSafe(self.turns(&mut run, &context, &tools, &sink))
            .catch_unwind()
            .await;

        let termination = match result {
            Ok(Ok(termination)) => termination,
            Ok(Err(Cancelled)) => {
                tracing::info!(
                    "Triage run cancelled by caller after {} model call(s)",
                    run.model_calls
                );
                Termination::Cancelled
            }
            Err(panic) => {
                let detail = panic_message(panic.as_ref());
                tracing::error!("Triage run panicked: {}", detail);
                run.transition(LoopState::Failed);
                let _ = sink
                    .emit(AgentEvent::error(format!(
                        "The assessment failed due to an internal error: {}",
                        detail
                    )))
                    .await;
                Termination::Failed
            }
        };

        tracing::debug!(
            "Triage run finished: {:?} after {} model call(s), {} tool call(s)",
            termination,
            run.model_calls,
            run.tool_calls.len()
        );
        run.into_outcome(termination)
    }

    fn init(&self, user_input: &str, context: &AttachedContext, history: Vec<Message>) -> RunState {
        let system_prompt = prompt::build_system_prompt(
            &self.settings.system_prompt,
            context,
            self.settings.directive_channel(),
        );
        let mut conversation = Conversation::new(system_prompt);

        let before = history.len();
        conversation.extend(history.into_iter().filter(|m| m.role != Role::System));
        let dropped = before + 1 - conversation.len();
        if dropped > 0 {
            tracing::debug!("Dropped {} stale system message(s) from history", dropped);
        }
        for orphan in conversation.orphaned_tool_results() {
            tracing::warn!("History has a tool result with no matching call: {:?}", orphan);
        }

        let user_message = match context.image() {
            Some(image) if self.settings.inline_image => Message::user_with_image(user_input, image),
            _ => Message::user(user_input),
        };
        conversation.push(user_message);

        RunState {
            conversation,
            state: LoopState::Init,
            model_calls: 0,
            tool_calls: Vec::new(),
            final_output: None,
        }
    }

    async fn turns(
        &self,
        run: &mut RunState,
        context: &AttachedContext,
        tools: &[ToolDef],
        sink: &EventSink,
    ) -> Result<Termination, Cancelled> {
        let max_turns = self.settings.max_turns.max(1);

        for turn in 1..=max_turns {
            run.transition(LoopState::AwaitingModel);
            sink.emit(AgentEvent::status(format!(
                "Consulting model (turn {}/{})",
                turn, max_turns
            )))
            .await?;

            run.model_calls += 1;
            let reply = match self
                .model
                .complete(run.conversation.messages(), tools, self.settings.temperature)
                .await
            {
                Ok(reply) => reply,
                Err(error) => {
                    tracing::error!("Model call failed on turn {}: {}", turn, error);
                    run.transition(LoopState::Failed);
                    sink.emit(AgentEvent::error(error.user_message())).await?;
                    return Ok(Termination::Failed);
                }
            };

            let pending = match self.classify(reply) {
                TurnRequest::Final(text) => {
                    return self
                        .finish_with(run, text, Termination::Completed, sink)
                        .await;
                }
                TurnRequest::Tools(pending) => pending,
            };

            if turn == max_turns {
                tracing::warn!(
                    "Turn budget of {} exhausted with tool calls pending; emitting last response",
                    max_turns
                );
                let text = pending.raw_text();
                return self
                    .finish_with(run, text, Termination::TurnBudgetExhausted, sink)
                    .await;
            }

            run.transition(LoopState::HandlingToolCalls);
            match pending {
                PendingTools::Structured { content, calls } => {
                    self.handle_structured(run, content, calls, context, sink)
                        .await?;
                }
                PendingTools::Directive { text, query } => {
                    self.handle_directive(run, text, query, sink).await?;
                }
            }
        }

        // max_turns >= 1 and the last turn always returns above.
        Ok(Termination::TurnBudgetExhausted)
    }

    fn classify(&self, reply: ModelReply) -> TurnRequest {
        match reply {
            ModelReply::ToolCalls { content, calls } => {
                TurnRequest::Tools(PendingTools::Structured { content, calls })
            }
            ModelReply::Text(text) => {
                if self.settings.directive_channel() {
                    if let Some(query) = extract_directive(&text) {
                        return TurnRequest::Tools(PendingTools::Directive { text, query });
                    }
                }
                TurnRequest::Final(text)
            }
        }
    }

    async fn finish_with(
        &self,
        run: &mut RunState,
        text: String,
        termination: Termination,
        sink: &EventSink,
    ) -> Result<Termination, Cancelled> {
        let parsed = self.settings.parser.parse(&text);
        let message = match termination {
            Termination::Completed => parsed.render(),
            _ => text.clone(),
        };
        run.conversation.push(Message::assistant(text));
        run.final_output = Some(parsed);
        run.transition(LoopState::Done);
        sink.emit(AgentEvent::content(message)).await?;
        Ok(termination)
    }

    async fn handle_structured(
        &self,
        run: &mut RunState,
        content: Option<String>,
        calls: Vec<LlmToolCall>,
        context: &AttachedContext,
        sink: &EventSink,
    ) -> Result<(), Cancelled> {
        tracing::debug!("Model requested {} tool call(s)", calls.len());
        run.conversation
            .push(Message::assistant_tool_calls(content, calls.clone()));

        for call in calls {
            let tool_name = call.name().to_string();
            if !is_registered(&tool_name) {
                tracing::warn!("Model requested unregistered tool {:?}; passing through", tool_name);
            }
            let arguments = call.parsed_arguments().unwrap_or_else(|e| {
                tracing::warn!("Failed to parse tool arguments: {:#}", e);
                ToolArguments::new()
            });

            sink.emit(AgentEvent::tool(describe_call(&tool_name, &arguments)))
                .await?;
            let dispatched = inject_context(&tool_name, &arguments, context);
            let output = self.dispatch(&tool_name, &dispatched).await;

            run.conversation
                .push(Message::tool_result(call.id.clone(), output.clone()));
            run.tool_calls.push(ToolCallRecord {
                call_id: call.id,
                tool_name,
                payload_injected: dispatched != arguments,
                arguments,
                output: output.clone(),
            });
            sink.emit(AgentEvent::tool_result(output)).await?;
        }
        Ok(())
    }

    async fn handle_directive(
        &self,
        run: &mut RunState,
        text: String,
        query: String,
        sink: &EventSink,
    ) -> Result<(), Cancelled> {
        let call_id = format!("search_{}", uuid::Uuid::new_v4());
        let mut arguments = ToolArguments::new();
        arguments.insert("query".to_string(), Value::String(query.clone()));

        // Directive-only backends reject tool-role messages.
        run.conversation.push(Message::assistant(text));
        sink.emit(AgentEvent::tool(describe_call(LITERATURE_SEARCH_TOOL, &arguments)))
            .await?;
        let output = self.dispatch(LITERATURE_SEARCH_TOOL, &arguments).await;
        run.conversation.push(Message::user(format!(
            "Search results for '{}':\n{}",
            query, output
        )));
        run.tool_calls.push(ToolCallRecord {
            call_id,
            tool_name: LITERATURE_SEARCH_TOOL.to_string(),
            arguments,
            payload_injected: false,
            output: output.clone(),
        });
        sink.emit(AgentEvent::tool_result(output)).await?;
        Ok(())
    }

    async fn dispatch(&self, tool_name: &str, arguments: &ToolArguments) -> String {
        tracing::info!("Dispatching tool {} ({} argument(s))", tool_name, arguments.len());
        self.tools.invoke(tool_name, arguments).await
    }
}

/// Tool name plus model-declared arguments; injected payloads are not shown.
fn describe_call(tool_name: &str, arguments: &ToolArguments) -> String {
    if arguments.is_empty() {
        tool_name.to_string()
    } else {
        format!("{} {}", tool_name, Value::Object(arguments.clone()))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn settings_follow_config() {
        let config = TriageConfig {
            max_turns: 0,
            supports_tool_calls: false,
            directive_fallback: false,
            ..TriageConfig::default()
        };
        let settings = LoopSettings::from_config(&config);
        assert_eq!(settings.max_turns, 1);
        assert!(settings.directive_channel());
    }

    #[test]
    fn describe_call_omits_empty_arguments() {
        assert_eq!(
            describe_call("transcribe_medical_audio", &ToolArguments::new()),
            "transcribe_medical_audio"
        );
        let args = json!({ "query": "copd" }).as_object().cloned().unwrap();
        assert_eq!(describe_call("search_pubmed", &args), r#"search_pubmed {"query":"copd"}"#);
    }

    #[test]
    fn forced_text_falls_back_to_pending_calls() {
        let pending = PendingTools::Structured {
            content: None,
            calls: vec![
                LlmToolCall::new("a", "triage_patient", &ToolArguments::new()),
                LlmToolCall::new("b", "search_pubmed", &ToolArguments::new()),
            ],
        };
        assert_eq!(
            pending.raw_text(),
            "Turn budget exhausted with tool calls still pending: triage_patient, search_pubmed"
        );
    }

    #[test]
    fn panic_payloads_are_readable() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
    }
}
