//! Tool registry offered to the model and the seam for dispatching calls.
//!
//! The registry is fixed: every tool is executed remotely by the tool
//! server, so the backend only needs each tool's name, description and JSON
//! Schema. Media tools deliberately declare empty parameter schemas; the
//! orchestrator injects the attached payload before dispatch (see [`inject`]).

pub mod inject;
pub mod invoker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::context::{AttachedContext, AttachmentKind};

pub const TRANSCRIBE_AUDIO_TOOL: &str = "transcribe_medical_audio";
pub const ANALYZE_XRAY_TOOL: &str = "analyze_xray_multiscale";
pub const XRAY_METADATA_TOOL: &str = "extract_xray_metadata";
pub const TRIAGE_PATIENT_TOOL: &str = "triage_patient";
pub const SEQUENTIAL_THINKING_TOOL: &str = "sequential_thinking";
pub const LITERATURE_SEARCH_TOOL: &str = "search_pubmed";

pub const REGISTERED_TOOLS: [&str; 6] = [
    TRANSCRIBE_AUDIO_TOOL,
    ANALYZE_XRAY_TOOL,
    XRAY_METADATA_TOOL,
    TRIAGE_PATIENT_TOOL,
    SEQUENTIAL_THINKING_TOOL,
    LITERATURE_SEARCH_TOOL,
];

/// Arguments of a single tool call, as a JSON object.
pub type ToolArguments = serde_json::Map<String, Value>;

pub fn is_registered(tool_name: &str) -> bool {
    REGISTERED_TOOLS.contains(&tool_name)
}

/// The attachment a media tool needs, if any.
pub fn required_attachment(tool_name: &str) -> Option<AttachmentKind> {
    match tool_name {
        TRANSCRIBE_AUDIO_TOOL => Some(AttachmentKind::Audio),
        ANALYZE_XRAY_TOOL | XRAY_METADATA_TOOL => Some(AttachmentKind::Image),
        _ => None,
    }
}

/// OpenAI-format function definition for LLM function-calling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// OpenAI-format tool definition (wraps FunctionDef)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDef,
}

impl ToolDef {
    fn function(name: &str, description: &str, parameters: Value) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionDef {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

fn empty_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

pub fn tool_definition(tool_name: &str) -> Option<ToolDef> {
    let def = match tool_name {
        TRANSCRIBE_AUDIO_TOOL => ToolDef::function(
            TRANSCRIBE_AUDIO_TOOL,
            "Transcribe the voice note attached to this consultation. Takes no arguments; the recording is supplied automatically.",
            empty_schema(),
        ),
        ANALYZE_XRAY_TOOL => ToolDef::function(
            ANALYZE_XRAY_TOOL,
            "Run multi-scale findings analysis on the attached X-ray image. Takes no arguments; the image is supplied automatically.",
            empty_schema(),
        ),
        XRAY_METADATA_TOOL => ToolDef::function(
            XRAY_METADATA_TOOL,
            "Extract acquisition metadata (view, modality, quality) from the attached X-ray image. Takes no arguments.",
            empty_schema(),
        ),
        TRIAGE_PATIENT_TOOL => ToolDef::function(
            TRIAGE_PATIENT_TOOL,
            "Compute an early-warning score and triage band from a set of vital signs.",
            json!({
                "type": "object",
                "properties": {
                    "heart_rate": { "type": "integer", "description": "Heart rate in beats per minute" },
                    "systolic_bp": { "type": "integer", "description": "Systolic blood pressure in mmHg" },
                    "respiratory_rate": { "type": "integer", "description": "Breaths per minute" },
                    "temperature": { "type": "number", "description": "Body temperature in degrees Celsius" },
                    "spo2": { "type": "integer", "description": "Peripheral oxygen saturation in percent" },
                    "consciousness": {
                        "type": "string",
                        "enum": ["A", "V", "P", "U"],
                        "description": "AVPU level of consciousness"
                    },
                    "on_oxygen": { "type": "boolean", "description": "Whether the patient is on supplemental oxygen" }
                },
                "required": [
                    "heart_rate",
                    "systolic_bp",
                    "respiratory_rate",
                    "temperature",
                    "spo2",
                    "consciousness",
                    "on_oxygen"
                ]
            }),
        ),
        SEQUENTIAL_THINKING_TOOL => ToolDef::function(
            SEQUENTIAL_THINKING_TOOL,
            "Record one step of structured reasoning. Set next_thought_needed to false on the final step.",
            json!({
                "type": "object",
                "properties": {
                    "thought": { "type": "string", "description": "The current reasoning step" },
                    "next_thought_needed": { "type": "boolean", "description": "Whether another step follows" }
                },
                "required": ["thought", "next_thought_needed"]
            }),
        ),
        LITERATURE_SEARCH_TOOL => ToolDef::function(
            LITERATURE_SEARCH_TOOL,
            "Search the biomedical literature (PubMed) and return matching abstracts.",
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search query" }
                },
                "required": ["query"]
            }),
        ),
        _ => return None,
    };
    Some(def)
}

/// Every registered tool, in registry order.
pub fn tool_definitions() -> Vec<ToolDef> {
    REGISTERED_TOOLS
        .iter()
        .filter_map(|name| tool_definition(name))
        .collect()
}

/// Registry filtered to what this run can back: media tools are only
/// offered when their attachment is present.
pub fn tool_definitions_for_context(context: &AttachedContext) -> Vec<ToolDef> {
    tool_definitions()
        .into_iter()
        .filter(|def| match required_attachment(def.name()) {
            Some(kind) => context.has(kind),
            None => true,
        })
        .collect()
}

/// Executes one named tool call and reports the outcome as text.
///
/// Implementations must not fail: transport and remote errors are folded
/// into the returned string so the agent loop can feed them back to the
/// model like any other result.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, tool_name: &str, arguments: &ToolArguments) -> String;
}

/// Record of a tool call made during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub tool_name: String,
    /// Arguments as the model declared them, before payload injection.
    pub arguments: ToolArguments,
    pub payload_injected: bool,
    pub output: String,
}
