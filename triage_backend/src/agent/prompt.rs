use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use crate::context::{AttachedContext, AttachmentKind};
use crate::tools::{
    ANALYZE_XRAY_TOOL, TRANSCRIBE_AUDIO_TOOL, TRIAGE_PATIENT_TOOL, XRAY_METADATA_TOOL,
};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an emergency department triage assistant supporting a clinician. \
Review the presentation, use the available tools when they add information, and keep your reasoning inside a <think>...</think> block. \
End your answer with a single JSON object of the form \
{\"triage_level\": \"EMERGENCY\" | \"URGENT\" | \"STABLE\", \"clinical_rationale\": \"...\", \"recommended_actions\": [\"...\"]}. \
You support, and never replace, clinical judgement.";

/// Instruction text for one run: the base prompt plus a line for each
/// attachment-backed tool this run can actually use.
pub fn build_system_prompt(
    base: &str,
    context: &AttachedContext,
    directive_channel: bool,
) -> String {
    let mut prompt = base.trim_end().to_string();
    let mut notes = Vec::new();

    if context.has(AttachmentKind::Audio) {
        notes.push(format!(
            "A voice recording is attached. Call `{}` with no arguments to transcribe it.",
            TRANSCRIBE_AUDIO_TOOL
        ));
    }
    if context.has(AttachmentKind::Image) {
        notes.push(format!(
            "An X-ray image is attached. Call `{}` for findings and `{}` for acquisition details; both take no arguments.",
            ANALYZE_XRAY_TOOL, XRAY_METADATA_TOOL
        ));
    }
    if directive_channel {
        notes.push(
            "To search the medical literature, write `[SEARCH: your query]` on its own line and stop; the results will be sent back to you."
                .to_string(),
        );
    }

    if !notes.is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(&notes.join("\n"));
    }
    prompt
}

/// AVPU level of consciousness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Consciousness {
    #[serde(rename = "A")]
    Alert,
    #[serde(rename = "V")]
    Voice,
    #[serde(rename = "P")]
    Pain,
    #[serde(rename = "U")]
    Unresponsive,
}

impl Consciousness {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "A" | "ALERT" => Some(Self::Alert),
            "V" | "VOICE" => Some(Self::Voice),
            "P" | "PAIN" => Some(Self::Pain),
            "U" | "UNRESPONSIVE" => Some(Self::Unresponsive),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Alert => "A",
            Self::Voice => "V",
            Self::Pain => "P",
            Self::Unresponsive => "U",
        }
    }
}

/// Observations recorded at the bedside; any subset may be present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vitals {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heart_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub systolic_bp: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub respiratory_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spo2: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consciousness: Option<Consciousness>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_oxygen: Option<bool>,
}

impl Vitals {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// One `name=value` pair per recorded observation, in the
    /// `triage_patient` argument names.
    pub fn render(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(hr) = self.heart_rate {
            parts.push(format!("heart_rate={}", hr));
        }
        if let Some(sbp) = self.systolic_bp {
            parts.push(format!("systolic_bp={}", sbp));
        }
        if let Some(rr) = self.respiratory_rate {
            parts.push(format!("respiratory_rate={}", rr));
        }
        if let Some(temp) = self.temperature {
            parts.push(format!("temperature={:.1}", temp));
        }
        if let Some(spo2) = self.spo2 {
            parts.push(format!("spo2={}", spo2));
        }
        if let Some(level) = self.consciousness {
            parts.push(format!("consciousness={}", level.code()));
        }
        if let Some(on_oxygen) = self.on_oxygen {
            parts.push(format!("on_oxygen={}", on_oxygen));
        }
        parts.join(", ")
    }
}

pub fn compose_user_message(input: &str, vitals: Option<&Vitals>) -> String {
    let mut message = input.trim().to_string();
    if let Some(vitals) = vitals.filter(|v| !v.is_empty()) {
        if !message.is_empty() {
            message.push_str("\n\n");
        }
        let _ = write!(
            message,
            "Vitals: {}\n(pass these to `{}` to compute an early-warning score)",
            vitals.render(),
            TRIAGE_PATIENT_TOOL
        );
    }
    message
}
