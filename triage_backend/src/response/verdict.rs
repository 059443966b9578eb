use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriageLevel {
    Emergency,
    Urgent,
    Stable,
    Unknown,
}

impl TriageLevel {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "EMERGENCY" => Self::Emergency,
            "URGENT" => Self::Urgent,
            "STABLE" => Self::Stable,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Emergency => "EMERGENCY",
            Self::Urgent => "URGENT",
            Self::Stable => "STABLE",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for TriageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const NO_RATIONALE: &str = "No rationale provided.";

/// Typed view over the verdict object a model emits as its final answer.
///
/// Reading never fails: missing or mistyped fields fall back to
/// `UNKNOWN`, a placeholder rationale, and an empty action list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageVerdict {
    pub triage_level: TriageLevel,
    pub clinical_rationale: String,
    pub recommended_actions: Vec<String>,
}

impl TriageVerdict {
    pub fn from_value(value: &Value) -> Self {
        let triage_level = value
            .get("triage_level")
            .and_then(Value::as_str)
            .map(TriageLevel::parse)
            .unwrap_or(TriageLevel::Unknown);
        let clinical_rationale = value
            .get("clinical_rationale")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(NO_RATIONALE)
            .to_string();
        let recommended_actions = value
            .get("recommended_actions")
            .and_then(Value::as_array)
            .map(|actions| {
                actions
                    .iter()
                    .filter_map(|action| match action {
                        Value::String(s) => Some(s.trim().to_string()),
                        Value::Null => None,
                        other => Some(other.to_string()),
                    })
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            triage_level,
            clinical_rationale,
            recommended_actions,
        }
    }
}

impl fmt::Display for TriageVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Triage level: {}", self.triage_level)?;
        write!(f, "\nRationale: {}", self.clinical_rationale)?;
        if !self.recommended_actions.is_empty() {
            f.write_str("\nRecommended actions:")?;
            for action in &self.recommended_actions {
                write!(f, "\n- {}", action)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_complete_verdict() {
        let verdict = TriageVerdict::from_value(&json!({
            "triage_level": "emergency",
            "clinical_rationale": "SpO2 88% on room air",
            "recommended_actions": ["High-flow oxygen", "Call rapid response"]
        }));
        assert_eq!(verdict.triage_level, TriageLevel::Emergency);
        assert_eq!(verdict.clinical_rationale, "SpO2 88% on room air");
        assert_eq!(verdict.recommended_actions.len(), 2);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let verdict = TriageVerdict::from_value(&json!({ "score": 5 }));
        assert_eq!(verdict.triage_level, TriageLevel::Unknown);
        assert_eq!(verdict.clinical_rationale, NO_RATIONALE);
        assert!(verdict.recommended_actions.is_empty());
    }

    #[test]
    fn unrecognised_level_and_mistyped_actions_do_not_raise() {
        let verdict = TriageVerdict::from_value(&json!({
            "triage_level": "Critical-ish",
            "recommended_actions": "monitor"
        }));
        assert_eq!(verdict.triage_level, TriageLevel::Unknown);
        assert!(verdict.recommended_actions.is_empty());
    }

    #[test]
    fn renders_card_with_actions() {
        let verdict = TriageVerdict {
            triage_level: TriageLevel::Urgent,
            clinical_rationale: "Febrile tachycardia".to_string(),
            recommended_actions: vec!["Blood cultures".to_string()],
        };
        assert_eq!(
            verdict.to_string(),
            "Triage level: URGENT\nRationale: Febrile tachycardia\nRecommended actions:\n- Blood cultures"
        );
    }
}
