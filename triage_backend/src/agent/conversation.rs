//! Messages in the OpenAI chat shape and the append-only conversation.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use crate::context::encode_base64;
use crate::tools::ToolArguments;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Text segments only; image parts are skipped.
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// A message in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<LlmToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn text_message(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(MessageContent::Text(text.into())),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::text_message(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text_message(Role::User, text)
    }

    /// User turn with the image inlined as a JPEG data URI.
    pub fn user_with_image(text: impl Into<String>, image: &[u8]) -> Self {
        Self {
            role: Role::User,
            content: Some(MessageContent::Parts(vec![
                ContentPart::Text { text: text.into() },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: format!("data:image/jpeg;base64,{}", encode_base64(image)),
                    },
                },
            ])),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text_message(Role::Assistant, text)
    }

    pub fn assistant_tool_calls(content: Option<String>, calls: Vec<LlmToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content
                .filter(|text| !text.trim().is_empty())
                .map(MessageContent::Text),
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(MessageContent::Text(output.into())),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }

    pub fn text(&self) -> String {
        self.content
            .as_ref()
            .map(MessageContent::text)
            .unwrap_or_default()
    }
}

/// Tool call as returned by the LLM (OpenAI format)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_call_type")]
    pub call_type: String,
    pub function: LlmFunctionCall,
}

fn default_call_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmFunctionCall {
    pub name: String,
    /// JSON-encoded arguments. Some servers send an object; it is re-encoded.
    #[serde(default, deserialize_with = "arguments_as_string")]
    pub arguments: String,
}

fn arguments_as_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => String::new(),
        Value::String(raw) => raw,
        other => other.to_string(),
    })
}

impl LlmToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: &ToolArguments) -> Self {
        Self {
            id: id.into(),
            call_type: default_call_type(),
            function: LlmFunctionCall {
                name: name.into(),
                arguments: Value::Object(arguments.clone()).to_string(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }

    /// Decode the argument string. Blank means no arguments.
    pub fn parsed_arguments(&self) -> Result<ToolArguments> {
        let raw = self.function.arguments.trim();
        if raw.is_empty() {
            return Ok(ToolArguments::new());
        }
        match serde_json::from_str::<Value>(raw)
            .with_context(|| format!("Invalid JSON arguments for {}", self.function.name))?
        {
            Value::Object(map) => Ok(map),
            Value::Null => Ok(ToolArguments::new()),
            other => anyhow::bail!(
                "Arguments for {} must be a JSON object, got {}",
                self.function.name,
                other
            ),
        }
    }
}

/// Append-only message list owned by one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system_prompt)],
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.extend(messages);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Ids of tool results that no earlier assistant message requested.
    pub fn orphaned_tool_results(&self) -> Vec<String> {
        let mut requested = HashSet::new();
        let mut orphans = Vec::new();
        for message in &self.messages {
            if let Some(calls) = &message.tool_calls {
                requested.extend(calls.iter().map(|call| call.id.as_str()));
            }
            if message.role == Role::Tool {
                let id = message.tool_call_id.as_deref().unwrap_or_default();
                if !requested.contains(id) {
                    orphans.push(id.to_string());
                }
            }
        }
        orphans
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_serialization() {
        let json = serde_json::to_value(Message::user("Hello")).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "Hello");
        assert!(json.get("tool_calls").is_none());
        assert!(json.get("tool_call_id").is_none());
    }

    #[test]
    fn test_tool_call_message_serialization() {
        let args = json!({ "query": "sepsis" }).as_object().cloned().unwrap();
        let msg = Message::assistant_tool_calls(
            Some("  ".to_string()),
            vec![LlmToolCall::new("call_123", "search_pubmed", &args)],
        );

        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("content").is_none());
        assert_eq!(json["tool_calls"][0]["type"], "function");
        assert_eq!(json["tool_calls"][0]["function"]["name"], "search_pubmed");
        assert_eq!(
            json["tool_calls"][0]["function"]["arguments"],
            r#"{"query":"sepsis"}"#
        );
    }

    #[test]
    fn test_tool_result_message_serialization() {
        let json = serde_json::to_value(Message::tool_result("call_123", "ok")).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["tool_call_id"], "call_123");
    }

    #[test]
    fn inline_image_serializes_as_parts() {
        let msg = Message::user_with_image("see film", b"hello world");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["content"][0], json!({ "type": "text", "text": "see film" }));
        assert_eq!(json["content"][1]["type"], "image_url");
        assert_eq!(
            json["content"][1]["image_url"]["url"],
            "data:image/jpeg;base64,aGVsbG8gd29ybGQ="
        );
        assert_eq!(msg.text(), "see film");
    }

    #[test]
    fn history_round_trips_through_json() {
        let raw = json!([
            { "role": "system", "content": "old instructions" },
            { "role": "user", "content": [{ "type": "text", "text": "hi" }] },
            { "role": "assistant", "content": null, "tool_calls": [
                { "id": "c1", "type": "function", "function": { "name": "triage_patient", "arguments": { "spo2": 91 } } }
            ] },
            { "role": "tool", "tool_call_id": "c1", "content": "score 5" }
        ]);
        let messages: Vec<Message> = serde_json::from_value(raw).unwrap();
        assert_eq!(messages[1].text(), "hi");
        assert!(messages[2].content.is_none());
        let call = &messages[2].tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.parsed_arguments().unwrap()["spo2"], 91);
    }

    #[test]
    fn parsed_arguments_handles_blank_and_rejects_non_objects() {
        let mut call = LlmToolCall::new("c", "transcribe_medical_audio", &ToolArguments::new());
        call.function.arguments = "".to_string();
        assert!(call.parsed_arguments().unwrap().is_empty());
        call.function.arguments = "[1,2]".to_string();
        assert!(call.parsed_arguments().is_err());
        call.function.arguments = "{not json".to_string();
        assert!(call.parsed_arguments().is_err());
    }

    #[test]
    fn detects_orphaned_tool_results() {
        let mut conversation = Conversation::new("sys");
        conversation.push(Message::assistant_tool_calls(
            None,
            vec![LlmToolCall::new("a", "triage_patient", &ToolArguments::new())],
        ));
        conversation.push(Message::tool_result("a", "fine"));
        assert!(conversation.orphaned_tool_results().is_empty());

        conversation.push(Message::tool_result("ghost", "?"));
        assert_eq!(conversation.orphaned_tool_results(), vec!["ghost".to_string()]);
    }
}
