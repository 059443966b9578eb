use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::agent::conversation::{LlmToolCall, Message};
use crate::config::TriageConfig;
use crate::http_client::build_http_client_with_timeout;
use crate::model::{ModelCaller, ModelError, ModelReply};
use crate::tools::ToolDef;

/// OpenAI-compatible chat completions client.
#[derive(Clone, Debug)]
pub struct LlmClient {
    api_url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [ToolDef],
}

fn no_tools(tools: &&[ToolDef]) -> bool {
    tools.is_empty()
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<LlmToolCall>>,
}

impl LlmClient {
    pub fn new(
        api_url: String,
        api_key: Option<String>,
        model: String,
        max_tokens: u32,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            model,
            max_tokens,
            client: build_http_client_with_timeout(Some(timeout))?,
        })
    }

    pub fn from_config(config: &TriageConfig) -> anyhow::Result<Self> {
        Self::new(
            config.llm_api_url.clone(),
            config.llm_api_key.clone(),
            config.llm_model.clone(),
            config.max_tokens,
            Duration::from_secs(config.llm_timeout_secs.max(1)),
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

fn classify_transport(error: reqwest::Error) -> ModelError {
    if error.is_timeout() || error.is_connect() {
        ModelError::Unavailable(error.to_string())
    } else {
        ModelError::Transport(error.to_string())
    }
}

#[async_trait]
impl ModelCaller for LlmClient {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDef],
        temperature: f32,
    ) -> Result<ModelReply, ModelError> {
        let url = format!("{}/chat/completions", self.api_url);
        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature,
            max_tokens: self.max_tokens,
            tools,
        };

        let mut req = self.client.post(&url).json(&request);

        // Add API key header if provided (not needed for local models)
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        tracing::debug!(
            "Calling {} with {} message(s) and {} tool(s)",
            self.model,
            messages.len(),
            tools.len()
        );
        let response = req.send().await.map_err(classify_transport)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            return Err(ModelError::from_status(status, body));
        }

        let body = response.text().await.map_err(classify_transport)?;
        let completion: ChatCompletionResponse = serde_json::from_str(&body)
            .map_err(|e| ModelError::Malformed(format!("invalid completion JSON: {}", e)))?;

        let message = completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| ModelError::Malformed("no choices in completion".to_string()))?;

        Ok(ModelReply::from_parts(
            message.content,
            message.tool_calls.unwrap_or_default(),
        ))
    }
}
