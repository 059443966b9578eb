//! HTTP client for the remote tool server.
//!
//! Every call is `POST {base}/call_tool` with `{"name", "arguments"}`. The
//! reply is decoded once into [`ToolReply`] and then flattened to the text
//! the model sees.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

use super::{ToolArguments, ToolInvoker};
use crate::config::TriageConfig;
use crate::http_client::build_http_client_with_timeout;

pub const CONNECTION_ERROR_PREFIX: &str = "Connection Error";
pub const TOOL_ERROR_PREFIX: &str = "Tool Error";

pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 60;

/// A tool-server reply, classified once at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolReply {
    /// Concatenated text blocks of a successful call.
    Text(String),
    /// The server flagged the call as failed; carries its report.
    Error(String),
    /// Anything without a content list, stringified.
    Raw(String),
}

impl ToolReply {
    pub fn from_value(value: Value) -> Self {
        let is_error = value
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let text = value
            .get("content")
            .and_then(Value::as_array)
            .map(|blocks| collect_text_blocks(blocks));

        match (is_error, text) {
            (true, Some(text)) if !text.is_empty() => Self::Error(text),
            (true, _) => Self::Error(value.to_string()),
            (false, Some(text)) => Self::Text(text),
            (false, None) => Self::Raw(value.to_string()),
        }
    }

    /// Render the reply as the tool-result text for `tool_name`.
    pub fn into_output(self, tool_name: &str) -> String {
        match self {
            Self::Text(text) | Self::Raw(text) => text,
            Self::Error(report) => format!("{} ({}): {}", TOOL_ERROR_PREFIX, tool_name, report),
        }
    }
}

fn collect_text_blocks(blocks: &[Value]) -> String {
    blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn connection_error(tool_name: &str, error: &anyhow::Error) -> String {
    format!("{} ({}): {:#}", CONNECTION_ERROR_PREFIX, tool_name, error)
}

#[derive(Debug, Serialize)]
struct CallToolRequest<'a> {
    name: &'a str,
    arguments: &'a ToolArguments,
}

/// Tool invoker backed by one pooled `reqwest::Client`.
///
/// Cloning shares the pool, so a single invoker can serve every concurrent
/// run.
#[derive(Clone, Debug)]
pub struct HttpToolInvoker {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpToolInvoker {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = build_http_client_with_timeout(Some(timeout))
            .context("Failed to build tool server client")?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/call_tool", base_url.trim_end_matches('/')),
        }
    }

    pub fn from_config(config: &TriageConfig) -> Result<Self> {
        Self::new(
            &config.tool_server_url,
            Duration::from_secs(config.tool_timeout_secs.max(1)),
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Perform one call. Transport failures and non-2xx statuses are errors;
    /// error-flagged replies are not.
    pub async fn call(&self, tool_name: &str, arguments: &ToolArguments) -> Result<ToolReply> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&CallToolRequest {
                name: tool_name,
                arguments,
            })
            .send()
            .await
            .context("Failed to reach tool server")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Tool server returned error {}: {}", status, body);
        }

        let value: Value = response
            .json()
            .await
            .context("Failed to decode tool server response")?;
        Ok(ToolReply::from_value(value))
    }
}

#[async_trait]
impl ToolInvoker for HttpToolInvoker {
    async fn invoke(&self, tool_name: &str, arguments: &ToolArguments) -> String {
        match self.call(tool_name, arguments).await {
            Ok(reply) => {
                if matches!(reply, ToolReply::Error(_)) {
                    tracing::warn!("Tool {} reported an error", tool_name);
                }
                reply.into_output(tool_name)
            }
            Err(error) => {
                tracing::warn!("Tool {} transport failure: {:#}", tool_name, error);
                connection_error(tool_name, &error)
            }
        }
    }
}
