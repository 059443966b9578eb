//! The model backend seam.
//!
//! The agent loop only sees [`ModelCaller`]; the reply shape is decided once
//! here, so the loop never inspects raw JSON.

use async_trait::async_trait;
use thiserror::Error;

use crate::agent::conversation::{LlmToolCall, Message};
use crate::tools::ToolDef;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelReply {
    Text(String),
    ToolCalls {
        content: Option<String>,
        calls: Vec<LlmToolCall>,
    },
}

impl ModelReply {
    /// An empty call list is a text reply.
    pub fn from_parts(content: Option<String>, calls: Vec<LlmToolCall>) -> Self {
        if calls.is_empty() {
            Self::Text(content.unwrap_or_default())
        } else {
            Self::ToolCalls { content, calls }
        }
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    /// Unreachable, timed out, or a gateway status. Usually a cold start.
    #[error("model service unavailable: {0}")]
    Unavailable(String),
    #[error("model service returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("malformed model response: {0}")]
    Malformed(String),
    #[error("model request failed: {0}")]
    Transport(String),
    #[error("model caller failed: {0}")]
    Internal(String),
}

impl ModelError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Gateway statuses an inference endpoint returns while it scales up.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            502..=504 => Self::Unavailable(format!("HTTP {}: {}", status, body)),
            _ => Self::Http { status, body },
        }
    }

    /// Text for the `error` event shown to the clinician.
    pub fn user_message(&self) -> String {
        match self {
            Self::Unavailable(detail) => format!(
                "The model service is unavailable or still warming up. Please retry in a minute. ({})",
                detail
            ),
            other => format!("The assessment failed: {}", other),
        }
    }
}

#[async_trait]
pub trait ModelCaller: Send + Sync {
    /// One inference call. `tools` may be empty, in which case no registry
    /// is offered.
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDef],
        temperature: f32,
    ) -> Result<ModelReply, ModelError>;
}
