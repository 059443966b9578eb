use anyhow::{Context, Result};
use flume::Sender;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header as ws_header;
use tokio_tungstenite::tungstenite::http::HeaderValue as WsHeaderValue;
use tokio_tungstenite::tungstenite::Message;

use triage_backend::server::{ApiEventEnvelope, TriageRequest, DONE_EVENT};

pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8787";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEvent {
    Status(String),
    ToolCall(String),
    ToolResult(String),
    Assessment(String),
    Error(String),
    Finished(RunSummary),
}

/// Tail of a consultation as reported by the backend's `done` frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RunSummary {
    pub termination: String,
    #[serde(default)]
    pub model_calls: usize,
    #[serde(default)]
    pub tool_calls: usize,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    ws_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn from_env() -> Self {
        let base =
            std::env::var("TRIAGE_BACKEND_URL").unwrap_or_else(|_| DEFAULT_BACKEND_URL.to_string());
        let token = std::env::var("TRIAGE_BACKEND_TOKEN")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        Self::new(base, token)
    }

    pub fn new(base_url: String, token: Option<String>) -> Self {
        let normalized_base = normalize_base_url(&base_url);
        let ws_url = normalize_ws_url(&normalized_base);

        Self {
            http: reqwest::Client::new(),
            base_url: normalized_base,
            ws_url,
            token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    pub async fn health(&self) -> Result<bool> {
        let url = format!("{}/v1/health", self.base_url);
        let mut builder = self.http.get(url);
        if let Some(token) = self.token.as_deref() {
            builder = builder.bearer_auth(token);
        }
        let response = builder
            .send()
            .await
            .context("GET /v1/health failed")?
            .error_for_status()
            .context("Backend health check rejected")?
            .json::<HealthResponse>()
            .await
            .context("Failed to decode health response")?;
        Ok(response.status == "ok")
    }

    /// Submit one consultation over the triage socket and forward every event
    /// to `tx` until the backend sends its `done` frame or closes.
    pub async fn stream_triage(&self, request: &TriageRequest, tx: &Sender<ConsoleEvent>) -> Result<()> {
        let ws_endpoint = format!("{}/v1/ws/triage", self.ws_url);
        let mut ws_request = ws_endpoint
            .into_client_request()
            .context("Invalid websocket endpoint URL")?;

        if let Some(token) = self.token.as_deref() {
            let value = WsHeaderValue::from_str(&format!("Bearer {}", token))
                .context("Invalid bearer token for websocket auth")?;
            ws_request
                .headers_mut()
                .insert(ws_header::AUTHORIZATION, value);
        }

        let (stream, _) = connect_async(ws_request)
            .await
            .context("Failed to connect triage websocket")?;
        let (mut write, mut read) = stream.split();

        let body = serde_json::to_string(request).context("Failed to encode triage request")?;
        write
            .send(Message::Text(body))
            .await
            .context("Failed to send triage request")?;

        while let Some(message) = read.next().await {
            let text = match message.context("Websocket read error")? {
                Message::Text(text) => text,
                Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(_) => continue,
                },
                Message::Close(_) => return Ok(()),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };

            if let Some(event) = parse_event_envelope(&text)? {
                let finished = matches!(event, ConsoleEvent::Finished(_));
                if tx.send_async(event).await.is_err() || finished {
                    return Ok(());
                }
            }
        }

        Ok(())
    }
}

fn parse_event_envelope(text: &str) -> Result<Option<ConsoleEvent>> {
    let envelope: ApiEventEnvelope =
        serde_json::from_str(text).context("Failed to decode websocket event envelope")?;
    Ok(map_event(envelope))
}

fn map_event(envelope: ApiEventEnvelope) -> Option<ConsoleEvent> {
    let message = || {
        envelope
            .payload
            .get("message")
            .map(json_value_to_short_string)
            .unwrap_or_default()
    };

    match envelope.event_type.as_str() {
        "status" => Some(ConsoleEvent::Status(message())),
        "tool" => Some(ConsoleEvent::ToolCall(message())),
        "tool_result" => Some(ConsoleEvent::ToolResult(message())),
        "content" => Some(ConsoleEvent::Assessment(message())),
        "error" => Some(ConsoleEvent::Error(
            Some(message())
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "Unknown backend error".to_string()),
        )),
        DONE_EVENT => match serde_json::from_value::<RunSummary>(envelope.payload.clone()) {
            Ok(summary) => Some(ConsoleEvent::Finished(summary)),
            Err(error) => {
                tracing::warn!("Malformed done frame: {}", error);
                None
            }
        },
        other => {
            tracing::debug!("Ignoring unknown event type {}", other);
            None
        }
    }
}

fn json_value_to_short_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        DEFAULT_BACKEND_URL.to_string()
    } else {
        trimmed.to_string()
    }
}

fn normalize_ws_url(base_http_url: &str) -> String {
    if let Some(rest) = base_http_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_http_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        format!("ws://{}", base_http_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use triage_backend::agent::conversation::{LlmToolCall, Message as ChatMessage};
    use triage_backend::agent::{LoopSettings, Orchestrator};
    use triage_backend::model::{ModelCaller, ModelError, ModelReply};
    use triage_backend::server::{build_router, BackendAuthConfig, ServerState};
    use triage_backend::tools::{ToolArguments, ToolDef, ToolInvoker};

    struct ScriptedModel {
        replies: Mutex<VecDeque<ModelReply>>,
    }

    #[async_trait]
    impl ModelCaller for ScriptedModel {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolDef],
            _temperature: f32,
        ) -> Result<ModelReply, ModelError> {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| ModelError::Malformed("script exhausted".to_string()))
        }
    }

    struct ScoreTool;

    #[async_trait]
    impl ToolInvoker for ScoreTool {
        async fn invoke(&self, _tool_name: &str, _arguments: &ToolArguments) -> String {
            "NEWS2 score 7".to_string()
        }
    }

    async fn spawn_backend(replies: Vec<ModelReply>) -> String {
        let model = ScriptedModel {
            replies: Mutex::new(replies.into()),
        };
        let state = Arc::new(ServerState {
            orchestrator: Orchestrator::new(
                Arc::new(model),
                Arc::new(ScoreTool),
                LoopSettings::default(),
            ),
            auth: BackendAuthConfig::required("ward-7"),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(state)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn consultation() -> TriageRequest {
        TriageRequest {
            input: "palpitations, HR 140".to_string(),
            ..TriageRequest::default()
        }
    }

    #[tokio::test]
    async fn stream_triage_forwards_events_until_done() {
        let base = spawn_backend(vec![
            ModelReply::ToolCalls {
                content: None,
                calls: vec![LlmToolCall::new("c1", "triage_patient", &ToolArguments::new())],
            },
            ModelReply::Text(
                r#"{"triage_level": "URGENT", "clinical_rationale": "Tachycardic", "recommended_actions": []}"#
                    .to_string(),
            ),
        ])
        .await;
        let client = ApiClient::new(base, Some("ward-7".to_string()));
        assert!(client.health().await.unwrap());

        let (tx, rx) = flume::unbounded();
        client.stream_triage(&consultation(), &tx).await.unwrap();
        let events: Vec<ConsoleEvent> = rx.drain().collect();

        assert_eq!(events.len(), 6);
        assert!(matches!(events[0], ConsoleEvent::Status(_)));
        assert_eq!(events[1], ConsoleEvent::ToolCall("triage_patient".to_string()));
        assert_eq!(events[2], ConsoleEvent::ToolResult("NEWS2 score 7".to_string()));
        assert!(matches!(events[3], ConsoleEvent::Status(_)));
        assert!(matches!(&events[4], ConsoleEvent::Assessment(text) if text.contains("Triage level: URGENT")));
        assert_eq!(
            events[5],
            ConsoleEvent::Finished(RunSummary {
                termination: "completed".to_string(),
                model_calls: 2,
                tool_calls: 1,
            })
        );
    }

    #[tokio::test]
    async fn stream_triage_surfaces_model_failure() {
        let base = spawn_backend(Vec::new()).await;
        let client = ApiClient::new(base, Some("ward-7".to_string()));

        let (tx, rx) = flume::unbounded();
        client.stream_triage(&consultation(), &tx).await.unwrap();
        let events: Vec<ConsoleEvent> = rx.drain().collect();

        assert!(events.iter().any(|e| matches!(e, ConsoleEvent::Error(_))));
        assert!(matches!(
            events.last(),
            Some(ConsoleEvent::Finished(summary)) if summary.termination == "failed"
        ));
    }

    #[tokio::test]
    async fn stream_triage_rejects_wrong_token() {
        let base = spawn_backend(Vec::new()).await;
        let client = ApiClient::new(base, Some("ward-8".to_string()));
        let (tx, rx) = flume::unbounded();
        assert!(client.stream_triage(&consultation(), &tx).await.is_err());
        assert!(rx.is_empty());
        assert!(client.health().await.is_err());
    }

    #[test]
    fn normalizes_base_url() {
        assert_eq!(normalize_base_url("http://x:1/"), "http://x:1");
        assert_eq!(normalize_base_url("   "), DEFAULT_BACKEND_URL);
    }

    #[test]
    fn maps_http_to_ws_url() {
        assert_eq!(normalize_ws_url("http://127.0.0.1:8787"), "ws://127.0.0.1:8787");
        assert_eq!(normalize_ws_url("https://triage.example"), "wss://triage.example");
    }

    #[test]
    fn parses_tool_result_event() {
        let raw = r#"{"event_type":"tool_result","emitted_at":"2026-01-01T00:00:00Z","payload":{"message":"NEWS2 score 7"}}"#;
        assert_eq!(
            parse_event_envelope(raw).unwrap(),
            Some(ConsoleEvent::ToolResult("NEWS2 score 7".to_string()))
        );
    }

    #[test]
    fn parses_done_frame_into_summary() {
        let raw = r#"{"event_type":"done","emitted_at":"2026-01-01T00:00:00Z","payload":{"termination":"turn_budget_exhausted","model_calls":5,"tool_calls":4,"conversation":[]}}"#;
        assert_eq!(
            parse_event_envelope(raw).unwrap(),
            Some(ConsoleEvent::Finished(RunSummary {
                termination: "turn_budget_exhausted".to_string(),
                model_calls: 5,
                tool_calls: 4,
            }))
        );
    }

    #[test]
    fn error_without_message_gets_placeholder() {
        let raw = r#"{"event_type":"error","emitted_at":"2026-01-01T00:00:00Z","payload":{}}"#;
        assert_eq!(
            parse_event_envelope(raw).unwrap(),
            Some(ConsoleEvent::Error("Unknown backend error".to_string()))
        );
    }

    #[test]
    fn unknown_event_types_are_skipped() {
        let raw = r#"{"event_type":"heartbeat","emitted_at":"2026-01-01T00:00:00Z","payload":{}}"#;
        assert!(parse_event_envelope(raw).unwrap().is_none());
    }
}
