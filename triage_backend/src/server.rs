use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use crate::agent::conversation::Message;
use crate::agent::events::{AgentEvent, RunOutcome, Termination};
use crate::agent::prompt::{compose_user_message, Vitals};
use crate::agent::Orchestrator;
use crate::context::AttachedContext;
use crate::runtime::BackendRuntime;

pub const DEFAULT_BIND: &str = "127.0.0.1:8787";
pub const DONE_EVENT: &str = "done";

#[derive(Clone)]
pub struct ServerState {
    pub orchestrator: Orchestrator,
    pub auth: BackendAuthConfig,
}

/// Who may call the `/v1` routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

impl BackendAuthConfig {
    pub fn required(token: impl Into<String>) -> Self {
        Self {
            mode: AuthMode::Required,
            token: Some(token.into()),
        }
    }

    pub fn disabled() -> Self {
        Self {
            mode: AuthMode::Disabled,
            token: None,
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve `TRIAGE_BACKEND_AUTH_MODE` and `TRIAGE_BACKEND_TOKEN` through
    /// `lookup`. Required mode without a usable token is a startup error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        match AuthMode::from_setting(lookup("TRIAGE_BACKEND_AUTH_MODE").as_deref())? {
            AuthMode::Disabled => {
                tracing::warn!("Backend auth mode is disabled; all API routes are unauthenticated");
                Ok(Self::disabled())
            }
            AuthMode::Required => lookup("TRIAGE_BACKEND_TOKEN")
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty())
                .map(Self::required)
                .ok_or_else(|| {
                    anyhow!("TRIAGE_BACKEND_TOKEN must be set unless TRIAGE_BACKEND_AUTH_MODE=disabled")
                }),
        }
    }

    /// Whether a request carrying `headers` may proceed.
    fn permits(&self, headers: &HeaderMap) -> bool {
        let expected = match (self.mode, self.token.as_deref()) {
            (AuthMode::Disabled, _) => return true,
            (AuthMode::Required, None) => return false,
            (AuthMode::Required, Some(token)) => token,
        };
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().strip_prefix("Bearer "))
            .is_some_and(|presented| presented.trim() == expected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

impl AuthMode {
    /// Unset means required.
    fn from_setting(raw: Option<&str>) -> Result<Self> {
        let setting = raw.map(str::trim).unwrap_or_default();
        if setting.is_empty() || setting.eq_ignore_ascii_case("required") {
            Ok(Self::Required)
        } else if setting.eq_ignore_ascii_case("disabled") {
            Ok(Self::Disabled)
        } else {
            Err(anyhow!(
                "Unknown TRIAGE_BACKEND_AUTH_MODE {:?} (use 'required' or 'disabled')",
                setting
            ))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEventEnvelope {
    pub event_type: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// One consultation as submitted over HTTP or as the first WebSocket frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriageRequest {
    pub input: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vitals: Option<Vitals>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageResponse {
    pub events: Vec<ApiEventEnvelope>,
    pub termination: Termination,
    pub model_calls: usize,
    pub conversation: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub async fn serve_backend(runtime: BackendRuntime) -> Result<()> {
    let bind_addr = std::env::var("TRIAGE_BACKEND_BIND")
        .unwrap_or_else(|_| DEFAULT_BIND.to_string())
        .parse::<SocketAddr>()
        .context("Invalid TRIAGE_BACKEND_BIND (expected host:port)")?;

    let auth = BackendAuthConfig::from_env()?;
    let state = Arc::new(ServerState {
        orchestrator: runtime.orchestrator.clone(),
        auth,
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Triage backend listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Backend server failed")?;
    Ok(())
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/triage", post(run_triage))
        .route("/ws/triage", get(ws_triage_route))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(state, auth_middleware));

    Router::new().nest("/v1", protected)
}

pub fn map_agent_event(event: AgentEvent) -> ApiEventEnvelope {
    envelope(
        event.kind.as_str(),
        serde_json::json!({ "message": event.message }),
    )
}

fn done_envelope(outcome: &RunOutcome) -> ApiEventEnvelope {
    envelope(
        DONE_EVENT,
        serde_json::json!({
            "termination": outcome.termination,
            "model_calls": outcome.model_calls,
            "tool_calls": outcome.tool_calls.len(),
            "conversation": outcome.conversation,
        }),
    )
}

fn envelope(event_type: &str, payload: serde_json::Value) -> ApiEventEnvelope {
    ApiEventEnvelope {
        event_type: event_type.to_string(),
        emitted_at: Utc::now(),
        payload,
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if !state.auth.permits(request.headers()) {
        tracing::debug!(
            "Rejected {} {}: missing or wrong bearer token",
            request.method(),
            request.uri().path()
        );
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(request).await)
}

/// Decode attachments and compose the user turn.
fn prepare(request: TriageRequest) -> Result<(String, AttachedContext, Vec<Message>), String> {
    let context = AttachedContext::from_base64(
        request.audio_base64.as_deref(),
        request.image_base64.as_deref(),
    )
    .map_err(|error| format!("{:#}", error))?;

    let input = compose_user_message(&request.input, request.vitals.as_ref());
    if input.is_empty() && context == AttachedContext::default() {
        return Err("input cannot be empty without an attachment".to_string());
    }
    Ok((input, context, request.history))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn run_triage(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<TriageRequest>,
) -> Result<Json<TriageResponse>, (StatusCode, String)> {
    let (input, context, history) = prepare(body).map_err(bad_request)?;
    let (events, outcome) = state
        .orchestrator
        .run_to_completion(input, context, history)
        .await;

    Ok(Json(TriageResponse {
        events: events.into_iter().map(map_agent_event).collect(),
        termination: outcome.termination,
        model_calls: outcome.model_calls,
        conversation: outcome.conversation.into_messages(),
    }))
}

async fn ws_triage_route(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_triage_socket(state, socket))
}

async fn send_envelope(socket: &mut WebSocket, envelope: &ApiEventEnvelope) -> bool {
    let payload = match serde_json::to_string(envelope) {
        Ok(serialized) => serialized,
        Err(error) => {
            tracing::warn!("Failed to serialize websocket event: {}", error);
            return true;
        }
    };
    socket.send(WsMessage::Text(payload)).await.is_ok()
}

async fn handle_triage_socket(state: Arc<ServerState>, mut socket: WebSocket) {
    let request = loop {
        match socket.next().await {
            Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<TriageRequest>(&text) {
                Ok(request) => break request,
                Err(error) => {
                    let invalid = envelope(
                        "error",
                        serde_json::json!({ "message": format!("invalid triage request: {}", error) }),
                    );
                    let _ = send_envelope(&mut socket, &invalid).await;
                    return;
                }
            },
            Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return,
            _ => {}
        }
    };

    let (input, context, history) = match prepare(request) {
        Ok(prepared) => prepared,
        Err(message) => {
            let _ = send_envelope(
                &mut socket,
                &envelope("error", serde_json::json!({ "message": message })),
            )
            .await;
            return;
        }
    };

    let run = state.orchestrator.run(input, context, history);
    loop {
        tokio::select! {
            event = run.next_event() => {
                match event {
                    Some(event) => {
                        if !send_envelope(&mut socket, &map_agent_event(event)).await {
                            tracing::info!("Triage socket closed mid-run; cancelling");
                            let _ = run.finish().await;
                            return;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => {
                        tracing::info!("Triage socket closed by client; cancelling");
                        let _ = run.finish().await;
                        return;
                    }
                    _ => {}
                }
            }
        }
    }

    let outcome = run.finish().await;
    let _ = send_envelope(&mut socket, &done_envelope(&outcome)).await;
    let _ = socket.close().await;
}

fn bad_request(message: String) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, message)
}
