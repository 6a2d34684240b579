//! Request handler and SSE framing, plus the admin/status endpoints.

use std::sync::{atomic::Ordering, Arc};

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{AppendHeaders, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chat_protocol::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChunkChoice, Delta, Message, ToolDefinition};
use serde_json::json;
use tracing::warn;

use crate::{
    agent::AgentLoop,
    config::VirtualModelConfig,
    directory,
    error::GatewayError,
    state::AppState,
};

/// Builds the full route table, shared by the production binary and the
/// integration tests so both exercise the exact same wiring.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/api/v1/status", get(status))
        .route("/api/v1/mcp/tools", get(mcp_tools))
        .route("/api/v1/mcp/reset", post(mcp_reset))
        .route("/api/v1/llm/state", get(llm_state))
        .route("/api/v1/llm/cooldowns/reset", post(llm_cooldowns_reset))
        .route("/api/v1/stats", get(stats))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn chat_completions(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let mut payload: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(_) => return GatewayError::json_parse_error().into_response(),
    };

    let requested_model = payload.model.clone();
    let stream = payload.stream.unwrap_or(false);
    let caller_tools = payload.tools.take().unwrap_or_default();

    let mut directory_entries = Vec::new();
    for server_id in state.registry.server_ids() {
        match state.registry.discover_tools(&server_id).await {
            Ok(tools) => directory_entries.push((server_id, tools.into_iter().map(|t| t.name).collect())),
            Err(e) => warn!(server = %server_id, error = %e, "per-request tool discovery failed"),
        }
    }
    directory::inject(&mut payload.messages, &directory_entries);

    let result = match state.config.virtual_models.get(&requested_model) {
        Some(vm) => run_virtual_model(&state, vm, payload.messages, caller_tools).await,
        None => run_direct(&state, &requested_model, payload.messages, caller_tools).await,
    };

    match result {
        Ok(response) => package_response(response, &requested_model, stream),
        Err(err) => package_error(&err, stream),
    }
}

async fn run_direct(
    state: &AppState,
    model: &str,
    messages: Vec<Message>,
    caller_tools: Vec<ToolDefinition>,
) -> Result<ChatCompletionResponse, GatewayError> {
    let agent = AgentLoop {
        registry: &state.registry,
        upstream: &state.upstream,
        max_iterations: state.config.max_iterations,
        caller_tools,
        fallbacks: &state.config.fallbacks,
        keep_fallbacks: true,
        model_override: None,
    };
    agent.run(model, messages).await
}

async fn run_virtual_model(
    state: &AppState,
    vm: &VirtualModelConfig,
    messages: Vec<Message>,
    caller_tools: Vec<ToolDefinition>,
) -> Result<ChatCompletionResponse, GatewayError> {
    let (provider, mut response) = state
        .router
        .run(vm, |candidate| {
            let messages = messages.clone();
            let caller_tools = caller_tools.clone();
            async move {
                let agent = AgentLoop {
                    registry: &state.registry,
                    upstream: &state.upstream,
                    max_iterations: state.config.max_iterations,
                    caller_tools,
                    fallbacks: &state.config.fallbacks,
                    keep_fallbacks: false,
                    model_override: Some(candidate.as_str()),
                };
                agent.run(&candidate, messages).await
            }
        })
        .await?;

    response
        .extra_fields
        .get_or_insert_with(chat_protocol::ExtraFields::default)
        .provider = Some(provider);
    Ok(response)
}

/// Sets `model` to the caller's requested name and strips `raw_response`,
/// which must never be echoed back to the caller.
fn sanitize(mut response: ChatCompletionResponse, requested_model: &str) -> ChatCompletionResponse {
    response.model = requested_model.to_string();
    if let Some(extra) = response.extra_fields.as_mut() {
        extra.raw_response = None;
    }
    response
}

fn package_response(response: ChatCompletionResponse, requested_model: &str, stream: bool) -> Response {
    let response = sanitize(response, requested_model);
    if stream {
        sse_response(&response)
    } else {
        (StatusCode::OK, Json(response)).into_response()
    }
}

fn package_error(err: &GatewayError, stream: bool) -> Response {
    if stream {
        sse_error_response(err)
    } else {
        err.clone().into_response()
    }
}

fn sse_headers() -> AppendHeaders<[(header::HeaderName, HeaderValue); 3]> {
    AppendHeaders([
        (header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream")),
        (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        (header::CONNECTION, HeaderValue::from_static("keep-alive")),
    ])
}

fn push_chunk(body: &mut String, chunk: &ChatCompletionChunk) {
    body.push_str("data: ");
    body.push_str(&serde_json::to_string(chunk).unwrap_or_default());
    body.push_str("\n\n");
}

/// Encodes the final (already non-streaming) message as the synthesized
/// `chat.completion.chunk` sequence.
fn sse_response(response: &ChatCompletionResponse) -> Response {
    let id = response.id.clone().unwrap_or_else(|| "chatcmpl-gateway".to_string());
    let created = response.created.unwrap_or(0);
    let model = response.model.clone();
    let message = response.terminal_message();

    let mut body = String::new();

    push_chunk(
        &mut body,
        &chunk(&id, created, &model, Delta { role: Some("assistant".to_string()), ..Default::default() }, None),
    );

    let content = message.map(Message::content_text).unwrap_or_default();
    if !content.is_empty() {
        push_chunk(
            &mut body,
            &chunk(&id, created, &model, Delta { content: Some(content), ..Default::default() }, None),
        );
    }

    let tool_calls = message.and_then(|m| m.tool_calls.clone()).filter(|c| !c.is_empty());
    if let Some(calls) = tool_calls.clone() {
        push_chunk(
            &mut body,
            &chunk(&id, created, &model, Delta { tool_calls: Some(calls), ..Default::default() }, None),
        );
    }

    let finish_reason = response
        .choices
        .first()
        .and_then(|c| c.finish_reason.clone())
        .unwrap_or_else(|| if tool_calls.is_some() { "tool_calls" } else { "stop" }.to_string());

    let mut final_chunk = chunk(&id, created, &model, Delta::default(), Some(finish_reason));
    final_chunk.usage = response.usage.clone();
    push_chunk(&mut body, &final_chunk);

    body.push_str("data: [DONE]\n\n");

    (StatusCode::OK, sse_headers(), body).into_response()
}

fn sse_error_response(err: &GatewayError) -> Response {
    let mut body = String::new();
    body.push_str("data: ");
    body.push_str(&serde_json::to_string(&err.body()).unwrap_or_default());
    body.push_str("\n\ndata: [DONE]\n\n");
    (err.status_code(), sse_headers(), body).into_response()
}

fn chunk(id: &str, created: i64, model: &str, delta: Delta, finish_reason: Option<String>) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: id.to_string(),
        object: "chat.completion.chunk",
        created,
        model: model.to_string(),
        choices: vec![ChunkChoice { index: 0, delta, finish_reason }],
        usage: None,
    }
}

// --- Status and admin endpoints ---

pub async fn health() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({ "stats": state.stats.snapshot() })).into_response()
}

pub async fn status(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "warming-up": state.warming_up.load(Ordering::Relaxed),
    }))
    .into_response()
}

pub async fn mcp_tools(State(state): State<Arc<AppState>>) -> Response {
    let (http_sessions, stdio_sessions) = state.registry.transport_snapshot();
    Json(json!({
        "tools": state.registry.snapshot(),
        "http-sessions": http_sessions,
        "stdio-sessions": stdio_sessions,
    }))
    .into_response()
}

pub async fn mcp_reset(State(state): State<Arc<AppState>>) -> Response {
    state.registry.reset();
    Json(json!({ "status": "ok" })).into_response()
}

pub async fn llm_state(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "cooldowns": state.router.cooldowns.snapshot(),
        "usage": state.stats.snapshot(),
        "warming-up": state.warming_up.load(Ordering::Relaxed),
    }))
    .into_response()
}

pub async fn llm_cooldowns_reset(State(state): State<Arc<AppState>>) -> Response {
    state.router.cooldowns.reset();
    Json(json!({ "status": "ok" })).into_response()
}
