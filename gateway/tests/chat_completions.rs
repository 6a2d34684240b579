//! End-to-end coverage of the `/v1/chat/completions` surface against a
//! mocked upstream (and, where relevant, a mocked MCP server): the plain
//! pass-through path, the discover-then-call protocol, the hallucination
//! trap, context-overflow translation, and virtual-model cooldown
//! fallback.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
};

use axum::body::Body;
use http_body_util::BodyExt;
use mcp_injector::{config::AppConfig, handler, state::AppState};
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, Request, Respond, ResponseTemplate,
};

fn base_config(upstream_url: String) -> AppConfig {
    AppConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        upstream_base_url: upstream_url,
        fallbacks: vec![],
        virtual_models: HashMap::new(),
        max_iterations: 10,
        upstream_timeout_ms: 5_000,
        mcp_servers: vec![],
    }
}

async fn post_chat(app: axum::Router, body: Value) -> (axum::http::StatusCode, Value) {
    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

/// A responder that returns one body per call, replaying the last body
/// for any call past the end of the sequence.
struct TurnSequence {
    turn: AtomicUsize,
    statuses: Vec<u16>,
    bodies: Vec<Value>,
}

impl TurnSequence {
    fn ok(bodies: Vec<Value>) -> Self {
        let statuses = vec![200; bodies.len()];
        Self { turn: AtomicUsize::new(0), statuses, bodies }
    }
}

impl Respond for TurnSequence {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let i = self.turn.fetch_add(1, Ordering::SeqCst).min(self.bodies.len() - 1);
        ResponseTemplate::new(self.statuses[i]).set_body_json(self.bodies[i].clone())
    }
}

fn chat_response(content: &str, finish_reason: &str) -> Value {
    json!({
        "id": "chatcmpl-1",
        "model": "upstream-model",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": finish_reason,
        }],
    })
}

fn tool_call_response(id: &str, name: &str, arguments: Value) -> Value {
    json!({
        "id": "chatcmpl-1",
        "model": "upstream-model",
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": id,
                    "type": "function",
                    "function": {"name": name, "arguments": arguments.to_string()},
                }],
            },
            "finish_reason": "tool_calls",
        }],
    })
}

#[tokio::test]
async fn simple_chat_completion_passes_through_without_tools() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(TurnSequence::ok(vec![chat_response("Hello there.", "stop")]))
        .mount(&upstream)
        .await;

    let state = AppState::new(base_config(upstream.uri()));
    let app = handler::app(state);

    let (status, body) = post_chat(
        app,
        json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
        }),
    )
    .await;

    assert_eq!(status, axum::http::StatusCode::OK);
    assert_eq!(body["model"], "gpt-4o");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello there.");
}

#[tokio::test]
async fn discover_then_call_executes_mcp_tool_after_schema_lookup() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(TurnSequence::ok(vec![
            tool_call_response("call_1", "get_tool_schema", json!({"server": "demo", "tool": "do_thing"})),
            tool_call_response("call_2", "mcp__demo__do_thing", json!({})),
            chat_response("All done.", "stop"),
        ]))
        .mount(&upstream)
        .await;

    let mcp_server = MockServer::start().await;
    struct McpResponder;
    impl Respond for McpResponder {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let body: Value = serde_json::from_slice(&request.body).unwrap();
            match body["method"].as_str().unwrap_or("") {
                "initialize" => ResponseTemplate::new(200)
                    .insert_header("mcp-session-id", "sess-1")
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 0, "result": {}})),
                "notifications/initialized" => ResponseTemplate::new(202),
                "tools/list" => ResponseTemplate::new(200).set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": body["id"],
                    "result": {
                        "tools": [{
                            "name": "do_thing",
                            "description": "does a thing",
                            "inputSchema": {"type": "object", "properties": {}},
                        }],
                    },
                })),
                "tools/call" => ResponseTemplate::new(200).set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": body["id"],
                    "result": {"ok": true},
                })),
                other => panic!("unexpected MCP method: {other}"),
            }
        }
    }
    Mock::given(method("POST")).respond_with(McpResponder).mount(&mcp_server).await;

    let mut config = base_config(upstream.uri());
    config.mcp_servers = vec![gateway_mcp::config::ResolvedServerConfig {
        id: "demo".to_string(),
        transport: gateway_mcp::config::ResolvedTransport::Http {
            url: mcp_server.uri(),
            headers: HashMap::new(),
        },
        tools: None,
    }];

    let state = AppState::new(config);
    let app = handler::app(state);

    let (status, body) = post_chat(
        app,
        json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "please use the demo tool"}],
        }),
    )
    .await;

    assert_eq!(status, axum::http::StatusCode::OK);
    assert_eq!(body["choices"][0]["message"]["content"], "All done.");
}

#[tokio::test]
async fn hallucination_trap_rejects_call_without_prior_discovery() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(TurnSequence::ok(vec![
            tool_call_response("call_1", "mcp__demo__do_thing", json!({"x": 1})),
            chat_response("Understood, discovering first.", "stop"),
        ]))
        .mount(&upstream)
        .await;

    let mut config = base_config(upstream.uri());
    config.mcp_servers = vec![gateway_mcp::config::ResolvedServerConfig {
        id: "demo".to_string(),
        transport: gateway_mcp::config::ResolvedTransport::Http {
            url: "http://127.0.0.1:1".to_string(),
            headers: HashMap::new(),
        },
        tools: None,
    }];

    let state = AppState::new(config);
    let app = handler::app(state);

    let (status, body) = post_chat(
        app,
        json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "call the tool directly"}],
        }),
    )
    .await;

    assert_eq!(status, axum::http::StatusCode::OK);
    assert_eq!(body["choices"][0]["message"]["content"], "Understood, discovering first.");
}

#[tokio::test]
async fn upstream_js_style_error_maps_to_context_overflow() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "error": {"message": "Cannot read properties of undefined (reading 'prompt_tokens')"}
        })))
        .mount(&upstream)
        .await;

    let state = AppState::new(base_config(upstream.uri()));
    let app = handler::app(state);

    let (status, body) = post_chat(
        app,
        json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
        }),
    )
    .await;

    assert_eq!(status, axum::http::StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["type"], "context_overflow");
}

#[tokio::test]
async fn virtual_model_falls_back_to_next_provider_after_rate_limit() {
    let upstream = MockServer::start().await;
    struct ModelRouted;
    impl Respond for ModelRouted {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let body: Value = serde_json::from_slice(&request.body).unwrap();
            match body["model"].as_str().unwrap_or("") {
                "provider-a/model" => ResponseTemplate::new(429).set_body_json(json!({
                    "error": {"message": "rate limited"}
                })),
                "provider-b/model" => ResponseTemplate::new(200).set_body_json(chat_response("From B.", "stop")),
                other => panic!("unexpected model: {other}"),
            }
        }
    }
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ModelRouted)
        .mount(&upstream)
        .await;

    let mut config = base_config(upstream.uri());
    config.virtual_models.insert(
        "brain".to_string(),
        mcp_injector::config::VirtualModelConfig {
            name: "brain".to_string(),
            chain: vec!["provider-a/model".to_string(), "provider-b/model".to_string()],
            cooldown_minutes: 5,
            retry_on: vec![429, 500],
        },
    );

    let state = AppState::new(config);
    let app = handler::app(state);

    let (status, body) = post_chat(
        app,
        json!({
            "model": "brain",
            "messages": [{"role": "user", "content": "hi"}],
        }),
    )
    .await;

    assert_eq!(status, axum::http::StatusCode::OK);
    assert_eq!(body["model"], "brain");
    assert_eq!(body["choices"][0]["message"]["content"], "From B.");
    assert_eq!(body["extra_fields"]["provider"], "provider-b/model");
}

#[tokio::test]
async fn streaming_request_emits_sse_chunks_terminated_by_done() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(TurnSequence::ok(vec![chat_response("Streamed reply.", "stop")]))
        .mount(&upstream)
        .await;

    let state = AppState::new(base_config(upstream.uri()));
    let app = handler::app(state);

    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "model": "gpt-4o",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true,
            })
            .to_string(),
        ))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);
    let content_type = response
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert_eq!(content_type, "text/event-stream");

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("\"role\":\"assistant\""));
    assert!(text.contains("Streamed reply."));
    assert!(text.contains("\"finish_reason\":\"stop\""));
    assert!(text.trim_end().ends_with("data: [DONE]"));
}
