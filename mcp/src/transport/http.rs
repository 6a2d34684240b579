//! HTTP Streamable MCP transport.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Client, StatusCode,
};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{initialize_params, ToolSchema, Transport, PROTOCOL_VERSION};
use crate::error::{McpError, McpResult};

const SESSION_HEADER: &str = "mcp-session-id";

#[derive(Debug, Clone)]
struct SessionState {
    session_id: String,
}

pub struct HttpTransport {
    endpoint: String,
    client: Client,
    extra_headers: HashMap<String, String>,
    session: RwLock<Option<SessionState>>,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(endpoint: String, extra_headers: HashMap<String, String>) -> Self {
        Self {
            endpoint,
            client: Client::new(),
            extra_headers,
            session: RwLock::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    fn base_headers(&self, session_id: Option<&str>) -> McpResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert(
            "accept",
            HeaderValue::from_static("application/json, text/event-stream"),
        );
        headers.insert(
            "mcp-protocol-version",
            HeaderValue::from_static(PROTOCOL_VERSION),
        );
        if let Some(id) = session_id {
            headers.insert(
                SESSION_HEADER,
                HeaderValue::from_str(id).map_err(|e| McpError::Transport(e.to_string()))?,
            );
        }
        for (k, v) in &self.extra_headers {
            let name = HeaderName::try_from(k.as_str())
                .map_err(|e| McpError::Transport(e.to_string()))?;
            let value = HeaderValue::from_str(v).map_err(|e| McpError::Transport(e.to_string()))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    async fn initialize(&self) -> McpResult<()> {
        let headers = self.base_headers(None)?;
        let body = json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": "initialize",
            "params": initialize_params(),
        });
        let resp = self
            .client
            .post(&self.endpoint)
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(McpError::Http)?;

        if !resp.status().is_success() {
            return Err(McpError::ConnectionFailed(format!(
                "initialize failed with status {}",
                resp.status()
            )));
        }

        // Header names are matched case-insensitively by `HeaderMap`.
        let session_id = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                McpError::ConnectionFailed("initialize response missing session id header".into())
            })?;

        *self.session.write().await = Some(SessionState {
            session_id: session_id.clone(),
        });

        // Post-hoc notification; no id, no response body expected.
        let notify_headers = self.base_headers(Some(&session_id))?;
        let notify_body = json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized",
        });
        let _ = self
            .client
            .post(&self.endpoint)
            .headers(notify_headers)
            .json(&notify_body)
            .send()
            .await;

        Ok(())
    }

    async fn ensure_session(&self) -> McpResult<String> {
        if let Some(s) = self.session.read().await.as_ref() {
            return Ok(s.session_id.clone());
        }
        self.initialize().await?;
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.session_id.clone())
            .ok_or_else(|| McpError::ConnectionFailed("session not established".into()))
    }

    async fn rpc(&self, method: &str, params: Value) -> McpResult<Value> {
        let session_id = self.ensure_session().await?;
        match self.send_rpc(method, params.clone(), &session_id).await {
            Ok(v) => Ok(v),
            Err(RpcRetry::SessionExpired) => {
                // Discard and retry once from a fresh `initialize`.
                *self.session.write().await = None;
                let fresh = self.ensure_session().await?;
                self.send_rpc(method, params, &fresh)
                    .await
                    .map_err(|e| e.into_error())
            }
            Err(e) => Err(e.into_error()),
        }
    }

    async fn send_rpc(&self, method: &str, params: Value, session_id: &str) -> Result<Value, RpcRetry> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let headers = self
            .base_headers(Some(session_id))
            .map_err(RpcRetry::Other)?;
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let resp = self
            .client
            .post(&self.endpoint)
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcRetry::Other(McpError::Http(e)))?;

        let status = resp.status();
        if matches!(
            status,
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND
        ) {
            return Err(RpcRetry::SessionExpired);
        }
        if !status.is_success() {
            return Err(RpcRetry::Other(McpError::Transport(format!(
                "MCP server returned status {status}"
            ))));
        }

        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let text = resp.text().await.map_err(|e| RpcRetry::Other(McpError::Http(e)))?;

        let value = if content_type.contains("text/event-stream") {
            scan_sse_for_id(&text, id).ok_or_else(|| {
                RpcRetry::Other(McpError::Transport(
                    "no matching SSE event for request id".into(),
                ))
            })?
        } else {
            serde_json::from_str(&text)
                .map_err(|e| RpcRetry::Other(McpError::Transport(format!("malformed body: {e}"))))?
        };

        if let Some(error) = value.get("error") {
            return Err(RpcRetry::Other(McpError::Transport(error.to_string())));
        }

        Ok(value.get("result").cloned().unwrap_or(Value::Null))
    }
}

enum RpcRetry {
    SessionExpired,
    Other(McpError),
}

impl RpcRetry {
    fn into_error(self) -> McpError {
        match self {
            RpcRetry::SessionExpired => McpError::Transport("session expired".into()),
            RpcRetry::Other(e) => e,
        }
    }
}

/// Scan an SSE body for `data: <json>` lines and return the first whose
/// `id` matches. Lines without an `id` are notifications and are ignored.
fn scan_sse_for_id(body: &str, id: u64) -> Option<Value> {
    for line in body.lines() {
        let Some(payload) = line.strip_prefix("data:") else {
            continue;
        };
        let payload = payload.trim();
        let Ok(value) = serde_json::from_str::<Value>(payload) else {
            continue;
        };
        if value.get("id").and_then(Value::as_u64) == Some(id) {
            return Some(value);
        }
    }
    None
}

#[async_trait]
impl Transport for HttpTransport {
    async fn list_tools(&self) -> McpResult<Vec<ToolSchema>> {
        let result = self.rpc("tools/list", json!({})).await?;
        let tools = result
            .get("tools")
            .cloned()
            .unwrap_or(Value::Array(vec![]));
        serde_json::from_value(tools)
            .map_err(|e| McpError::Transport(format!("malformed tools/list result: {e}")))
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<Value> {
        debug!(tool = name, "calling MCP tool over HTTP");
        self.rpc("tools/call", json!({ "name": name, "arguments": arguments }))
            .await
            .inspect_err(|e| warn!(tool = name, error = %e, "MCP tool call failed"))
    }
}
