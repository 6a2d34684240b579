//! Subprocess stdio MCP transport.

use std::{
    collections::HashMap,
    process::Stdio,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin},
    sync::{oneshot, Mutex},
};
use tracing::{error, info, warn};

use super::{initialize_params, ToolSchema, Transport};
use crate::error::{McpError, McpResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

struct StdioSession {
    child: Child,
    stdin: ChildStdin,
    next_id: AtomicU64,
    pending: Arc<DashMap<u64, oneshot::Sender<Value>>>,
    alive: Arc<AtomicBool>,
}

impl Drop for StdioSession {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

pub struct StdioTransport {
    server_id: String,
    cmd: String,
    env: HashMap<String, String>,
    cwd: Option<String>,
    session: Mutex<Option<StdioSession>>,
}

impl StdioTransport {
    pub fn new(server_id: String, cmd: String, env: HashMap<String, String>, cwd: Option<String>) -> Self {
        Self {
            server_id,
            cmd,
            env,
            cwd,
            session: Mutex::new(None),
        }
    }

    fn spawn(&self) -> McpResult<Child> {
        let mut parts = self.cmd.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| McpError::Config(format!("server '{}': empty cmd", self.server_id)))?;
        let mut command = tokio::process::Command::new(program);
        command
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .envs(&self.env);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command
            .spawn()
            .map_err(|e| McpError::ConnectionFailed(format!("failed to spawn '{}': {e}", self.cmd)))
    }

    async fn ensure_session(&self) -> McpResult<()> {
        let mut guard = self.session.lock().await;
        let needs_new = match guard.as_ref() {
            Some(s) => !s.alive.load(Ordering::Relaxed),
            None => true,
        };
        if !needs_new {
            return Ok(());
        }

        let mut child = self.spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| {
            McpError::ConnectionFailed("spawned child missing stdin pipe".into())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            McpError::ConnectionFailed("spawned child missing stdout pipe".into())
        })?;

        let pending: Arc<DashMap<u64, oneshot::Sender<Value>>> = Arc::new(DashMap::new());
        let alive = Arc::new(AtomicBool::new(true));

        spawn_reader(self.server_id.clone(), stdout, pending.clone(), alive.clone());

        *guard = Some(StdioSession {
            child,
            stdin,
            next_id: AtomicU64::new(1),
            pending,
            alive,
        });
        drop(guard);

        // Handshake mirrors the HTTP transport: one `initialize` request,
        // then a fire-and-forget `notifications/initialized`. Always
        // re-sent on session (re-)creation, including after a child
        // restart, so a dead server never misses the handshake.
        self.send_request("initialize", initialize_params()).await?;
        self.send_notification("notifications/initialized", json!({}))
            .await?;
        Ok(())
    }

    async fn send_request(&self, method: &str, params: Value) -> McpResult<Value> {
        let (id, rx) = {
            let mut guard = self.session.lock().await;
            let session = guard
                .as_mut()
                .ok_or_else(|| McpError::ConnectionFailed("no stdio session".into()))?;
            let id = session.next_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            session.pending.insert(id, tx);
            let line = serde_json::to_string(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }))
            .map_err(|e| McpError::Transport(e.to_string()))?;
            session
                .stdin
                .write_all(format!("{line}\n").as_bytes())
                .await
                .map_err(McpError::Io)?;
            (id, rx)
        };

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(value)) => {
                if let Some(error) = value.get("error") {
                    return Err(McpError::Transport(error.to_string()));
                }
                Ok(value.get("result").cloned().unwrap_or(Value::Null))
            }
            Ok(Err(_)) => Err(McpError::Transport("Request channel closed".into())),
            Err(_) => {
                if let Some(guard) = self.session.lock().await.as_ref() {
                    guard.pending.remove(&id);
                }
                Err(McpError::Transport("Request timed out".into()))
            }
        }
    }

    async fn send_notification(&self, method: &str, params: Value) -> McpResult<()> {
        let mut guard = self.session.lock().await;
        let session = guard
            .as_mut()
            .ok_or_else(|| McpError::ConnectionFailed("no stdio session".into()))?;
        let line = serde_json::to_string(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        }))
        .map_err(|e| McpError::Transport(e.to_string()))?;
        session
            .stdin
            .write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(McpError::Io)
    }
}

fn spawn_reader(
    server_id: String,
    stdout: tokio::process::ChildStdout,
    pending: Arc<DashMap<u64, oneshot::Sender<Value>>>,
    alive: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let Ok(value) = serde_json::from_str::<Value>(&line) else {
                        warn!(server = %server_id, "stdio MCP server sent malformed line");
                        continue;
                    };
                    let Some(id) = value.get("id").and_then(Value::as_u64) else {
                        // Notification; discard.
                        continue;
                    };
                    if let Some((_, tx)) = pending.remove(&id) {
                        let _ = tx.send(value);
                    }
                }
                Ok(None) => {
                    info!(server = %server_id, "stdio MCP server closed stdout");
                    break;
                }
                Err(e) => {
                    error!(server = %server_id, error = %e, "error reading stdio MCP server output");
                    break;
                }
            }
        }
        alive.store(false, Ordering::Relaxed);
    });
}

#[async_trait]
impl Transport for StdioTransport {
    async fn list_tools(&self) -> McpResult<Vec<ToolSchema>> {
        self.ensure_session().await?;
        let result = self.send_request("tools/list", json!({})).await?;
        let tools = result
            .get("tools")
            .cloned()
            .unwrap_or(Value::Array(vec![]));
        serde_json::from_value(tools)
            .map_err(|e| McpError::Transport(format!("malformed tools/list result: {e}")))
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<Value> {
        self.ensure_session().await?;
        self.send_request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await
    }
}
