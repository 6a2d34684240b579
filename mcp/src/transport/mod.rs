pub mod http;
pub mod stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::McpResult;

/// A tool's catalog entry: name, human description, JSON-Schema
/// `inputSchema`. Populated on first `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema", alias = "input_schema")]
    pub input_schema: Value,
}

/// Shared interface for the two MCP transport variants: HTTP Streamable
/// and subprocess stdio. Neither variant throws on protocol-level
/// failures (network errors, malformed bodies, timeouts) for `call_tool`
/// — those surface as `McpError` and are converted to tool-result JSON by
/// the caller, matching "local recovery vs surface".
#[async_trait]
pub trait Transport: Send + Sync {
    async fn list_tools(&self) -> McpResult<Vec<ToolSchema>>;
    async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<Value>;
}

pub const PROTOCOL_VERSION: &str = "2025-03-26";

pub fn initialize_params() -> Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": { "name": "mcp-injector", "version": env!("CARGO_PKG_VERSION") },
    })
}
