//! Tool registry: per-server tool caching, lazy discovery, warm-up, reset.

use std::{collections::HashMap, sync::Arc};

use dashmap::DashMap;
use futures::future::join_all;
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    config::{allowed, ResolvedServerConfig, ResolvedTransport},
    error::{McpError, McpResult},
    transport::{http::HttpTransport, stdio::StdioTransport, ToolSchema, Transport},
};

pub struct ToolRegistry {
    servers: HashMap<String, ResolvedServerConfig>,
    transports: DashMap<String, Arc<dyn Transport>>,
    /// Full (unfiltered) tool list per server, populated on first
    /// successful `tools/list`.
    cache: DashMap<String, Vec<ToolSchema>>,
}

impl ToolRegistry {
    pub fn new(servers: Vec<ResolvedServerConfig>) -> Self {
        Self {
            servers: servers.into_iter().map(|s| (s.id.clone(), s)).collect(),
            transports: DashMap::new(),
            cache: DashMap::new(),
        }
    }

    pub fn server_ids(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    pub fn server_config(&self, server_id: &str) -> Option<&ResolvedServerConfig> {
        self.servers.get(server_id)
    }

    fn transport_for(&self, server_id: &str) -> McpResult<Arc<dyn Transport>> {
        if let Some(existing) = self.transports.get(server_id) {
            return Ok(existing.clone());
        }
        let cfg = self
            .servers
            .get(server_id)
            .ok_or_else(|| McpError::ServerNotFound(server_id.to_string()))?;
        let transport: Arc<dyn Transport> = match &cfg.transport {
            ResolvedTransport::Http { url, headers } => {
                Arc::new(HttpTransport::new(url.clone(), headers.clone()))
            }
            ResolvedTransport::Stdio { cmd, env, cwd } => Arc::new(StdioTransport::new(
                server_id.to_string(),
                cmd.clone(),
                env.clone(),
                cwd.clone(),
            )),
        };
        self.transports
            .insert(server_id.to_string(), transport.clone());
        Ok(transport)
    }

    /// Cached list if present; otherwise calls `tools/list` once and
    /// caches the full (unfiltered) result. On failure the cache is left
    /// absent so the next call retries ("tool discovery
    /// atomicity"). The returned view is filtered by this server's
    /// configured allow-list.
    pub async fn discover_tools(&self, server_id: &str) -> McpResult<Vec<ToolSchema>> {
        let cfg = self
            .servers
            .get(server_id)
            .ok_or_else(|| McpError::ServerNotFound(server_id.to_string()))?;

        if let Some(full) = self.cache.get(server_id) {
            return Ok(filter(full.value(), cfg.tools.as_deref()));
        }

        let transport = self.transport_for(server_id)?;
        let tools = transport.list_tools().await?;
        self.cache.insert(server_id.to_string(), tools.clone());
        Ok(filter(&tools, cfg.tools.as_deref()))
    }

    pub async fn get_schema(&self, server_id: &str, tool_name: &str) -> McpResult<ToolSchema> {
        let tools = self.discover_tools(server_id).await?;
        tools
            .into_iter()
            .find(|t| t.name.eq_ignore_ascii_case(tool_name))
            .ok_or_else(|| McpError::ToolNotFound(format!("{server_id}__{tool_name}")))
    }

    pub async fn call_tool(&self, server_id: &str, tool_name: &str, arguments: Value) -> McpResult<Value> {
        let transport = self.transport_for(server_id)?;
        transport.call_tool(tool_name, arguments).await
    }

    /// Iterates configured servers in parallel, populating the cache.
    /// Failures are logged and leave that server's cache un-populated;
    /// they never abort the whole warm-up.
    pub async fn warm_up(&self) {
        let ids = self.server_ids();
        let futures = ids.into_iter().map(|id| async move {
            match self.discover_tools(&id).await {
                Ok(tools) => info!(server = %id, count = tools.len(), "warmed up MCP server"),
                Err(e) => warn!(server = %id, error = %e, "warm-up discovery failed"),
            }
        });
        join_all(futures).await;
    }

    /// Clears the tool cache and drops all transports (closing stdio
    /// children and discarding HTTP sessions). The next request re-creates
    /// them from scratch.
    pub fn reset(&self) {
        self.cache.clear();
        self.transports.clear();
    }

    /// Which configured servers currently have a live transport, split by
    /// kind, for the `/api/v1/mcp/tools` admin endpoint's session maps.
    pub fn transport_snapshot(&self) -> (HashMap<String, bool>, HashMap<String, bool>) {
        let mut http = HashMap::new();
        let mut stdio = HashMap::new();
        for (id, cfg) in &self.servers {
            let active = self.transports.contains_key(id);
            match &cfg.transport {
                ResolvedTransport::Http { .. } => {
                    http.insert(id.clone(), active);
                }
                ResolvedTransport::Stdio { .. } => {
                    stdio.insert(id.clone(), active);
                }
            }
        }
        (http, stdio)
    }

    /// Snapshot for the `/api/v1/mcp/tools` admin endpoint: server id ->
    /// cached (filtered) tool names.
    pub fn snapshot(&self) -> HashMap<String, Vec<String>> {
        self.servers
            .keys()
            .map(|id| {
                let names = self
                    .cache
                    .get(id)
                    .map(|full| {
                        let cfg = self.servers.get(id);
                        filter(full.value(), cfg.and_then(|c| c.tools.as_deref()))
                            .into_iter()
                            .map(|t| t.name)
                            .collect()
                    })
                    .unwrap_or_default();
                (id.clone(), names)
            })
            .collect()
    }
}

fn filter(tools: &[ToolSchema], allow_list: Option<&[String]>) -> Vec<ToolSchema> {
    tools
        .iter()
        .filter(|t| allowed(allow_list, &t.name))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolvedTransport;

    fn http_server(id: &str, url: &str) -> ResolvedServerConfig {
        ResolvedServerConfig {
            id: id.to_string(),
            transport: ResolvedTransport::Http {
                url: url.to_string(),
                headers: HashMap::new(),
            },
            tools: None,
        }
    }

    #[tokio::test]
    async fn discover_tools_on_unknown_server_errors() {
        let registry = ToolRegistry::new(vec![]);
        let err = registry.discover_tools("nope").await.unwrap_err();
        assert!(matches!(err, McpError::ServerNotFound(_)));
    }

    #[tokio::test]
    async fn reset_clears_cache_and_transports() {
        let registry = ToolRegistry::new(vec![http_server("s", "http://127.0.0.1:1")]);
        registry
            .cache
            .insert("s".to_string(), vec![ToolSchema {
                name: "t".into(),
                description: String::new(),
                input_schema: serde_json::json!({}),
            }]);
        registry.reset();
        assert!(registry.cache.get("s").is_none());
    }
}
