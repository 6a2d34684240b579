//! Gateway configuration: the on-disk config file, CLI flags, and the
//! environment-variable overrides.
//!
//! Precedence: env overrides config-file values; config overrides
//! built-in defaults.

use std::{collections::HashMap, path::PathBuf};

use clap::Parser;
use gateway_mcp::config::{ResolvedServerConfig, ServerConfig};
use serde::{Deserialize, Serialize};

fn default_cooldown_minutes() -> u64 {
    5
}

fn default_retry_on() -> Vec<u16> {
    vec![429, 500]
}

/// One configured virtual model: an ordered provider chain, a cooldown
/// duration, and the set of HTTP statuses that trigger advancing to the
/// next candidate.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VirtualModelConfig {
    pub name: String,
    pub chain: Vec<String>,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: u64,
    #[serde(default = "default_retry_on")]
    pub retry_on: Vec<u16>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmGatewayFileConfig {
    pub url: String,
    #[serde(default)]
    pub fallbacks: Vec<serde_json::Value>,
    #[serde(default)]
    pub virtual_models: Vec<VirtualModelConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    pub llm_gateway: Option<LlmGatewayFileConfig>,
}

/// CLI flags, each backed by the matching `MCP_INJECTOR_*` environment
/// variable.
#[derive(Debug, Parser)]
#[command(name = "mcp-injector")]
pub struct Cli {
    #[arg(long, env = "MCP_INJECTOR_PORT", default_value_t = 8080)]
    pub port: u16,

    #[arg(long, env = "MCP_INJECTOR_HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, env = "MCP_INJECTOR_LLM_URL")]
    pub llm_url: Option<String>,

    #[arg(long, env = "MCP_INJECTOR_MCP_CONFIG")]
    pub mcp_config: Option<PathBuf>,

    #[arg(long, env = "MCP_INJECTOR_MAX_ITERATIONS", default_value_t = 10)]
    pub max_iterations: u32,

    #[arg(long, env = "MCP_INJECTOR_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "MCP_INJECTOR_TIMEOUT_MS", default_value_t = 60_000)]
    pub timeout_ms: u64,
}

/// Fully resolved, immutable startup configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub upstream_base_url: String,
    pub fallbacks: Vec<String>,
    pub virtual_models: HashMap<String, VirtualModelConfig>,
    pub max_iterations: u32,
    pub upstream_timeout_ms: u64,
    pub mcp_servers: Vec<ResolvedServerConfig>,
}

impl AppConfig {
    pub fn load(cli: Cli) -> anyhow::Result<Self> {
        let file = match &cli.mcp_config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| anyhow::anyhow!("reading config file {path:?}: {e}"))?;
                serde_yaml::from_str::<FileConfig>(&raw)
                    .map_err(|e| anyhow::anyhow!("parsing config file {path:?}: {e}"))?
            }
            None => FileConfig::default(),
        };

        let llm = file.llm_gateway.clone();
        let upstream_base_url = cli
            .llm_url
            .clone()
            .or_else(|| llm.as_ref().map(|l| l.url.clone()))
            .ok_or_else(|| anyhow::anyhow!("no upstream URL: set MCP_INJECTOR_LLM_URL or llm_gateway.url"))?;

        let fallbacks = llm
            .as_ref()
            .map(|l| l.fallbacks.iter().map(encode_fallback).collect())
            .unwrap_or_default();

        let virtual_models = llm
            .map(|l| {
                l.virtual_models
                    .into_iter()
                    .map(|v| (v.name.clone(), v))
                    .collect()
            })
            .unwrap_or_default();

        let mcp_servers = file
            .servers
            .iter()
            .map(ServerConfig::resolve)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            host: cli.host,
            port: cli.port,
            upstream_base_url,
            fallbacks,
            virtual_models,
            max_iterations: cli.max_iterations,
            upstream_timeout_ms: cli.timeout_ms,
            mcp_servers,
        })
    }
}

/// `"provider/model"` strings pass through; `{provider, model}` objects
/// are encoded to the same form.
fn encode_fallback(value: &serde_json::Value) -> String {
    if let Some(s) = value.as_str() {
        return s.to_string();
    }
    let provider = value.get("provider").and_then(|v| v.as_str()).unwrap_or("");
    let model = value.get("model").and_then(|v| v.as_str()).unwrap_or("");
    format!("{provider}/{model}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_fallback_passes_through_strings() {
        assert_eq!(encode_fallback(&serde_json::json!("a/b")), "a/b");
    }

    #[test]
    fn encode_fallback_joins_object_form() {
        let v = serde_json::json!({"provider": "openai", "model": "gpt-4o"});
        assert_eq!(encode_fallback(&v), "openai/gpt-4o");
    }
}
