//! MCP server configuration: transports, env-refs, allow-lists.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A config scalar that is either a literal string or a reference to an
/// environment variable, resolved at load time.
///
/// An original Clojure-style map `{ :env NAME :prefix s :suffix s }` becomes
/// `{ env: NAME, prefix: s, suffix: s }` here — this crate's config format
/// is YAML/JSON rather than EDN.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Literal(String),
    EnvRef {
        env: String,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default)]
        suffix: Option<String>,
    },
}

impl ConfigValue {
    /// Resolve to a concrete string, or `None` if an env-ref names an unset
    /// variable.
    pub fn resolve(&self) -> Option<String> {
        match self {
            ConfigValue::Literal(s) => Some(s.clone()),
            ConfigValue::EnvRef { env, prefix, suffix } => {
                let value = std::env::var(env).ok()?;
                Some(format!(
                    "{}{}{}",
                    prefix.as_deref().unwrap_or(""),
                    value,
                    suffix.as_deref().unwrap_or("")
                ))
            }
        }
    }
}

/// The transport discriminant for one configured server: a URL endpoint
/// (HTTP Streamable MCP) or a subprocess command (stdio MCP). Mutually
/// exclusive.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TransportSpec {
    Http { url: ConfigValue },
    Stdio { cmd: ConfigValue },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub id: String,
    #[serde(flatten)]
    pub transport: TransportSpec,
    #[serde(default)]
    pub env: HashMap<String, ConfigValue>,
    #[serde(default)]
    pub cwd: Option<ConfigValue>,
    #[serde(default)]
    pub headers: HashMap<String, ConfigValue>,
    /// `None` (absent or explicit `null`) = all tools. `Some(vec![])` = no
    /// tools. `Some(names)` = allow-list, matched case-insensitively.
    #[serde(default)]
    pub tools: Option<Vec<String>>,
}

/// A `ServerConfig` with every `ConfigValue` resolved against the current
/// environment. Built once at startup; immutable afterwards.
#[derive(Debug, Clone)]
pub struct ResolvedServerConfig {
    pub id: String,
    pub transport: ResolvedTransport,
    pub tools: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub enum ResolvedTransport {
    Http {
        url: String,
        headers: HashMap<String, String>,
    },
    Stdio {
        cmd: String,
        env: HashMap<String, String>,
        cwd: Option<String>,
    },
}

impl ServerConfig {
    pub fn resolve(&self) -> Result<ResolvedServerConfig, crate::error::McpError> {
        let transport = match &self.transport {
            TransportSpec::Http { url } => ResolvedTransport::Http {
                url: url
                    .resolve()
                    .ok_or_else(|| config_err(&self.id, "url"))?,
                headers: resolve_map(&self.headers),
            },
            TransportSpec::Stdio { cmd } => ResolvedTransport::Stdio {
                cmd: cmd
                    .resolve()
                    .ok_or_else(|| config_err(&self.id, "cmd"))?,
                env: resolve_map(&self.env),
                cwd: self.cwd.as_ref().and_then(ConfigValue::resolve),
            },
        };
        Ok(ResolvedServerConfig {
            id: self.id.clone(),
            transport,
            tools: self.tools.clone(),
        })
    }
}

fn resolve_map(map: &HashMap<String, ConfigValue>) -> HashMap<String, String> {
    map.iter()
        .filter_map(|(k, v)| v.resolve().map(|rv| (k.clone(), rv)))
        .collect()
}

fn config_err(server: &str, field: &str) -> crate::error::McpError {
    crate::error::McpError::Config(format!(
        "server '{server}': could not resolve required field '{field}' (env var unset?)"
    ))
}

/// Whether `tool_name` passes `allow_list` (case-insensitive match).
/// `None` means "allow everything"; `Some(&[])` means "allow nothing".
pub fn allowed(allow_list: Option<&[String]>, tool_name: &str) -> bool {
    match allow_list {
        None => true,
        Some(list) => list.iter().any(|n| n.eq_ignore_ascii_case(tool_name)),
    }
}
