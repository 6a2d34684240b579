//! OpenAI-compatible chat-completions gateway: MCP tool fan-out, an agent
//! loop enforcing discover-before-call, and virtual-model provider
//! failover with cooldown.

pub mod agent;
pub mod config;
pub mod directory;
pub mod error;
pub mod handler;
pub mod router;
pub mod state;
pub mod stats;
pub mod upstream;
