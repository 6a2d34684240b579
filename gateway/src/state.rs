//! Shared application state handed to every axum handler.

use std::sync::{atomic::AtomicBool, Arc};

use gateway_mcp::ToolRegistry;

use crate::{config::AppConfig, router::VirtualModelRouter, stats::StatsRegistry, upstream::UpstreamClient};

pub struct AppState {
    pub config: AppConfig,
    pub registry: ToolRegistry,
    pub stats: Arc<StatsRegistry>,
    pub router: VirtualModelRouter,
    pub upstream: UpstreamClient,
    /// Flipped to `false` once the startup warm-up task finishes probing
    /// every configured server at least once.
    pub warming_up: AtomicBool,
}

impl AppState {
    pub fn new(config: AppConfig) -> Arc<Self> {
        let stats = Arc::new(StatsRegistry::new());
        let upstream = UpstreamClient::new(
            config.upstream_base_url.clone(),
            config.upstream_timeout_ms,
            stats.clone(),
        );
        let registry = ToolRegistry::new(config.mcp_servers.clone());
        Arc::new(Self {
            config,
            registry,
            stats,
            router: VirtualModelRouter::new(),
            upstream,
            warming_up: AtomicBool::new(true),
        })
    }
}
