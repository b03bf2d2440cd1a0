//! Bridges the client-side MCP tool plane (`nanobot-mcp`) into the agent's
//! `Tool` trait and per-turn tool list.
//!
//! [`McpRuntime`] is the piece a host (gateway, discord, a future minimal
//! embed) owns and exposes via `MessageContext::mcp()`. It bundles the
//! loader (connection/state-machine owner) with a [`ToolRegistry`] that
//! mirrors whatever the loader currently has `Ready`, so `build_tools`-style
//! call sites can merge MCP tools in without knowing anything about MCP.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nanobot_core::config::{McpConfig, McpTransportKind};
use nanobot_mcp::{McpLoader, McpServerConfig, McpToolHandle, Transport};
use tracing::warn;

use crate::tool_registry::ToolRegistry;
use crate::tools::{Tool, ToolResult};

/// Default deadline for a lazy server's first connect, triggered by its
/// first tool invocation mid-turn.
const LAZY_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

fn core_config_to_mcp(config: &McpConfig) -> Vec<McpServerConfig> {
    config
        .servers
        .iter()
        .map(|s| McpServerConfig {
            id: s.id.clone(),
            name: s.name.clone().unwrap_or_else(|| s.id.clone()),
            enabled: s.enabled,
            transport: match s.transport {
                McpTransportKind::Stdio => Transport::Stdio,
                McpTransportKind::Http => Transport::Http,
                McpTransportKind::Sse => Transport::Sse,
                McpTransportKind::StreamableHttp => Transport::StreamableHttp,
            },
            command: s.command.clone(),
            args: s.args.clone(),
            env: s.env.clone(),
            url: s.url.clone(),
            lazy: s.lazy,
        })
        .collect()
}

/// Owns the MCP loader plus a registry of its currently-exposed tools.
///
/// One `McpRuntime` is constructed at host startup and lives for the
/// process lifetime; `refresh_registry` is called after
/// `register_tools_async`/`reload` to keep the registry in sync.
pub struct McpRuntime {
    pub loader: Arc<McpLoader>,
    pub registry: Arc<ToolRegistry>,
    /// Loader generation last seen by `refresh_if_stale`.
    last_generation: AtomicU64,
}

impl McpRuntime {
    /// Build the loader from config and connect every non-lazy, enabled
    /// server, registering their tools. Connection failures are logged and
    /// skipped — a misconfigured server never blocks startup.
    pub async fn start(config: &McpConfig) -> Self {
        let loader = Arc::new(McpLoader::new(core_config_to_mcp(config)));
        let registry = Arc::new(ToolRegistry::new());
        let last_generation = AtomicU64::new(loader.generation());
        let runtime = Self { loader, registry, last_generation };
        runtime.register_eager_tools().await;
        runtime
    }

    async fn register_eager_tools(&self) {
        let tools = self.loader.register_tools_async().await;
        for handle in tools {
            self.register_one(handle).await;
        }
    }

    async fn register_one(&self, handle: McpToolHandle) {
        let McpToolHandle { server_id, registry_name, def } = handle;
        let adapter = Arc::new(McpToolAdapter {
            registry_name: registry_name.clone(),
            server_id,
            remote_name: def.name,
            description: def.description,
            input_schema: def.input_schema,
            loader: Arc::clone(&self.loader),
            lazy_timeout: LAZY_CONNECT_TIMEOUT,
        });
        if let Err(e) = self.registry.register(adapter) {
            warn!(tool = %registry_name, error = %e, "failed to register MCP tool");
        }
    }

    /// Drop and re-register every MCP-sourced tool, reconnecting servers per
    /// current config. Called when the operator edits MCP config or when the
    /// agent loop notices its cached tool list is from a stale loader
    /// generation (see `generation()`).
    pub async fn reload(&self, config: &McpConfig) {
        self.loader.set_configs(core_config_to_mcp(config)).await;
        self.registry.unregister_by_prefix("mcp_");
        let tools = self.loader.reload().await;
        for handle in tools {
            self.register_one(handle).await;
        }
    }

    /// Generation counter of the underlying loader, for staleness checks at
    /// the top of a turn (a mismatch means `reload` ran since tools were
    /// last snapshotted and the caller should re-snapshot before building
    /// its tool list).
    pub fn generation(&self) -> u64 {
        self.loader.generation()
    }

    /// Current MCP-sourced tools, ready to splice into a per-turn tool list.
    pub fn snapshot_tools(&self) -> Vec<Arc<dyn Tool>> {
        self.registry.snapshot()
    }

    /// Staleness check run at the top of every turn: if the loader's
    /// generation has moved since this runtime last checked — a `reload`
    /// ran concurrently, e.g. an operator editing MCP config mid-session —
    /// re-sync the registry from the loader's current tool set. Returns
    /// whether a refresh actually happened.
    pub async fn refresh_if_stale(&self) -> bool {
        let current = self.loader.generation();
        let last = self.last_generation.swap(current, Ordering::Relaxed);
        if current == last {
            return false;
        }
        self.registry.unregister_by_prefix("mcp_");
        self.register_eager_tools().await;
        true
    }
}

/// Wraps a shared `Arc<dyn Tool>` so it can sit in a `Vec<Box<dyn Tool>>`
/// alongside `build_tools`'s statically-owned tools.
pub struct SharedTool(pub Arc<dyn Tool>);

#[async_trait]
impl Tool for SharedTool {
    fn name(&self) -> &str {
        self.0.name()
    }
    fn description(&self) -> &str {
        self.0.description()
    }
    fn input_schema(&self) -> serde_json::Value {
        self.0.input_schema()
    }
    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        self.0.execute(input).await
    }
}

/// Adapts one MCP server's tool into the agent's `Tool` trait. `execute`
/// lazily connects the server on first use if it was configured as `lazy`.
pub struct McpToolAdapter {
    registry_name: String,
    server_id: String,
    remote_name: String,
    description: String,
    input_schema: serde_json::Value,
    loader: Arc<McpLoader>,
    lazy_timeout: Duration,
}

#[async_trait]
impl Tool for McpToolAdapter {
    fn name(&self) -> &str {
        &self.registry_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> serde_json::Value {
        self.input_schema.clone()
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        if let Err(e) = self.loader.connect_lazy(&self.server_id, self.lazy_timeout).await {
            return ToolResult::error(format!("MCP tool error: {e}"));
        }

        match self.loader.call_tool(&self.server_id, &self.remote_name, input).await {
            Ok(text) => ToolResult::success(text),
            Err(message) => ToolResult::error(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanobot_core::config::McpServerEntry;

    #[test]
    fn core_config_converts_transport_kinds() {
        let config = McpConfig {
            servers: vec![McpServerEntry {
                id: "github".into(),
                name: None,
                enabled: true,
                transport: McpTransportKind::Http,
                command: None,
                args: Vec::new(),
                env: Default::default(),
                url: Some("https://example.com/mcp".into()),
                lazy: true,
            }],
        };
        let converted = core_config_to_mcp(&config);
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0].id, "github");
        assert_eq!(converted[0].name, "github");
        assert!(matches!(converted[0].transport, Transport::Http));
        assert!(converted[0].lazy);
    }
}
