//! `McpLoader` — connects to configured MCP servers and keeps one session
//! per server alive across hot-reloads, lazy first-use, and post-failure
//! cooldowns.
//!
//! State machine per server: `Disabled -> Connecting -> Ready -> Closed`;
//! a failed `Connecting` goes to `Failed` and sits out a 300s cooldown
//! before the next attempt is allowed.
//!
//! Each server's live session is owned by a single dedicated worker task
//! (spawned on connect) that serializes every call through an mpsc command
//! channel. This is the Rust-native answer to "pin the session to the
//! run-context that created it": regardless of which caller or executor
//! thread issues a call, it is always served by the one task that owns the
//! session, so there is never more than one in-flight request per server
//! and no session object crosses task boundaries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{McpError, Result};
use crate::session::McpSession;
use crate::transport::{HttpTransport, McpTransport, SseTransport, StdioTransport, StreamableHttpTransport};
use crate::types::{sanitized_tool_name, McpServerConfig, ToolDefinition, Transport};

/// Post-failure wait before a server is eligible for another connect attempt.
pub const COOLDOWN: Duration = Duration::from_secs(300);

/// One MCP tool ready to be wrapped as a registry entry: which server it
/// came from, the sanitized name to register it under, and its definition.
#[derive(Debug, Clone)]
pub struct McpToolHandle {
    pub server_id: String,
    pub registry_name: String,
    pub def: ToolDefinition,
}

#[derive(Debug, Clone)]
pub enum ServerState {
    Disabled,
    Connecting,
    Ready,
    Failed { since: Instant, error: String },
    Closed,
}

impl ServerState {
    pub fn label(&self) -> &'static str {
        match self {
            ServerState::Disabled => "disabled",
            ServerState::Connecting => "connecting",
            ServerState::Ready => "ready",
            ServerState::Failed { .. } => "failed",
            ServerState::Closed => "closed",
        }
    }
}

enum WorkerCommand {
    ListTools(oneshot::Sender<Result<Vec<ToolDefinition>>>),
    CallTool(String, serde_json::Value, oneshot::Sender<Result<serde_json::Value>>),
    Ping(oneshot::Sender<bool>),
    Shutdown,
}

/// One connected server: its worker's command channel plus bookkeeping the
/// loader needs without reaching into the worker task.
struct ServerHandle {
    config: McpServerConfig,
    cmd_tx: mpsc::Sender<WorkerCommand>,
    worker: tokio::task::JoinHandle<()>,
    tool_names: Vec<String>,
    connected_at: Instant,
    /// Generation the loader was at when this server connected — used for
    /// loop-affinity detection (see module docs and `reload`).
    generation: u64,
}

/// Single server worker loop: owns the `McpSession` for its whole lifetime
/// and executes commands one at a time off the channel.
async fn run_worker(session: McpSession, mut rx: mpsc::Receiver<WorkerCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WorkerCommand::ListTools(reply) => {
                let _ = reply.send(session.list_tools().await);
            }
            WorkerCommand::CallTool(name, args, reply) => {
                let _ = reply.send(session.call_tool(&name, args).await);
            }
            WorkerCommand::Ping(reply) => {
                let ok = session.list_tools().await.is_ok();
                let _ = reply.send(ok);
            }
            WorkerCommand::Shutdown => break,
        }
    }
    if let Err(e) = session.close().await {
        log_close_error(&e);
    }
}

/// Downgrade "cancelled in a different task" close errors to debug per §9;
/// anything else is a real warning.
fn log_close_error(e: &McpError) {
    let msg = e.to_string();
    if msg.to_lowercase().contains("cancel") {
        debug!(error = %msg, "MCP transport close raced a cancellation, ignoring");
    } else {
        warn!(error = %msg, "MCP transport close failed");
    }
}

/// Connects to configured MCP servers and exposes their tools as
/// `mcp_<server>_<tool>` adapters, managing the per-server connection
/// lifecycle described above.
pub struct McpLoader {
    servers: RwLock<HashMap<String, ServerHandle>>,
    states: RwLock<HashMap<String, ServerState>>,
    configs: RwLock<Vec<McpServerConfig>>,
    /// Serializes connect attempts per server so concurrent lazy callers
    /// don't race each other into spawning two sessions for one id.
    connect_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    /// Bumped by `reload`; compared against a server's `generation` to
    /// decide whether a stale session should be rebuilt before use.
    generation: AtomicU64,
    /// Creation order, oldest first — `close()` tears down in reverse.
    creation_order: Mutex<Vec<String>>,
}

impl Default for McpLoader {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl McpLoader {
    pub fn new(configs: Vec<McpServerConfig>) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            configs: RwLock::new(configs),
            connect_locks: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(1),
            creation_order: Mutex::new(Vec::new()),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    pub async fn state(&self, server_id: &str) -> Option<ServerState> {
        self.states.read().await.get(server_id).cloned()
    }

    pub async fn states(&self) -> Vec<(String, ServerState)> {
        self.states
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    async fn connect_lock_for(&self, server_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.connect_locks.write().await;
        locks
            .entry(server_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Build a non-stdio transport. Stdio is handled separately in
    /// `connect_one` since spawning a child is itself async.
    fn build_transport(config: &McpServerConfig) -> Result<Box<dyn McpTransport>> {
        match config.transport {
            Transport::Stdio => Err(McpError::UnsupportedTransport(
                "stdio transports are constructed via connect_one".into(),
            )),
            Transport::Http => {
                let url = config
                    .url
                    .clone()
                    .ok_or_else(|| McpError::Transport(format!("server '{}' has no url", config.id)))?;
                Ok(Box::new(HttpTransport::new(url)))
            }
            Transport::Sse => {
                let url = config
                    .url
                    .clone()
                    .ok_or_else(|| McpError::Transport(format!("server '{}' has no url", config.id)))?;
                Ok(Box::new(SseTransport::new(url)))
            }
            Transport::StreamableHttp => {
                let url = config
                    .url
                    .clone()
                    .ok_or_else(|| McpError::Transport(format!("server '{}' has no url", config.id)))?;
                Ok(Box::new(StreamableHttpTransport::new(url)))
            }
        }
    }

    /// Establish the session for one server and spin up its worker. Does
    /// not touch `states`/`servers` — callers update those under their own
    /// state-transition logic.
    async fn connect_one(&self, config: &McpServerConfig) -> Result<ServerHandle> {
        let transport: Box<dyn McpTransport> = match config.transport {
            Transport::Stdio => {
                let command = config
                    .command
                    .as_ref()
                    .ok_or_else(|| McpError::Transport(format!("server '{}' has no stdio command", config.id)))?;
                Box::new(StdioTransport::spawn(command, &config.args, &config.env).await?)
            }
            _ => Self::build_transport(config)?,
        };

        let session = McpSession::connect(transport).await?;
        let tools = session.list_tools().await?;
        let tool_names: Vec<String> = tools
            .iter()
            .map(|t| sanitized_tool_name(&config.id, &t.name))
            .collect();

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let worker = tokio::spawn(run_worker(session, cmd_rx));

        Ok(ServerHandle {
            config: config.clone(),
            cmd_tx,
            worker,
            tool_names,
            connected_at: Instant::now(),
            generation: self.generation(),
        })
    }

    /// Connect every enabled, non-lazy server and return the combined tool
    /// definitions (caller registers these into the agent's tool registry).
    /// Servers already `Ready` are left untouched; servers in cooldown are
    /// skipped; failures are recorded per-server and do not abort the rest.
    pub async fn register_tools_async(&self) -> Vec<McpToolHandle> {
        let configs = self.configs.read().await.clone();
        let mut out = Vec::new();

        for config in &configs {
            if !config.enabled {
                self.states
                    .write()
                    .await
                    .insert(config.id.clone(), ServerState::Disabled);
                continue;
            }
            if config.lazy {
                // Lazy adapters connect on first invocation via `connect_lazy`.
                continue;
            }
            if self.is_in_cooldown(&config.id).await {
                continue;
            }
            if matches!(self.state(&config.id).await, Some(ServerState::Ready)) {
                out.extend(self.tool_defs_for(&config.id).await);
                continue;
            }

            match self.try_connect(config).await {
                Ok(tools) => out.extend(tools),
                Err(e) => warn!(server = %config.id, error = %e, "MCP server failed to connect"),
            }
        }

        out
    }

    async fn tool_defs_for(&self, server_id: &str) -> Vec<McpToolHandle> {
        let servers = self.servers.read().await;
        let Some(handle) = servers.get(server_id) else {
            return Vec::new();
        };
        let session_tools = self.list_tools_via(handle).await.unwrap_or_default();
        session_tools
            .into_iter()
            .map(|t| McpToolHandle {
                server_id: server_id.to_string(),
                registry_name: sanitized_tool_name(server_id, &t.name),
                def: t,
            })
            .collect()
    }

    async fn list_tools_via(&self, handle: &ServerHandle) -> Result<Vec<ToolDefinition>> {
        let (tx, rx) = oneshot::channel();
        handle
            .cmd_tx
            .send(WorkerCommand::ListTools(tx))
            .await
            .map_err(|_| McpError::Transport("worker channel closed".into()))?;
        rx.await.map_err(|_| McpError::Transport("worker dropped reply".into()))?
    }

    async fn try_connect(&self, config: &McpServerConfig) -> Result<Vec<McpToolHandle>> {
        self.states
            .write()
            .await
            .insert(config.id.clone(), ServerState::Connecting);

        match self.connect_one(config).await {
            Ok(handle) => {
                let tools = self.session_tool_defs(config, &handle).await;
                self.creation_order.lock().await.push(config.id.clone());
                self.servers.write().await.insert(config.id.clone(), handle);
                self.states
                    .write()
                    .await
                    .insert(config.id.clone(), ServerState::Ready);
                info!(server = %config.id, tools = tools.len(), "MCP server connected");
                Ok(tools)
            }
            Err(e) => {
                self.states.write().await.insert(
                    config.id.clone(),
                    ServerState::Failed {
                        since: Instant::now(),
                        error: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    /// Re-fetch tool defs right after connect, while we still have the raw
    /// handle (before it's moved into `self.servers`).
    async fn session_tool_defs(&self, config: &McpServerConfig, handle: &ServerHandle) -> Vec<McpToolHandle> {
        let (tx, rx) = oneshot::channel();
        if handle.cmd_tx.send(WorkerCommand::ListTools(tx)).await.is_err() {
            return Vec::new();
        }
        match rx.await {
            Ok(Ok(tools)) => tools
                .into_iter()
                .map(|t| McpToolHandle {
                    server_id: config.id.clone(),
                    registry_name: sanitized_tool_name(&config.id, &t.name),
                    def: t,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    async fn is_in_cooldown(&self, server_id: &str) -> bool {
        matches!(
            self.states.read().await.get(server_id),
            Some(ServerState::Failed { since, .. }) if since.elapsed() < COOLDOWN
        )
    }

    /// Connect (or reuse) the session for `server_id`, deferring to the
    /// per-server lock so concurrent first-use callers don't double-connect.
    /// Used by lazy tool adapters on their first invocation.
    pub async fn connect_lazy(&self, server_id: &str, timeout: Duration) -> Result<()> {
        if matches!(self.state(server_id).await, Some(ServerState::Ready)) {
            return Ok(());
        }
        if self.is_in_cooldown(server_id).await {
            let since = match self.states.read().await.get(server_id) {
                Some(ServerState::Failed { since, .. }) => *since,
                _ => Instant::now(),
            };
            return Err(McpError::Cooldown(server_id.to_string(), COOLDOWN - since.elapsed()));
        }

        let lock = self.connect_lock_for(server_id).await;
        let _guard = lock.lock().await;

        // Re-check after acquiring the lock — another caller may have won the race.
        if matches!(self.state(server_id).await, Some(ServerState::Ready)) {
            return Ok(());
        }

        let config = self
            .configs
            .read()
            .await
            .iter()
            .find(|c| c.id == server_id)
            .cloned()
            .ok_or_else(|| McpError::UnknownServer(server_id.to_string()))?;

        tokio::time::timeout(timeout, self.try_connect(&config))
            .await
            .map_err(|_| McpError::Timeout(timeout))??;
        Ok(())
    }

    /// List the (already sanitized) tool names currently exposed by a ready
    /// server — used by the adapter's registry-name lookup.
    pub async fn tool_names(&self, server_id: &str) -> Vec<String> {
        self.servers
            .read()
            .await
            .get(server_id)
            .map(|h| h.tool_names.clone())
            .unwrap_or_default()
    }

    /// Invoke a remote tool on a connected server. Errors are formatted as
    /// `"MCP tool error: ..."` per the registry's string-result contract.
    pub async fn call_tool(&self, server_id: &str, remote_name: &str, args: serde_json::Value) -> std::result::Result<String, String> {
        let handle = {
            let servers = self.servers.read().await;
            servers.get(server_id).map(|h| h.cmd_tx.clone())
        };
        let Some(cmd_tx) = handle else {
            return Err(format!("MCP tool error: server '{server_id}' is not connected"));
        };

        let (tx, rx) = oneshot::channel();
        if cmd_tx
            .send(WorkerCommand::CallTool(remote_name.to_string(), args, tx))
            .await
            .is_err()
        {
            return Err(format!("MCP tool error: server '{server_id}' worker is gone"));
        }

        match rx.await {
            Ok(Ok(value)) => Ok(render_call_result(&value)),
            Ok(Err(e)) => Err(format!("MCP tool error: {e}")),
            Err(_) => Err(format!("MCP tool error: server '{server_id}' dropped the reply")),
        }
    }

    /// Parallel health probe of every currently-ready server.
    pub async fn health_check(&self, timeout: Duration) -> HashMap<String, bool> {
        let entries: Vec<(String, mpsc::Sender<WorkerCommand>)> = {
            let servers = self.servers.read().await;
            servers
                .iter()
                .map(|(id, h)| (id.clone(), h.cmd_tx.clone()))
                .collect()
        };

        let mut results = HashMap::new();
        let futures = entries.into_iter().map(|(id, cmd_tx)| async move {
            let (tx, rx) = oneshot::channel();
            let healthy = if cmd_tx.send(WorkerCommand::Ping(tx)).await.is_err() {
                false
            } else {
                tokio::time::timeout(timeout, rx).await.ok().and_then(|r| r.ok()).unwrap_or(false)
            };
            (id, healthy)
        });
        for (id, healthy) in futures_util::future::join_all(futures).await {
            results.insert(id, healthy);
        }
        results
    }

    /// Unique per-process identifier for "the context that created these
    /// sessions". The agent loop compares this against what it observed
    /// last turn; a mismatch (e.g. after `reload`) means the caller should
    /// call `reload` again before trusting any cached MCP tool names.
    pub fn observed_generation(&self) -> u64 {
        self.generation()
    }

    /// Drop every session and tool, then re-register from the current
    /// config. Idempotent: calling twice in a row with unchanged config
    /// converges to the same set of `Ready` servers and tool names.
    pub async fn reload(&self) -> Vec<McpToolHandle> {
        self.generation.fetch_add(1, Ordering::Relaxed);
        self.close().await;
        self.servers.write().await.clear();
        self.states.write().await.clear();
        self.creation_order.lock().await.clear();
        self.register_tools_async().await
    }

    /// Replace the server configuration list (used when the operator edits
    /// MCP config); does not itself reconnect — call `reload` afterwards.
    pub async fn set_configs(&self, configs: Vec<McpServerConfig>) {
        *self.configs.write().await = configs;
    }

    /// Close every session and transport, in reverse creation order, so
    /// dependents established later tear down first.
    pub async fn close(&self) {
        let order: Vec<String> = {
            let mut guard = self.creation_order.lock().await;
            let order = guard.clone();
            guard.clear();
            order
        };

        let mut servers = self.servers.write().await;
        for id in order.into_iter().rev() {
            if let Some(handle) = servers.remove(&id) {
                let _ = handle.cmd_tx.send(WorkerCommand::Shutdown).await;
                if let Err(e) = handle.worker.await {
                    if !e.is_cancelled() {
                        warn!(server = %id, error = %e, "MCP worker task panicked during close");
                    } else {
                        debug!(server = %id, "MCP worker task was cancelled during close");
                    }
                }
            }
        }
        for (_, state) in self.states.write().await.iter_mut() {
            if matches!(state, ServerState::Ready | ServerState::Connecting) {
                *state = ServerState::Closed;
            }
        }
    }
}

/// Render a `tools/call` JSON result as the single string the tool registry
/// expects: MCP's content-block array becomes its concatenated text parts;
/// anything else is serialized as compact JSON.
fn render_call_result(value: &serde_json::Value) -> String {
    if let Some(blocks) = value.get("content").and_then(|v| v.as_array()) {
        let mut out = String::new();
        for block in blocks {
            if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        if !out.is_empty() {
            return out;
        }
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(id: &str, lazy: bool) -> McpServerConfig {
        McpServerConfig {
            id: id.to_string(),
            name: id.to_string(),
            enabled: true,
            transport: Transport::Http,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: Some("http://127.0.0.1:1/nonexistent".to_string()),
            lazy,
        }
    }

    #[tokio::test]
    async fn disabled_server_is_marked_without_connecting() {
        let mut c = cfg("foo", false);
        c.enabled = false;
        let loader = McpLoader::new(vec![c]);
        let tools = loader.register_tools_async().await;
        assert!(tools.is_empty());
        assert!(matches!(loader.state("foo").await, Some(ServerState::Disabled)));
    }

    #[tokio::test]
    async fn failed_connect_enters_cooldown() {
        let loader = McpLoader::new(vec![cfg("foo", false)]);
        let _ = loader.register_tools_async().await;
        assert!(loader.is_in_cooldown("foo").await);
        // A second pass must not retry while in cooldown.
        let tools = loader.register_tools_async().await;
        assert!(tools.is_empty());
    }

    #[tokio::test]
    async fn lazy_server_is_skipped_by_register_tools_async() {
        let loader = McpLoader::new(vec![cfg("foo", true)]);
        let tools = loader.register_tools_async().await;
        assert!(tools.is_empty());
        assert!(loader.state("foo").await.is_none());
    }

    #[tokio::test]
    async fn unknown_server_lazy_connect_errors() {
        let loader = McpLoader::new(vec![]);
        let err = loader.connect_lazy("nope", Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, McpError::UnknownServer(_)));
    }

    #[tokio::test]
    async fn reload_is_idempotent_when_called_twice() {
        let loader = McpLoader::new(vec![cfg("foo", false)]);
        loader.reload().await;
        let gen_after_first = loader.generation();
        let names_after_first = loader.tool_names("foo").await;
        loader.reload().await;
        let names_after_second = loader.tool_names("foo").await;
        assert_eq!(names_after_first, names_after_second);
        assert!(loader.generation() > gen_after_first);
    }

    #[tokio::test]
    async fn render_call_result_concatenates_text_blocks() {
        let value = serde_json::json!({"content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]});
        assert_eq!(render_call_result(&value), "a\nb");
    }

    #[tokio::test]
    async fn render_call_result_falls_back_to_raw_json() {
        let value = serde_json::json!({"ok": true});
        assert_eq!(render_call_result(&value), "{\"ok\":true}");
    }
}
