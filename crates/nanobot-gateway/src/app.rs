use axum::{
    routing::{get, post},
    Router,
};
use dashmap::DashMap;
use nanobot_agent::mcp_adapter::McpRuntime;
use nanobot_agent::runtime::AgentRuntime;
use nanobot_core::config::NanobotConfig;
use nanobot_core::types::ChannelOutbound;
use nanobot_memory::manager::MemoryManager;
use nanobot_scheduler::SchedulerHandle;
use nanobot_sessions::SessionManager;
use nanobot_terminal::manager::TerminalManager;
use nanobot_users::resolver::UserResolver;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ws::broadcast::EventBroadcaster;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: NanobotConfig,
    pub event_seq: AtomicU64,
    #[allow(dead_code)]
    pub presence_version: AtomicU64,
    pub broadcaster: EventBroadcaster,
    pub agent: AgentRuntime,
    pub users: UserResolver,
    pub memory: MemoryManager,
    pub sessions: SessionManager,
    pub scheduler: SchedulerHandle,
    /// Terminal subsystem — tokio::sync::Mutex because create_session, kill,
    /// exec_background, and job_kill are async and must be awaited while the
    /// lock is held.
    pub terminal: tokio::sync::Mutex<TerminalManager>,
    /// Active WS connections: conn_id -> message sender.
    pub ws_clients: DashMap<String, mpsc::Sender<String>>,
    /// Notification queue for HTTP/terminal clients: session_key -> pending messages.
    /// Drained by `GET /notifications`.
    pub notifications: DashMap<String, Vec<String>>,
    /// Active pipeline operations: session_key -> CancellationToken.
    /// `/stop` cancels all tokens to abort running tool loops.
    pub active_operations: DashMap<String, CancellationToken>,
    /// Outbound channel senders for cross-channel messaging.
    /// Key: channel name (e.g. "discord"), Value: sender for `ChannelOutbound` messages.
    pub channel_senders: DashMap<String, mpsc::Sender<ChannelOutbound>>,
    /// Client-side MCP tool plane — connected servers and their tool adapters.
    pub mcp: Arc<McpRuntime>,
    /// Publishing half of the shared inbound bus (see `bus_consumer`).
    /// `announce_system_message` and scheduler `agent_turn` reminders push
    /// synthetic `"system"`-channel messages here instead of writing
    /// straight to `notifications`, so they're summarized by the LLM first.
    pub bus_inbound: mpsc::UnboundedSender<nanobot_channels::InboundMessage>,
    /// Subagent manager (C8). Set once, right after this `AppState` is
    /// wrapped in an `Arc`, by `attach_subagents` — `SubagentManager::new`
    /// needs an `Arc<AppState>` that doesn't exist yet inside `new()`.
    pub subagents: std::sync::OnceLock<Arc<nanobot_agent::subagent::SubagentManager<AppState>>>,
}

impl AppState {
    pub fn new(
        config: NanobotConfig,
        agent: AgentRuntime,
        users: UserResolver,
        memory: MemoryManager,
        sessions: SessionManager,
        scheduler: SchedulerHandle,
        terminal: TerminalManager,
        mcp: Arc<McpRuntime>,
        bus_inbound: mpsc::UnboundedSender<nanobot_channels::InboundMessage>,
    ) -> Self {
        Self {
            config,
            event_seq: AtomicU64::new(0),
            presence_version: AtomicU64::new(0),
            broadcaster: EventBroadcaster::new(),
            agent,
            users,
            memory,
            sessions,
            scheduler,
            terminal: tokio::sync::Mutex::new(terminal),
            ws_clients: DashMap::new(),
            notifications: DashMap::new(),
            active_operations: DashMap::new(),
            channel_senders: DashMap::new(),
            mcp,
            bus_inbound,
            subagents: std::sync::OnceLock::new(),
        }
    }

    /// Monotonically increasing sequence for broadcast events.
    pub fn next_seq(&self) -> u64 {
        self.event_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Construct the subagent manager now that `self` is behind an `Arc`,
    /// and store it. Called once from `main` right after `Arc::new(AppState::new(...))`.
    pub fn attach_subagents(self: &Arc<Self>, workspace: std::path::PathBuf, max_concurrent: usize) {
        let manager = nanobot_agent::subagent::SubagentManager::new(Arc::clone(self), workspace, max_concurrent);
        let _ = self.subagents.set(Arc::new(manager));
    }
}

impl nanobot_agent::pipeline::MessageContext for AppState {
    fn agent(&self) -> &nanobot_agent::runtime::AgentRuntime {
        &self.agent
    }

    fn memory(&self) -> &nanobot_memory::manager::MemoryManager {
        &self.memory
    }

    fn terminal(&self) -> &tokio::sync::Mutex<nanobot_terminal::manager::TerminalManager> {
        &self.terminal
    }

    fn scheduler(&self) -> &nanobot_scheduler::SchedulerHandle {
        &self.scheduler
    }

    fn users(&self) -> &nanobot_users::resolver::UserResolver {
        &self.users
    }

    fn sessions(&self) -> &nanobot_sessions::SessionManager {
        &self.sessions
    }

    fn connected_channels(&self) -> Vec<String> {
        self.channel_senders
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn send_to_channel(&self, channel: &str, recipient: &str, message: &str) -> Result<(), String> {
        let sender = self
            .channel_senders
            .get(channel)
            .ok_or_else(|| format!("channel '{}' is not connected", channel))?;
        sender
            .try_send(ChannelOutbound {
                recipient: recipient.to_string(),
                message: message.to_string(),
            })
            .map_err(|e| format!("failed to send to '{}': {}", channel, e))
    }

    fn gateway_port(&self) -> Option<u16> {
        Some(self.config.gateway.port)
    }

    fn database_path(&self) -> Option<&str> {
        Some(&self.config.database.path)
    }

    fn announce_system_message(&self, msg: nanobot_channels::InboundMessage) {
        // Published to the bus instead of written straight to `notifications`
        // — `bus_consumer::run` re-enters the agent pipeline so the raw
        // announce text (which may carry internal instructions for the LLM,
        // e.g. a subagent's summarize-this-naturally prompt) is never shown
        // to the user verbatim.
        if self.bus_inbound.send(msg).is_err() {
            tracing::warn!("announce_system_message: bus has no consumer, message dropped");
        }
    }

    fn mcp(&self) -> Option<&McpRuntime> {
        Some(&self.mcp)
    }

    fn subagents(&self) -> Option<&Arc<nanobot_agent::subagent::SubagentManager<Self>>> {
        self.subagents.get()
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(crate::http::ui::ui_handler))
        .route("/health", get(crate::http::health::health_handler))
        .route("/chat", post(crate::http::chat::chat_handler))
        .route(
            "/notifications",
            get(crate::http::notifications::notifications_handler),
        )
        .route("/ws", get(crate::ws::connection::ws_handler))
        .route(
            "/v1/chat/completions",
            post(crate::http::openai_compat::chat_completions),
        )
        .route(
            "/webhooks/{source}",
            post(crate::http::webhooks::webhook_handler),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
