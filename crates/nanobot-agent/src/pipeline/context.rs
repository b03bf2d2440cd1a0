//! Shared context interface for all channel adapters.
//!
//! `MessageContext` is the single trait that every channel host (gateway, discord,
//! future telegram, etc.) must implement. It replaces the old `DiscordAppContext`
//! and lets the pipeline crate stay channel-agnostic.

use std::sync::Arc;

use nanobot_channels::InboundMessage;
use nanobot_memory::manager::MemoryManager;
use nanobot_scheduler::SchedulerHandle;
use nanobot_sessions::SessionManager;
use nanobot_terminal::manager::TerminalManager;
use nanobot_users::resolver::UserResolver;

use crate::mcp_adapter::McpRuntime;
use crate::runtime::AgentRuntime;

/// Minimal context interface required by the shared message pipeline.
///
/// Implemented by `AppState` in `nanobot-gateway` and any future channel host.
/// Defined here (in `nanobot-agent`) to avoid circular dependency: all channel
/// crates depend on `nanobot-agent`; `nanobot-agent` depends only on `nanobot-core`,
/// `nanobot-memory`, `nanobot-scheduler`, `nanobot-terminal`, and `nanobot-users`.
///
/// The routing-oriented methods (`connected_channels`, `send_to_channel`,
/// `gateway_port`, `database_path`) carry default implementations so a host
/// that only runs a single channel (CLI, a future minimal adapter) isn't
/// forced to implement cross-channel delivery it doesn't offer.
pub trait MessageContext: Send + Sync {
    fn agent(&self) -> &AgentRuntime;
    fn memory(&self) -> &MemoryManager;
    fn terminal(&self) -> &tokio::sync::Mutex<TerminalManager>;
    fn scheduler(&self) -> &SchedulerHandle;
    fn users(&self) -> &UserResolver;
    /// The structured session log (dense-sequenced message history, distinct
    /// from `memory()`'s conversation table used for prompt-building history).
    fn sessions(&self) -> &SessionManager;

    /// Channel names currently connected to the bus (for `send_message`/subagent routing).
    fn connected_channels(&self) -> Vec<String> {
        Vec::new()
    }

    /// Deliver `message` to `recipient` on `channel`. Hosts without cross-channel
    /// delivery (a bare CLI) reject with an error string per §7's "returned as
    /// string, never thrown" convention.
    fn send_to_channel(&self, channel: &str, recipient: &str, message: &str) -> Result<(), String> {
        let _ = (recipient, message);
        Err(format!("channel '{channel}' is not connected"))
    }

    /// Port the local Web-UI/WS gateway is listening on, if this host runs one.
    fn gateway_port(&self) -> Option<u16> {
        None
    }

    /// Filesystem path of the backing SQLite database, if applicable.
    fn database_path(&self) -> Option<&str> {
        None
    }

    /// Hand a synthetic `"system"`-channel message (subagent announce,
    /// scheduler fire) back to the host for eventual delivery to the user.
    /// Hosts without an async intake queue (a bare CLI) simply drop it.
    fn announce_system_message(&self, msg: InboundMessage) {
        let _ = msg;
    }

    /// The MCP tool plane, if this host has one configured. Hosts that don't
    /// run MCP servers (tests, a minimal embed) simply have no tools to add.
    fn mcp(&self) -> Option<&McpRuntime> {
        None
    }

    /// The subagent manager (C8), if this host runs one. `Self: Sized` keeps
    /// the trait object-safe for callers that don't need this accessor;
    /// `build_tools`'s `C: MessageContext + 'static` bound satisfies it.
    fn subagents(&self) -> Option<&Arc<crate::subagent::SubagentManager<Self>>>
    where
        Self: Sized,
    {
        None
    }
}
