//! `nanobot-mcp` — client-side Model Context Protocol tool plane.
//!
//! # Overview
//!
//! [`loader::McpLoader`] connects out to operator-configured MCP servers
//! over stdio, HTTP, SSE, or streamable-HTTP, and exposes each server's
//! tools under the `mcp_<server>_<tool>` naming convention so they can be
//! registered alongside the agent's built-in tools.
//!
//! Each connected server gets one dedicated worker task that owns its
//! [`session::McpSession`] for the session's whole lifetime; every call
//! (including health checks) is routed through that task, so a server's
//! session never has to be shared or migrated across executor threads.

pub mod error;
pub mod loader;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod types;

pub use error::{McpError, Result};
pub use loader::{McpLoader, McpToolHandle, ServerState};
pub use session::{McpClient, McpSession};
pub use types::{sanitized_tool_name, McpServerConfig, ServerCapabilities, ServerInfo, ToolDefinition, Transport};
