use thiserror::Error;

/// Errors that can occur while connecting to or calling an MCP server.
#[derive(Debug, Error)]
pub enum McpError {
    /// Transport-level failure: process spawn, pipe I/O, HTTP send, SSE parse.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server's JSON-RPC response carried an `error` object.
    #[error("protocol error (code={code}): {message}")]
    Protocol { code: i32, message: String },

    /// A response or config value failed to (de)serialize.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// `connect`/`call_tool` exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The named server is not configured or not registered.
    #[error("unknown MCP server: {0}")]
    UnknownServer(String),

    /// The server is in its post-failure cooldown window; no connect attempted.
    #[error("server '{0}' is in cooldown, retry after {1:?}")]
    Cooldown(String, std::time::Duration),

    /// The server's transport kind is not supported by this build.
    #[error("unsupported transport '{0}'")]
    UnsupportedTransport(String),
}

pub type Result<T> = std::result::Result<T, McpError>;
