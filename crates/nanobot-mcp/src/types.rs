//! Static configuration and wire types for the MCP tool plane.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// How a configured server is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Stdio,
    Http,
    Sse,
    StreamableHttp,
}

/// One entry from the operator's MCP server list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Stable identifier, used to build `mcp_<id>_<tool>` names and as the
    /// cooldown/state-machine key.
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub transport: Transport,
    /// stdio only.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// http/sse/streamable_http only.
    #[serde(default)]
    pub url: Option<String>,
    /// Whether to connect at `registerToolsAsync` time (eager) or defer to
    /// the first tool invocation (lazy).
    #[serde(default)]
    pub lazy: bool,
}

fn default_true() -> bool {
    true
}

/// Definition of a single tool exposed by an MCP server (`tools/list`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", alias = "input_schema")]
    pub input_schema: serde_json::Value,
}

/// Server capabilities and identity reported by `initialize`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(default)]
    pub tools: Option<serde_json::Value>,
}

/// Sanitize a remote tool name into the `mcp_<server>_<tool>` convention,
/// replacing any character outside `[A-Za-z0-9_-]` with `_` so the combined
/// name still matches the registry's `^[A-Za-z0-9_-]+$` rule.
pub fn sanitized_tool_name(server_id: &str, remote_name: &str) -> String {
    let sanitize = |s: &str| -> String {
        s.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    };
    format!("mcp_{}_{}", sanitize(server_id), sanitize(remote_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_disallowed_characters() {
        assert_eq!(
            sanitized_tool_name("my.server", "search/docs"),
            "mcp_my_server_search_docs"
        );
    }

    #[test]
    fn leaves_valid_names_untouched() {
        assert_eq!(sanitized_tool_name("github", "create_issue"), "mcp_github_create_issue");
    }
}
