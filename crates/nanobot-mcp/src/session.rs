//! A live, handshaken connection to one MCP server.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{McpError, Result};
use crate::protocol::JsonRpcRequest;
use crate::transport::McpTransport;
use crate::types::{ServerCapabilities, ServerInfo, ToolDefinition};

/// The MCP protocol version this client negotiates.
pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";

/// Thin JSON-RPC client bound to one transport. Owns the monotonic request
/// id counter; `McpSession` layers the `initialize` handshake on top.
pub struct McpClient {
    transport: Box<dyn McpTransport>,
    next_id: AtomicU64,
}

impl McpClient {
    pub fn new(transport: Box<dyn McpTransport>) -> Self {
        Self {
            transport,
            next_id: AtomicU64::new(1),
        }
    }

    fn id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn send_raw(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let request = JsonRpcRequest::new(self.id(), method, params);
        let response = self.transport.send_request(request).await?;
        if let Some(err) = response.error {
            return Err(McpError::Protocol {
                code: err.code,
                message: err.message,
            });
        }
        response
            .result
            .ok_or_else(|| McpError::Protocol {
                code: 0,
                message: "empty result".into(),
            })
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        let result = self.send_raw("tools/list", serde_json::json!({})).await?;
        let tools_value = result.get("tools").cloned().unwrap_or_else(|| serde_json::json!([]));
        Ok(serde_json::from_value(tools_value)?)
    }

    pub async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> Result<serde_json::Value> {
        self.send_raw(
            "tools/call",
            serde_json::json!({ "name": name, "arguments": arguments }),
        )
        .await
    }

    pub async fn send_notification(&self, method: &str, params: serde_json::Value) -> Result<()> {
        self.transport.send_notification(method, params).await
    }

    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }
}

/// A session that has completed the `initialize` handshake.
pub struct McpSession {
    client: McpClient,
    pub server_info: ServerInfo,
    pub capabilities: ServerCapabilities,
    pub protocol_version: String,
}

impl McpSession {
    pub async fn connect(transport: Box<dyn McpTransport>) -> Result<Self> {
        let client = McpClient::new(transport);

        let init = client
            .send_raw(
                "initialize",
                serde_json::json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "clientInfo": { "name": "nanobot", "version": env!("CARGO_PKG_VERSION") }
                }),
            )
            .await?;

        let server_info: ServerInfo =
            serde_json::from_value(init.get("serverInfo").cloned().unwrap_or_default()).unwrap_or_default();
        let capabilities: ServerCapabilities =
            serde_json::from_value(init.get("capabilities").cloned().unwrap_or_default()).unwrap_or_default();
        let protocol_version = init
            .get("protocolVersion")
            .and_then(|v| v.as_str())
            .unwrap_or(MCP_PROTOCOL_VERSION)
            .to_string();

        client
            .send_notification("notifications/initialized", serde_json::json!({}))
            .await?;

        Ok(Self {
            client,
            server_info,
            capabilities,
            protocol_version,
        })
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        self.client.list_tools().await
    }

    pub async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> Result<serde_json::Value> {
        self.client.call_tool(name, arguments).await
    }

    pub async fn close(&self) -> Result<()> {
        self.client.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonRpcResponse;
    use crate::transport::MockTransport;

    fn ok(id: u64, result: serde_json::Value) -> JsonRpcResponse {
        JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    #[tokio::test]
    async fn connect_performs_handshake_and_parses_server_info() {
        let transport = MockTransport::new(vec![ok(
            1,
            serde_json::json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "demo", "version": "1.0"}
            }),
        )]);
        let session = McpSession::connect(Box::new(transport)).await.unwrap();
        assert_eq!(session.server_info.name, "demo");
        assert_eq!(session.protocol_version, MCP_PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn list_tools_parses_array() {
        let transport = MockTransport::new(vec![ok(
            1,
            serde_json::json!({"tools": [{"name": "echo", "description": "d", "inputSchema": {"type": "object"}}]}),
        )]);
        let client = McpClient::new(Box::new(transport));
        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
    }

    #[tokio::test]
    async fn protocol_error_surfaces_as_mcp_error() {
        let transport = MockTransport::new(vec![JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: None,
            error: Some(crate::protocol::JsonRpcError {
                code: -32601,
                message: "no such method".into(),
                data: None,
            }),
        }]);
        let client = McpClient::new(Box::new(transport));
        let err = client.call_tool("x", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::Protocol { code: -32601, .. }));
    }
}
