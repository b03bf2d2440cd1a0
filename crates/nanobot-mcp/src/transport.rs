//! Pluggable transports for MCP JSON-RPC traffic: one child process over
//! stdio, or one HTTP endpoint speaking plain request/response or
//! Server-Sent Events.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::error::{McpError, Result};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse>;
    async fn send_notification(&self, method: &str, params: serde_json::Value) -> Result<()>;
    /// Tear the transport down. Errors whose message indicates the teardown
    /// raced a cancellation in a different task are expected — callers
    /// downgrade those to `debug` per the loader's close() contract.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Spawns `command` and speaks line-delimited JSON-RPC over its stdio,
/// multiplexing concurrent requests by id via a background reader task.
pub struct StdioTransport {
    child: Arc<Mutex<Child>>,
    stdin: Arc<Mutex<tokio::process::ChildStdin>>,
    pending: PendingMap,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl StdioTransport {
    pub async fn spawn(command: &str, args: &[String], env: &HashMap<String, String>) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null());

        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::Transport(format!("failed to spawn '{command}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("failed to capture child stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("failed to capture child stdout".into()))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = Arc::clone(&pending);
        let reader_handle = tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                            Ok(response) => {
                                let mut map = reader_pending.lock().await;
                                if let Some(tx) = map.remove(&response.id) {
                                    let _ = tx.send(response);
                                }
                            }
                            Err(e) => debug!(error = %e, "ignoring non-response stdio line"),
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "stdio reader exiting on read error");
                        break;
                    }
                }
            }
            reader_pending.lock().await.clear();
        });

        Ok(Self {
            child: Arc::new(Mutex::new(child)),
            stdin: Arc::new(Mutex::new(stdin)),
            pending,
            reader_handle,
        })
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let id = request.id;
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        {
            let mut stdin = self.stdin.lock().await;
            stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|e| McpError::Transport(format!("write to stdin failed: {e}")))?;
            stdin
                .flush()
                .await
                .map_err(|e| McpError::Transport(format!("flush stdin failed: {e}")))?;
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(McpError::Transport(
                "child process closed stdout before responding".into(),
            )),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(McpError::Timeout(REQUEST_TIMEOUT))
            }
        }
    }

    async fn send_notification(&self, method: &str, params: serde_json::Value) -> Result<()> {
        let notif = JsonRpcNotification::new(method, params);
        let mut line = serde_json::to_string(&notif)?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::Transport(format!("write notification failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| McpError::Transport(format!("flush notification failed: {e}")))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.reader_handle.abort();
        let mut child = self.child.lock().await;
        match child.kill().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {
                // Already exited — not an error.
                Ok(())
            }
            Err(e) => Err(McpError::Transport(format!("failed to kill child: {e}"))),
        }
    }
}

/// Plain JSON-RPC-over-HTTP-POST transport (the `http` transport kind).
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| McpError::Transport(format!("HTTP request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(McpError::Transport(format!("HTTP {status}: {body}")));
        }

        resp.json()
            .await
            .map_err(|e| McpError::Transport(format!("failed to parse response: {e}")))
    }

    async fn send_notification(&self, method: &str, params: serde_json::Value) -> Result<()> {
        let notif = JsonRpcNotification::new(method, params);
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&notif)
            .send()
            .await
            .map_err(|e| McpError::Transport(format!("HTTP notification failed: {e}")))?;
        if !resp.status().is_success() {
            debug!(status = %resp.status(), "HTTP notification got non-success status");
        }
        Ok(())
    }
}

/// Streamable-HTTP transport (MCP's 2025-03 default): POSTs the request and
/// accepts either a single JSON object back or a `text/event-stream` body
/// whose first complete `data:` frame carries the JSON-RPC response.
pub struct StreamableHttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl StreamableHttpTransport {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let resp = self
            .client
            .post(&self.endpoint)
            .header("Accept", "application/json, text/event-stream")
            .json(&request)
            .send()
            .await
            .map_err(|e| McpError::Transport(format!("streamable-http request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(McpError::Transport(format!("HTTP {status}: {body}")));
        }

        let is_sse = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let body = resp
            .text()
            .await
            .map_err(|e| McpError::Transport(format!("failed to read body: {e}")))?;

        if is_sse {
            parse_first_sse_data(&body)
        } else {
            serde_json::from_str(&body).map_err(McpError::from)
        }
    }

    async fn send_notification(&self, method: &str, params: serde_json::Value) -> Result<()> {
        let notif = JsonRpcNotification::new(method, params);
        let resp = self
            .client
            .post(&self.endpoint)
            .header("Accept", "application/json, text/event-stream")
            .json(&notif)
            .send()
            .await
            .map_err(|e| McpError::Transport(format!("streamable-http notification failed: {e}")))?;
        if !resp.status().is_success() {
            debug!(status = %resp.status(), "streamable-http notification got non-success status");
        }
        Ok(())
    }
}

/// SSE transport (the legacy two-endpoint MCP flavor): requests are POSTed
/// to `endpoint`, and the response is the single `data:` frame of an
/// event-stream body the server returns synchronously.
pub struct SseTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl SseTransport {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let resp = self
            .client
            .post(&self.endpoint)
            .header("Accept", "text/event-stream")
            .json(&request)
            .send()
            .await
            .map_err(|e| McpError::Transport(format!("SSE request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(McpError::Transport(format!("HTTP {status}: {body}")));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| McpError::Transport(format!("failed to read SSE body: {e}")))?;
        parse_first_sse_data(&body)
    }

    async fn send_notification(&self, method: &str, params: serde_json::Value) -> Result<()> {
        let notif = JsonRpcNotification::new(method, params);
        let resp = self
            .client
            .post(&self.endpoint)
            .header("Accept", "text/event-stream")
            .json(&notif)
            .send()
            .await
            .map_err(|e| McpError::Transport(format!("SSE notification failed: {e}")))?;
        if !resp.status().is_success() {
            debug!(status = %resp.status(), "SSE notification got non-success status");
        }
        Ok(())
    }
}

/// Pull the JSON-RPC response out of the first complete `data:` line of an
/// SSE body (lines are separated by `\n`; a frame ends at a blank line).
fn parse_first_sse_data(body: &str) -> Result<JsonRpcResponse> {
    for line in body.lines() {
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            return serde_json::from_str(data).map_err(McpError::from);
        }
    }
    Err(McpError::Transport(
        "SSE body contained no data: frame".into(),
    ))
}

#[cfg(test)]
pub struct MockTransport {
    responses: Mutex<Vec<JsonRpcResponse>>,
    pub requests: Mutex<Vec<JsonRpcRequest>>,
}

#[cfg(test)]
impl MockTransport {
    pub fn new(responses: Vec<JsonRpcResponse>) -> Self {
        Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl McpTransport for MockTransport {
    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        self.requests.lock().await.push(request);
        let mut responses = self.responses.lock().await;
        if responses.is_empty() {
            Err(McpError::Transport("no more mock responses".into()))
        } else {
            Ok(responses.remove(0))
        }
    }

    async fn send_notification(&self, _method: &str, _params: serde_json::Value) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_parses_first_data_frame() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"ok\":true}}\n\n";
        let resp = parse_first_sse_data(body).unwrap();
        assert_eq!(resp.id, 1);
        assert_eq!(resp.result.unwrap()["ok"], serde_json::json!(true));
    }

    #[test]
    fn sse_errors_on_missing_data_frame() {
        let body = "event: ping\n\n";
        assert!(parse_first_sse_data(body).is_err());
    }

    #[tokio::test]
    async fn mock_transport_round_trips() {
        let response = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: Some(serde_json::json!({"tools": []})),
            error: None,
        };
        let transport = MockTransport::new(vec![response]);
        let req = JsonRpcRequest::new(1, "tools/list", serde_json::json!({}));
        let resp = transport.send_request(req).await.unwrap();
        assert_eq!(resp.id, 1);
    }
}
