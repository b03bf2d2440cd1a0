//! Tool execution loop — the core agentic behavior.
//!
//! Flow: prompt → LLM → if tool_use → execute tools → inject results → LLM →
//! repeat. Stops when: `stop_reason != "tool_use"`, max iterations reached,
//! the execution-time budget is exhausted, the same tool call repeats back
//! to back, or the caller cancels. A forced synthesis call (no tools
//! offered) turns a loop-exhausted conversation into a final answer instead
//! of surfacing raw tool output to the user.

use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::provider::{ChatRequest, ChatResponse, LlmProvider, ProviderError, ToolCall};

use super::{Tool, ToolResult};

/// A progress notification emitted mid-turn. Consumers (channel adapters,
/// the WS gateway) use these to show "thinking…" / "running tool…" status;
/// the loop itself never blocks on how — or whether — they're handled.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Thinking,
    ToolStart { name: String },
    /// `result` is truncated to 2000 chars before being handed out.
    ToolEnd { name: String, result: String },
}

const PROGRESS_TRUNCATE_LEN: usize = 2000;

/// Caller-supplied limits for one turn. Defaults mirror
/// [`nanobot_core::config::AgentConfig`]'s documented defaults.
#[derive(Debug, Clone, Copy)]
pub struct LoopLimits {
    /// Clamped to `[1, 200]` by the caller (see `AgentConfig::clamped_max_iterations`).
    pub max_iterations: usize,
    /// `0` means unlimited.
    pub max_execution_time_secs: u64,
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self {
            max_iterations: 40,
            max_execution_time_secs: 600,
        }
    }
}

/// One tool call executed within a loop iteration, with its result attached.
#[derive(Debug, Clone)]
pub struct ExecutedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    pub result: String,
    pub is_error: bool,
}

/// One iteration's assistant turn: the text it produced (often empty, when
/// the turn is pure tool calls) plus every call it made, in order.
#[derive(Debug, Clone)]
pub struct ToolLoopStep {
    pub assistant_text: String,
    pub calls: Vec<ExecutedToolCall>,
}

/// Outcome of a completed tool loop: the final response, the ordered list of
/// tool names that were actually executed (used for usage-frequency tracking
/// and subagent announce summaries), and the per-iteration steps (used to
/// persist the assistant/tool-result messages a session log needs).
pub struct ToolLoopOutcome {
    pub response: ChatResponse,
    pub called_tools: Vec<String>,
    pub steps: Vec<ToolLoopStep>,
}

/// Run the full tool execution loop (non-streaming).
///
/// Starts from `initial_request`, which must have `messages` or
/// `raw_messages` set. `progress` is invoked for each lifecycle event;
/// callback panics/errors are caught and logged, never propagated.
pub async fn run_tool_loop(
    provider: &dyn LlmProvider,
    initial_request: ChatRequest,
    tools: &[Box<dyn Tool>],
    cancel: Option<&CancellationToken>,
    limits: LoopLimits,
    mut progress: Option<&mut dyn FnMut(ProgressEvent)>,
) -> Result<ToolLoopOutcome, ProviderError> {
    let mut raw_messages: Vec<serde_json::Value> = if let Some(ref raw) = initial_request.raw_messages
    {
        raw.clone()
    } else {
        initial_request
            .messages
            .iter()
            .map(|m| serde_json::json!({ "role": m.role, "content": m.content }))
            .collect()
    };

    let max_iterations = limits.max_iterations.clamp(1, 200);
    let deadline = (limits.max_execution_time_secs > 0)
        .then(|| Instant::now() + Duration::from_secs(limits.max_execution_time_secs));

    let mut last_response: Option<ChatResponse> = None;
    let mut called_tools: Vec<String> = Vec::new();
    let mut steps: Vec<ToolLoopStep> = Vec::new();
    // Only the immediately-previous tool step is compared — an A→B→A
    // pattern is intentionally allowed through, matching the original
    // loop-detection design this was ported from.
    let mut last_step_key: Option<(String, String)> = None;

    for iteration in 0..max_iterations {
        if let Some(token) = cancel {
            if token.is_cancelled() {
                info!(iteration, "tool loop cancelled");
                return Err(ProviderError::Cancelled);
            }
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                warn!(iteration, "tool loop exceeded execution time budget");
                break;
            }
        }

        let mut req = initial_request.clone();
        req.raw_messages = Some(raw_messages.clone());

        debug!(iteration, "tool loop iteration");
        emit(&mut progress, ProgressEvent::Thinking);

        let response = send_with_cancellation(provider, &req, cancel).await?;

        if response.tool_calls.is_empty() || response.stop_reason != "tool_use" {
            info!(iteration, "tool loop complete — no more tool calls");
            return Ok(ToolLoopOutcome {
                response,
                called_tools,
                steps,
            });
        }

        // Loop detection: compare only the first requested call of this
        // step against the last step's first call.
        if let Some(first) = response.tool_calls.first() {
            let key = (first.name.clone(), canonical_json(&first.input));
            if last_step_key.as_ref() == Some(&key) {
                warn!(tool = %first.name, "tool loop detected repeated call, forcing synthesis");
                last_response = Some(response);
                break;
            }
            last_step_key = Some(key);
        }

        let mut assistant_content: Vec<serde_json::Value> = Vec::new();
        if !response.content.is_empty() {
            assistant_content.push(serde_json::json!({
                "type": "text",
                "text": response.content,
            }));
        }
        for call in &response.tool_calls {
            assistant_content.push(serde_json::json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.name,
                "input": call.input,
            }));
        }
        raw_messages.push(serde_json::json!({
            "role": "assistant",
            "content": assistant_content,
        }));

        let mut tool_result_content: Vec<serde_json::Value> = Vec::new();
        let mut executed_calls: Vec<ExecutedToolCall> = Vec::new();
        for call in &response.tool_calls {
            emit(
                &mut progress,
                ProgressEvent::ToolStart {
                    name: call.name.clone(),
                },
            );
            let result = execute_tool(tools, call).await;
            emit(
                &mut progress,
                ProgressEvent::ToolEnd {
                    name: call.name.clone(),
                    result: truncate(&result.content, PROGRESS_TRUNCATE_LEN),
                },
            );
            called_tools.push(call.name.clone());
            tool_result_content.push(serde_json::json!({
                "type": "tool_result",
                "tool_use_id": call.id,
                "content": result.content,
                "is_error": result.is_error,
            }));
            executed_calls.push(ExecutedToolCall {
                id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.input.clone(),
                result: result.content.clone(),
                is_error: result.is_error,
            });
        }
        raw_messages.push(serde_json::json!({
            "role": "user",
            "content": tool_result_content,
        }));
        steps.push(ToolLoopStep {
            assistant_text: response.content.clone(),
            calls: executed_calls,
        });

        last_response = Some(response);
    }

    warn!(max_iterations, "tool loop ended without a tool-less response, forcing synthesis");

    // Forced synthesis: same history, no tools offered. A non-empty,
    // trimmed response wins; otherwise fall back to a templated summary of
    // which tools ran so the user isn't left with nothing.
    let mut synthesis_request = initial_request.clone();
    synthesis_request.raw_messages = Some(raw_messages);
    synthesis_request.tools = Vec::new();

    match send_with_cancellation(provider, &synthesis_request, cancel).await {
        Ok(mut response) => {
            if response.content.trim().is_empty() {
                response.content = fallback_summary(&called_tools);
            }
            Ok(ToolLoopOutcome {
                response,
                called_tools,
                steps,
            })
        }
        Err(e) => {
            if let Some(mut resp) = last_response {
                warn!(error = %e, "synthesis call failed, returning last tool-loop response");
                resp.content = fallback_summary(&called_tools);
                Ok(ToolLoopOutcome {
                    response: resp,
                    called_tools,
                    steps,
                })
            } else {
                Err(e)
            }
        }
    }
}

async fn send_with_cancellation(
    provider: &dyn LlmProvider,
    req: &ChatRequest,
    cancel: Option<&CancellationToken>,
) -> Result<ChatResponse, ProviderError> {
    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(ProviderError::Cancelled),
            result = provider.send(req) => result,
        },
        None => provider.send(req).await,
    }
}

/// Find and execute the named tool, catching panics so a buggy tool can
/// never take the whole turn down.
async fn execute_tool(tools: &[Box<dyn Tool>], call: &ToolCall) -> ToolResult {
    match tools.iter().find(|t| t.name() == call.name) {
        Some(tool) => {
            debug!(tool = %call.name, "executing tool");
            match AssertUnwindSafe(tool.execute(call.input.clone()))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(&panic);
                    warn!(tool = %call.name, %message, "tool panicked");
                    ToolResult::error(format!("Error executing {}: {}", call.name, message))
                }
            }
        }
        None => ToolResult::error(format!("Error: Tool '{}' not found", call.name)),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn canonical_json(value: &serde_json::Value) -> String {
    // serde_json's Map is insertion-ordered by default; re-sort keys so two
    // structurally equal objects with keys in a different order compare
    // equal.
    fn sort(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().map(|(k, v)| (k.clone(), sort(v))).collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                serde_json::Value::Object(entries.into_iter().collect())
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sort).collect())
            }
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_len).collect();
        format!("{truncated}…")
    }
}

fn fallback_summary(called_tools: &[String]) -> String {
    if called_tools.is_empty() {
        "I wasn't able to produce a final answer for this turn.".to_string()
    } else {
        let mut seen = Vec::new();
        for name in called_tools {
            if !seen.contains(name) {
                seen.push(name.clone());
            }
        }
        format!(
            "I ran {} but couldn't summarize the result in time: {}.",
            if seen.len() == 1 { "a tool" } else { "some tools" },
            seen.join(", ")
        )
    }
}

fn emit(progress: &mut Option<&mut dyn FnMut(ProgressEvent)>, event: ProgressEvent) {
    if let Some(callback) = progress.as_mut() {
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| callback(event)));
        if let Err(panic) = result {
            debug!(message = %panic_message(&panic), "progress callback panicked, ignoring");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes input"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, input: serde_json::Value) -> ToolResult {
            ToolResult::success(input.to_string())
        }
    }

    struct PanicTool;

    #[async_trait]
    impl Tool for PanicTool {
        fn name(&self) -> &str {
            "boom"
        }
        fn description(&self) -> &str {
            "always panics"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _input: serde_json::Value) -> ToolResult {
            panic!("kaboom");
        }
    }

    #[tokio::test]
    async fn unknown_tool_returns_error_result_not_panic() {
        let tools: Vec<Box<dyn Tool>> = vec![Box::new(EchoTool)];
        let call = ToolCall {
            id: "1".into(),
            name: "missing".into(),
            input: serde_json::json!({}),
        };
        let result = execute_tool(&tools, &call).await;
        assert!(result.is_error);
        assert!(result.content.contains("not found"));
    }

    #[tokio::test]
    async fn panicking_tool_is_caught() {
        let tools: Vec<Box<dyn Tool>> = vec![Box::new(PanicTool)];
        let call = ToolCall {
            id: "1".into(),
            name: "boom".into(),
            input: serde_json::json!({}),
        };
        let result = execute_tool(&tools, &call).await;
        assert!(result.is_error);
        assert!(result.content.starts_with("Error executing boom:"));
    }

    #[test]
    fn canonical_json_ignores_key_order() {
        let a = serde_json::json!({"b": 1, "a": 2});
        let b = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn fallback_summary_dedupes_tool_names() {
        let names = vec!["read_file".to_string(), "read_file".to_string()];
        let summary = fallback_summary(&names);
        assert_eq!(summary.matches("read_file").count(), 1);
    }

    #[test]
    fn fallback_summary_empty_when_no_tools_ran() {
        assert!(fallback_summary(&[]).contains("wasn't able"));
    }
}
