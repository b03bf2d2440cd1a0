//! Concurrent tool registry — the dynamic counterpart to [`crate::tools::build::build_tools`].
//!
//! `build_tools` assembles the fixed, per-turn set of built-in tools; this
//! registry is for tools that come and go at runtime (MCP server adapters,
//! subagent-scoped restrictions) and need a single shared name→tool map that
//! supports concurrent lookup and bulk unregistration by prefix.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::FutureExt;
use serde_json::Value;

use crate::provider::ToolDefinition;
use crate::tools::Tool;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("tool name '{0}' is invalid: must match ^[A-Za-z0-9_-]+$")]
    InvalidName(String),
    #[error("tool '{0}' is already registered")]
    AlreadyRegistered(String),
}

/// Name→tool map, safe to share across tasks via `Arc<ToolRegistry>`.
///
/// `DashMap` gives sharded, fine-grained locking: concurrent `get` calls never
/// block each other, and `register`/`unregister_by_prefix` only contend with
/// readers of the same shard.
pub struct ToolRegistry {
    tools: DashMap<String, Arc<dyn Tool>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: DashMap::new(),
        }
    }

    /// Register a tool under its own `name()`. Rejects invalid names and
    /// duplicate registration — callers that want to replace a tool should
    /// `unregister_by_prefix` first.
    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let name = tool.name().to_string();
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(RegistryError::InvalidName(name));
        }
        if self.tools.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Remove every tool whose name starts with `prefix` (e.g. `"mcp_myserver_"`
    /// on an MCP server disconnect). Returns how many were removed.
    pub fn unregister_by_prefix(&self, prefix: &str) -> usize {
        let doomed: Vec<String> = self
            .tools
            .iter()
            .map(|e| e.key().clone())
            .filter(|name| name.starts_with(prefix))
            .collect();
        for name in &doomed {
            self.tools.remove(name);
        }
        doomed.len()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|e| Arc::clone(e.value()))
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// JSON-schema tool list the LLM API expects.
    pub fn get_definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|e| ToolDefinition {
                name: e.key().clone(),
                description: e.value().description().to_string(),
                input_schema: e.value().input_schema(),
            })
            .collect()
    }

    /// A point-in-time snapshot of every registered tool, for passing into
    /// call sites that expect a plain slice (e.g. [`crate::tools::tool_loop::run_tool_loop`]
    /// in its registry-backed form).
    pub fn snapshot(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Look up `name`, validate `args` against its schema, and run it.
    ///
    /// Never returns an `Err` and never panics out to the caller: every
    /// failure mode — missing tool, bad arguments, or a panic inside the
    /// tool's `execute` — is converted to a `"Error: ..."`-prefixed string so
    /// the agent loop can keep going.
    pub async fn execute(&self, name: &str, args: Value) -> String {
        let tool = match self.get(name) {
            Some(t) => t,
            None => return format!("Error: Tool '{name}' not found"),
        };

        if let Err(detail) = validate_args(&tool.input_schema(), &args) {
            return format!("Error: invalid arguments for '{name}': {detail}");
        }

        let result = AssertUnwindSafe(tool.execute(args)).catch_unwind().await;
        match result {
            Ok(r) if r.is_error => format!("Error: {}", r.content),
            Ok(r) => r.content,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "tool panicked with a non-string payload".to_string());
                format!("Error executing {name}: {message}")
            }
        }
    }
}

/// Minimal JSON-schema validation: required fields, primitive type checks,
/// and enum membership. Not a full JSON-schema implementation — matches what
/// the agent loop actually needs to reject before wasting a tool call.
fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    let Some(obj) = schema.as_object() else {
        return Ok(());
    };

    if let Some(required) = obj.get("required").and_then(|v| v.as_array()) {
        for field in required {
            let Some(field_name) = field.as_str() else {
                continue;
            };
            if args.get(field_name).is_none() {
                return Err(format!("missing required field '{field_name}'"));
            }
        }
    }

    let Some(properties) = obj.get("properties").and_then(|v| v.as_object()) else {
        return Ok(());
    };
    let Some(args_obj) = args.as_object() else {
        return Ok(());
    };

    for (field_name, field_schema) in properties {
        let Some(value) = args_obj.get(field_name) else {
            continue;
        };
        if let Some(expected_type) = field_schema.get("type").and_then(|v| v.as_str()) {
            if !value_matches_type(value, expected_type) {
                return Err(format!(
                    "field '{field_name}' expected type '{expected_type}', got {}",
                    json_type_name(value)
                ));
            }
        }
        if let Some(allowed) = field_schema.get("enum").and_then(|v| v.as_array()) {
            if !allowed.iter().any(|a| a == value) {
                return Err(format!("field '{field_name}' is not one of the allowed enum values"));
            }
        }
    }

    Ok(())
}

fn value_matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::tools::ToolResult;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its 'text' argument"
        }
        fn input_schema(&self) -> Value {
            serde_json::json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })
        }
        async fn execute(&self, input: Value) -> ToolResult {
            ToolResult::success(input.get("text").and_then(|v| v.as_str()).unwrap_or("").to_string())
        }
    }

    struct Panicky;

    #[async_trait]
    impl Tool for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }
        fn description(&self) -> &str {
            "always panics"
        }
        fn input_schema(&self) -> Value {
            serde_json::json!({ "type": "object", "properties": {} })
        }
        async fn execute(&self, _input: Value) -> ToolResult {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn unknown_tool_returns_error_string() {
        let registry = ToolRegistry::new();
        let out = registry.execute("nope", serde_json::json!({})).await;
        assert_eq!(out, "Error: Tool 'nope' not found");
    }

    #[tokio::test]
    async fn missing_required_field_is_rejected() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        let out = registry.execute("echo", serde_json::json!({})).await;
        assert!(out.starts_with("Error: invalid arguments for 'echo'"));
    }

    #[tokio::test]
    async fn successful_execution_returns_content() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        let out = registry
            .execute("echo", serde_json::json!({"text": "hi"}))
            .await;
        assert_eq!(out, "hi");
    }

    #[tokio::test]
    async fn panic_is_caught_and_stringified() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Panicky)).unwrap();
        let out = registry.execute("panicky", serde_json::json!({})).await;
        assert!(out.starts_with("Error executing panicky:"));
    }

    #[test]
    fn unregister_by_prefix_removes_matching_only() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        let removed = registry.unregister_by_prefix("mcp_");
        assert_eq!(removed, 0);
        let removed = registry.unregister_by_prefix("ech");
        assert_eq!(removed, 1);
        assert!(registry.get("echo").is_none());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        let err = registry.register(Arc::new(Echo)).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered(_)));
    }
}
