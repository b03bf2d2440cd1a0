//! `spawn` tool — delegate a task to a background subagent (C8).
//!
//! The main agent calls this tool to hand off a self-contained piece of work
//! (a coding task, a research question, describing an image) to an isolated
//! subagent running its own restricted tool-calling loop. The call returns
//! immediately; the subagent's result is announced back through the bus once
//! it finishes, so the main agent can summarize it for the user on its own
//! next turn.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::pipeline::context::MessageContext;
use crate::subagent::{BUILTIN_TEMPLATES, SubagentManager};

use super::{Tool, ToolResult};

/// AI tool that spawns a subagent from one of the built-in templates.
pub struct SpawnTool<C: MessageContext + 'static> {
    manager: Arc<SubagentManager<C>>,
    origin_channel: String,
    origin_chat_id: String,
}

impl<C: MessageContext + 'static> SpawnTool<C> {
    pub fn new(manager: Arc<SubagentManager<C>>, origin_channel: &str, origin_chat_id: &str) -> Self {
        Self {
            manager,
            origin_channel: origin_channel.to_string(),
            origin_chat_id: origin_chat_id.to_string(),
        }
    }

    fn template_catalogue() -> String {
        BUILTIN_TEMPLATES
            .iter()
            .map(|t| format!("- {}: {}", t.name, t.description))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl<C: MessageContext + 'static> Tool for SpawnTool<C> {
    fn name(&self) -> &str {
        "spawn"
    }

    fn description(&self) -> &str {
        "Delegate a self-contained task to a background subagent. Use this for work that can run \
         on its own and report back later — a coding task, research, analyzing an attached image or \
         voice note — rather than work the user needs an immediate answer to. Returns right away \
         with a confirmation; the subagent's result arrives as a later message once it completes."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "Full description of the task for the subagent to complete. \
                                    Include every detail it will need — it has no access to this conversation."
                },
                "template": {
                    "type": "string",
                    "description": format!(
                        "Which subagent persona to use. Defaults to 'minimal'. Options:\n{}",
                        Self::template_catalogue()
                    )
                },
                "label": {
                    "type": "string",
                    "description": "Optional short label for the task, shown in status/cancellation messages. \
                                    Derived from the task text if omitted."
                },
                "enable_memory": {
                    "type": "boolean",
                    "description": "If true, the subagent appends a daily note of what it did to long-term memory."
                },
                "media_paths": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Filesystem paths of images/audio to attach to the subagent's first turn \
                                    (only used by templates with attach_media, e.g. 'vision', 'voice')."
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, input: Value) -> ToolResult {
        let task = match input.get("task").and_then(|v| v.as_str()) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => return ToolResult::error("'task' is required"),
        };

        let template_name = input
            .get("template")
            .and_then(|v| v.as_str())
            .unwrap_or("minimal")
            .to_string();

        let label = input
            .get("label")
            .and_then(|v| v.as_str())
            .map(String::from);

        let enable_memory = input
            .get("enable_memory")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let media: Vec<PathBuf> = input
            .get("media_paths")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();

        let confirmation = self
            .manager
            .spawn(
                task,
                label,
                &template_name,
                None,
                enable_memory,
                self.origin_channel.clone(),
                self.origin_chat_id.clone(),
                media,
                None,
            )
            .await;

        ToolResult::success(confirmation)
    }
}
