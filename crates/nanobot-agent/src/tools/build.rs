//! Tool registry — builds the canonical tool list for any channel adapter.

use std::sync::Arc;

use crate::mcp_adapter::SharedTool;
use crate::pipeline::context::MessageContext;
use crate::provider::ToolDefinition;

use super::bash_session::BashSessionTool;
use super::execute_command::ExecuteCommandTool;
use super::knowledge::{KnowledgeSearchTool, KnowledgeWriteTool};
use super::reminder::ReminderTool;
use super::send_message::SendMessageTool;
use super::skill::{format_skill_index, load_skills, SkillReadTool};
use super::spawn::SpawnTool;
use super::{to_definitions, Tool};

/// Output of [`build_tools`]: the tool set for this turn plus the rendered
/// skill catalogue to splice into the volatile prompt tier.
pub struct BuiltTools {
    pub tools: Vec<Box<dyn Tool>>,
    pub skill_index: String,
}

/// Build the full list of tools available to the AI for a given request.
///
/// Includes:
/// - `read_file`, `write_file`, `list_files`, `search_files` (filesystem, nanobot-agent)
/// - `execute_command` (one-shot sh -c via TerminalManager)
/// - `bash` (persistent PTY bash session via TerminalManager)
/// - `reminder` (schedule proactive reminders via the scheduler)
/// - `send_message` (cross-channel delivery)
/// - `knowledge_search`/`knowledge_write` (operator knowledge base)
/// - `skill_read` (fetch a loaded skill's full body by name)
/// - `spawn` (delegate a task to a background subagent, C8) — only offered
///   when the host has a subagent manager and a `session_key` to announce
///   the result back to
///
/// `channel_name` and `channel_id` are forwarded to `ReminderTool` so it can
/// embed the correct delivery target in the persisted job action. `session_key`
/// is also used to derive `spawn`'s announce target.
pub fn build_tools<C: MessageContext + 'static>(
    ctx: Arc<C>,
    channel_name: &str,
    channel_id: Option<u64>,
    session_key: Option<&str>,
) -> BuiltTools {
    let mut tools: Vec<Box<dyn Tool>> = vec![
        Box::new(super::read_file::ReadFileTool),
        Box::new(super::write_file::WriteFileTool),
        Box::new(super::list_files::ListFilesTool),
        Box::new(super::search_files::SearchFilesTool),
        Box::new(ExecuteCommandTool::new(Arc::clone(&ctx))),
        Box::new(BashSessionTool::new(Arc::clone(&ctx))),
        Box::new(ReminderTool::new(
            Arc::clone(&ctx),
            channel_name,
            channel_id,
            session_key,
        )),
        Box::new(KnowledgeSearchTool::new(Arc::clone(&ctx))),
        Box::new(KnowledgeWriteTool::new(Arc::clone(&ctx))),
        Box::new(SendMessageTool::new(Arc::clone(&ctx))),
        Box::new(super::patch_file::PatchFileTool),
    ];

    // Load script plugins from ~/.nanobot/tools/ — no restart needed after adding a plugin,
    // tools are re-scanned on each build_tools() call (i.e. each new message).
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let tools_dir = std::path::Path::new(&home).join(".nanobot/tools");
    tools.extend(super::script_tool::load_script_tools(&tools_dir));

    let skills = load_skills();
    let skill_index = if skills.is_empty() {
        String::new()
    } else {
        let rendered = format_skill_index(&skills);
        tools.push(Box::new(SkillReadTool::new(skills)));
        rendered
    };

    if let Some(mcp) = ctx.mcp() {
        tools.extend(
            mcp.snapshot_tools()
                .into_iter()
                .map(|t| Box::new(SharedTool(t)) as Box<dyn Tool>),
        );
    }

    // `spawn` needs a session key to know where to announce its subagent's
    // result — skip it for hosts/calls that don't have one (e.g. a bare
    // maintenance run) rather than offer a tool with nowhere to report back.
    if let (Some(manager), Some(key)) = (ctx.subagents(), session_key) {
        let origin_chat_id = key.find(':').map(|i| &key[i + 1..]).unwrap_or(key);
        tools.push(Box::new(SpawnTool::new(
            Arc::clone(manager),
            channel_name,
            origin_chat_id,
        )));
    }

    BuiltTools { tools, skill_index }
}

/// Convert a tool list to API-level definitions for the LLM request.
pub fn tool_definitions(tools: &[Box<dyn Tool>]) -> Vec<ToolDefinition> {
    to_definitions(tools)
}
