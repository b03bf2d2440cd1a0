//! Subagent Manager — background task delegation.
//!
//! The main agent can delegate a task to a subagent via the `spawn` tool.
//! Each subagent runs as a `tokio::spawn` task sharing the parent's LLM
//! provider but with an isolated, ephemeral message history and a tool set
//! restricted to its template's `allowed_tools`. On completion it publishes
//! its result back as a synthetic `"system"`-channel inbound message so the
//! main agent loop can summarize it for the user.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine;
use nanobot_channels::{InboundMessage, InboundMetadata};
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::pipeline::context::MessageContext;
use crate::provider::{ChatRequest, Message, ProviderError, Role};
use crate::tools::tool_loop::{self, LoopLimits};
use crate::tools::{Tool, ToolResult};

/// Bound on LLM ↔ tool round trips for a single subagent task. Mirrors the
/// main agent's default loop limit but fixed rather than configurable — a
/// subagent that needs more than 15 turns should be split into smaller tasks.
const SUBAGENT_MAX_ITERATIONS: usize = 15;

/// A named subagent persona: its allowed tools, behavioral rules, and the
/// system prompt template those rules are spliced into.
///
/// `system_prompt_template` supports three placeholders: `{task}`,
/// `{all_rules}`, `{workspace}`.
pub struct SubagentTemplate {
    pub name: &'static str,
    pub description: &'static str,
    pub allowed_tools: &'static [&'static str],
    pub rules: &'static [&'static str],
    pub system_prompt_template: &'static str,
    /// `vision`/`voice` templates pull the triggering message's media into
    /// the subagent's first turn when the caller set `attach_media: true`.
    pub attach_media: bool,
}

const MINIMAL_PROMPT: &str = "# Subagent\n\nYou are a subagent spawned by the main agent to complete a specific task.\n\n## Your Task\n{task}\n\n## Rules\n{all_rules}\n\n## What You Cannot Do\n- Send messages directly to users\n- Spawn other subagents\n- Access the main agent's conversation history\n\n## Workspace\n{workspace}\n\nWhen you have completed the task, provide a clear summary of your findings or actions.";

const CODER_PROMPT: &str = "# Coder Subagent\n\nYou are a professional software developer subagent.\n\n## Your Task\n{task}\n\n## Rules\n{all_rules}\n\n## Workspace\n{workspace}\n\nWhen complete, describe what was done, what files were changed, and any important notes.";

const RESEARCHER_PROMPT: &str = "# Researcher Subagent\n\nYou are a research assistant subagent.\n\n## Your Task\n{task}\n\n## Rules\n{all_rules}\n\n## Workspace\n{workspace}\n\nWhen complete, provide a well-organized summary of your research findings, citing sources where you found them.";

const ANALYST_PROMPT: &str = "# Analyst Subagent\n\nYou are a data analyst subagent.\n\n## Your Task\n{task}\n\n## Rules\n{all_rules}\n\n## Workspace\n{workspace}\n\nWhen complete, provide a comprehensive analysis with clear conclusions and any caveats.";

const CLAUDE_CODER_PROMPT: &str = "# Claude-Style Coder Subagent\n\nYou are a professional software developer subagent, held to the same standard as a senior engineer reviewing your own diff before submitting it.\n\n## Your Task\n{task}\n\n## Rules\n{all_rules}\n\n## Workspace\n{workspace}\n\nWhen complete, describe what was done, what files were changed, and any important notes for the user.";

const VISION_PROMPT: &str = "# Vision Subagent\n\nYou are a vision-enabled subagent specialized in analyzing and describing images.\n\n## Your Task\n{task}\n\n## Rules\n{all_rules}\n\n## Workspace\n{workspace}\n\nWhen complete, provide a comprehensive description of the image: subjects, background, any visible text, colors and style, and anything notable.";

const VOICE_PROMPT: &str = "# Voice Subagent\n\nYou are a subagent specialized in transcribing and summarizing spoken audio.\n\n## Your Task\n{task}\n\n## Rules\n{all_rules}\n\n## Workspace\n{workspace}\n\nWhen complete, provide the transcript (or your best reconstruction of it) followed by a brief summary.";

/// Built-in templates, keyed by name. Mirrors the catalogue described in
/// §[C8]: `minimal`, `coder`, `researcher`, `analyst`, `claude-coder`,
/// `vision`, `voice`.
pub const BUILTIN_TEMPLATES: &[SubagentTemplate] = &[
    SubagentTemplate {
        name: "minimal",
        description: "Quick, simple tasks",
        allowed_tools: &["read_file", "write_file", "list_files", "search_files", "execute_command"],
        rules: &[
            "Stay focused - complete only the assigned task",
            "Be concise in your response",
            "Complete the task thoroughly",
        ],
        system_prompt_template: MINIMAL_PROMPT,
        attach_media: false,
    },
    SubagentTemplate {
        name: "coder",
        description: "Code writing and editing tasks",
        allowed_tools: &["read_file", "write_file", "patch_file", "list_files", "search_files", "execute_command"],
        rules: &[
            "Follow the project's existing code conventions and style",
            "Write clean, readable, and well-documented code",
            "Include appropriate error handling",
            "Keep functions focused and single-purpose",
        ],
        system_prompt_template: CODER_PROMPT,
        attach_media: false,
    },
    SubagentTemplate {
        name: "researcher",
        description: "Information gathering and research",
        allowed_tools: &["read_file", "search_files", "execute_command"],
        rules: &[
            "Provide accurate, verified information",
            "Distinguish between facts and opinions",
            "Avoid speculation without evidence",
            "Be thorough",
        ],
        system_prompt_template: RESEARCHER_PROMPT,
        attach_media: false,
    },
    SubagentTemplate {
        name: "analyst",
        description: "Data analysis tasks",
        allowed_tools: &["read_file", "write_file", "execute_command", "search_files"],
        rules: &[
            "Base conclusions on data and evidence",
            "Provide clear, actionable insights",
            "Present data in readable formats",
            "Acknowledge data limitations",
        ],
        system_prompt_template: ANALYST_PROMPT,
        attach_media: false,
    },
    SubagentTemplate {
        name: "claude-coder",
        description: "Code writing tasks held to a stricter review bar",
        allowed_tools: &["read_file", "write_file", "patch_file", "list_files", "search_files", "execute_command"],
        rules: &[
            "Follow the project's existing code conventions and style",
            "Write clean, readable, and well-documented code",
            "Run tests or linters if available to validate correctness",
            "Keep functions focused and single-purpose",
        ],
        system_prompt_template: CLAUDE_CODER_PROMPT,
        attach_media: false,
    },
    SubagentTemplate {
        name: "vision",
        description: "Image recognition and analysis",
        allowed_tools: &["read_file"],
        rules: &[
            "Analyze images thoroughly and describe all visual elements",
            "Extract text from images (OCR) when present",
            "If an image is unclear or unrecognizable, state that clearly",
        ],
        system_prompt_template: VISION_PROMPT,
        attach_media: true,
    },
    SubagentTemplate {
        name: "voice",
        description: "Audio transcription",
        allowed_tools: &["read_file"],
        rules: &[
            "Transcribe spoken content as accurately as possible",
            "Note when portions are inaudible or uncertain",
        ],
        system_prompt_template: VOICE_PROMPT,
        attach_media: true,
    },
];

pub fn get_template(name: &str) -> &'static SubagentTemplate {
    BUILTIN_TEMPLATES
        .iter()
        .find(|t| t.name == name)
        .unwrap_or(&BUILTIN_TEMPLATES[0])
}

/// Metadata about a currently running subagent task, kept only long enough
/// to support cancellation and `get_subagent_results`-style introspection.
#[derive(Clone)]
struct RunningTask {
    label: String,
    abort: AbortHandle,
}

/// Manages the lifecycle of background subagent tasks for one host context.
///
/// Generic over `C: MessageContext` the same way [`crate::tools::build::build_tools`]
/// is, so it can restrict a subagent to the same filesystem/shell tools the
/// main agent uses without duplicating their implementations.
pub struct SubagentManager<C: MessageContext + 'static> {
    ctx: Arc<C>,
    workspace: PathBuf,
    /// Caps the number of subagents running concurrently across the whole
    /// host — acquired before `tokio::spawn`, released when the permit drops
    /// at the end of `run_subagent`.
    concurrency: Arc<Semaphore>,
    running: std::sync::Mutex<HashMap<String, RunningTask>>,
}

impl<C: MessageContext + 'static> SubagentManager<C> {
    pub fn new(ctx: Arc<C>, workspace: PathBuf, max_concurrent: usize) -> Self {
        Self {
            ctx,
            workspace,
            concurrency: Arc::new(Semaphore::new(max_concurrent.max(1))),
            running: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Number of subagents currently executing.
    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap().len()
    }

    /// Abort every running subagent task. Called on shutdown.
    pub fn abort_all(&self) {
        let tasks = self.running.lock().unwrap();
        for (id, task) in tasks.iter() {
            debug!(task_id = %id, label = %task.label, "aborting subagent on shutdown");
            task.abort.abort();
        }
    }

    /// Spawn a subagent to execute `task` in the background and return an
    /// immediate confirmation string (the work itself runs detached).
    ///
    /// `session_id`, when set and matching a prior subagent's task id, is
    /// currently used only as that reused task id — per-template message
    /// history is otherwise ephemeral and not persisted across spawns.
    /// `origin_chat_id` is the full session key the triggering turn ran
    /// under (not a platform-native chat id) — it's what lets the announce
    /// re-enter the same conversation's history. `channel_id`, when set, is
    /// the platform-native id (Discord channel, Telegram chat) used for
    /// direct delivery instead of falling back to polled notifications.
    #[allow(clippy::too_many_arguments)]
    pub async fn spawn(
        self: &Arc<Self>,
        task: String,
        label: Option<String>,
        template_name: &str,
        session_id: Option<String>,
        enable_memory: bool,
        origin_channel: String,
        origin_chat_id: String,
        media: Vec<PathBuf>,
        batch_id: Option<String>,
        channel_id: Option<u64>,
    ) -> String {
        let task_id = session_id.clone().unwrap_or_else(generate_task_id);
        let display_label = label.unwrap_or_else(|| truncate_label(&task));
        let template = get_template(template_name);

        let permit = match Arc::clone(&self.concurrency).try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                return format!(
                    "Subagent [{display_label}] could not start: the concurrent-subagent limit is reached. Try again once a running task finishes."
                );
            }
        };

        let mgr = Arc::clone(self);
        let tid = task_id.clone();
        let lbl = display_label.clone();
        let t = task.clone();
        let oc = origin_channel.clone();
        let ocid = origin_chat_id.clone();
        let batch = batch_id.clone();

        let join = tokio::spawn(async move {
            let _permit = permit;
            let outcome = mgr
                .run_subagent(&tid, &t, template, &media, enable_memory)
                .await;
            let (status, content) = match outcome {
                Ok(result) => ("ok", result),
                Err(e) => {
                    error!(task_id = %tid, error = %e, "subagent task failed");
                    ("error", format!("Error: {e}"))
                }
            };
            mgr.announce_result(&tid, &lbl, &t, &content, status, &oc, &ocid, batch.as_deref(), channel_id);
            mgr.running.lock().unwrap().remove(&tid);
        });

        self.running.lock().unwrap().insert(
            task_id.clone(),
            RunningTask {
                label: display_label.clone(),
                abort: join.abort_handle(),
            },
        );

        format!(
            "Subagent [{display_label}] started (id: {task_id}). I'll notify you when it completes."
        )
    }

    /// Run the subagent's own tool-calling loop to completion or the
    /// iteration cap, whichever comes first.
    async fn run_subagent(
        &self,
        task_id: &str,
        task: &str,
        template: &SubagentTemplate,
        media: &[PathBuf],
        enable_memory: bool,
    ) -> Result<String, ProviderError> {
        info!(task_id, template = template.name, "subagent starting");

        let tools = build_restricted_tools(Arc::clone(&self.ctx), template.allowed_tools);
        let tool_defs = crate::tools::build::tool_definitions(&tools);

        let rules_text = template
            .rules
            .iter()
            .enumerate()
            .map(|(i, r)| format!("{}. {r}", i + 1))
            .collect::<Vec<_>>()
            .join("\n");
        let system = template
            .system_prompt_template
            .replace("{task}", task)
            .replace("{all_rules}", &rules_text)
            .replace("{workspace}", &self.workspace.display().to_string());

        let raw_messages = if template.attach_media && !media.is_empty() {
            Some(build_media_turn(task, media))
        } else {
            None
        };

        let request = ChatRequest {
            model: self.ctx.agent().get_model().await,
            system: system.clone(),
            system_prompt: None,
            messages: if raw_messages.is_some() {
                Vec::new()
            } else {
                vec![
                    Message {
                        role: Role::User,
                        content: task.to_string(),
                    },
                ]
            },
            max_tokens: 4096,
            stream: false,
            thinking: None,
            tools: tool_defs,
            raw_messages,
        };

        let limits = LoopLimits {
            max_iterations: SUBAGENT_MAX_ITERATIONS,
            max_execution_time_secs: 0,
        };
        let outcome =
            tool_loop::run_tool_loop(self.ctx.agent().provider(), request, &tools, None, limits, None)
                .await?;
        let result = if outcome.response.content.is_empty() {
            "Task completed but no final response was generated.".to_string()
        } else {
            outcome.response.content
        };

        if enable_memory {
            let today = chrono::Local::now().format("%Y-%m-%d").to_string();
            let truncated: String = if result.chars().count() > 500 {
                format!("{}...", result.chars().take(500).collect::<String>())
            } else {
                result.clone()
            };
            let note = format!("Task: {task}\nResult: {truncated}");
            if let Err(e) = self
                .ctx
                .memory()
                .append_daily_note("agent", Some(task_id), &today, &note)
            {
                warn!(task_id, error = %e, "failed to append subagent daily note");
            }
        }

        info!(task_id, result_len = result.len(), "subagent finished");
        Ok(result)
    }

    /// Publish the subagent's outcome back onto the bus as a synthetic
    /// `"system"` inbound message, asking the main agent to summarize it
    /// briefly without mentioning subagent/task-id internals.
    #[allow(clippy::too_many_arguments)]
    fn announce_result(
        &self,
        task_id: &str,
        label: &str,
        task: &str,
        result: &str,
        status: &str,
        origin_channel: &str,
        origin_chat_id: &str,
        batch_id: Option<&str>,
        channel_id: Option<u64>,
    ) {
        let status_text = if status == "ok" {
            "completed successfully"
        } else {
            "failed"
        };
        let batch_note = batch_id
            .map(|b| format!(" (batch {b})"))
            .unwrap_or_default();
        let content = format!(
            "[Subagent '{label}' {status_text}{batch_note}]\n\nTask: {task}\n\nResult:\n{result}\n\nSummarize this naturally for the user. Keep it brief (1-2 sentences). Do not mention technical details like \"subagent\" or task IDs."
        );

        let chat_id = InboundMessage::encode_system_chat_id(origin_channel, origin_chat_id);
        let metadata = InboundMetadata {
            extra: serde_json::json!({ "channel_id": channel_id }),
            ..Default::default()
        };
        let msg = InboundMessage {
            channel: "system".to_string(),
            sender_id: "subagent".to_string(),
            sender_name: None,
            chat_id,
            content,
            media: Vec::new(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            raw_payload: None,
            metadata,
        };

        info!(task_id, origin_channel, origin_chat_id, "announcing subagent result");
        // The announce is delivered through whatever synthetic-message
        // intake the host wires up (the gateway's own dispatcher); this
        // manager only needs to hand the message off, never route it.
        self.ctx.announce_system_message(msg);
    }
}

fn truncate_label(task: &str) -> String {
    if task.chars().count() > 30 {
        format!("{}…", task.chars().take(30).collect::<String>())
    } else {
        task.to_string()
    }
}

fn generate_task_id() -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    let mixed = nanos
        .wrapping_mul(6364136223846793005)
        .wrapping_add(count as u64);
    format!("{:08x}", (mixed >> 32) as u32)
}

/// Build a `Vec<Box<dyn Tool>>` containing only the tools named in `allowed`,
/// constructed the same way [`crate::tools::build::build_tools`] does for
/// the main agent. Unknown names are skipped rather than erroring, so an
/// admin renaming a tool doesn't brick every template referencing it.
fn build_restricted_tools<C: MessageContext + 'static>(
    ctx: Arc<C>,
    allowed: &[&str],
) -> Vec<Box<dyn Tool>> {
    let mut tools: Vec<Box<dyn Tool>> = Vec::new();
    for name in allowed {
        match *name {
            "read_file" => tools.push(Box::new(crate::tools::read_file::ReadFileTool)),
            "write_file" => tools.push(Box::new(crate::tools::write_file::WriteFileTool)),
            "patch_file" => tools.push(Box::new(crate::tools::patch_file::PatchFileTool)),
            "list_files" => tools.push(Box::new(crate::tools::list_files::ListFilesTool)),
            "search_files" => tools.push(Box::new(crate::tools::search_files::SearchFilesTool)),
            "execute_command" => tools.push(Box::new(
                crate::tools::execute_command::ExecuteCommandTool::new(Arc::clone(&ctx)),
            )),
            other => warn!(tool = other, "subagent template references unknown tool, skipping"),
        }
    }
    tools
}

/// Build the raw content-block user turn carrying `media` as base64 image
/// blocks alongside the task text, Anthropic content-block style.
fn build_media_turn(task: &str, media: &[PathBuf]) -> Vec<serde_json::Value> {
    let mut parts: Vec<serde_json::Value> = vec![serde_json::json!({
        "type": "text",
        "text": task,
    })];

    for path in media {
        match std::fs::read(path) {
            Ok(bytes) => {
                let b64 = base64::engine::general_purpose::STANDARD.encode(&bytes);
                let media_type = guess_media_type(path);
                parts.push(serde_json::json!({
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "media_type": media_type,
                        "data": b64,
                    }
                }));
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read subagent media attachment");
                parts.push(serde_json::json!({
                    "type": "text",
                    "text": format!("[attachment '{}' could not be read: {}]", path.display(), e),
                }));
            }
        }
    }

    vec![serde_json::json!({ "role": "user", "content": parts })]
}

fn guess_media_type(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("").to_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "image/png",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_template_falls_back_to_minimal() {
        let t = get_template("does-not-exist");
        assert_eq!(t.name, "minimal");
    }

    #[test]
    fn all_builtin_templates_resolve() {
        for name in ["minimal", "coder", "researcher", "analyst", "claude-coder", "vision", "voice"] {
            assert_eq!(get_template(name).name, name);
        }
    }

    #[test]
    fn vision_and_voice_attach_media() {
        assert!(get_template("vision").attach_media);
        assert!(get_template("voice").attach_media);
        assert!(!get_template("minimal").attach_media);
    }

    #[test]
    fn truncate_label_short_task_unchanged() {
        assert_eq!(truncate_label("short task"), "short task");
    }

    #[test]
    fn truncate_label_long_task_truncated() {
        let long = "A very long task description that exceeds thirty characters easily";
        let label = truncate_label(long);
        assert!(label.ends_with('…'));
        assert!(label.chars().count() <= 31);
    }

    #[test]
    fn generate_task_id_is_distinct_hex() {
        let a = generate_task_id();
        let b = generate_task_id();
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn guess_media_type_by_extension() {
        assert_eq!(guess_media_type(std::path::Path::new("x.jpg")), "image/jpeg");
        assert_eq!(guess_media_type(std::path::Path::new("x.PNG")), "image/png");
        assert_eq!(guess_media_type(std::path::Path::new("x.webp")), "image/webp");
    }
}
