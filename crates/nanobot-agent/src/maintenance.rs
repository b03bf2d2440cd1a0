//! Auto-memory-integration and long-term-memory-maintenance background jobs
//! (C10) — LLM-driven folding of recent chat and daily notes into long-term
//! memory, plus periodic summarization once memory crosses its read caps.
//!
//! Grounded on `original_source/nanobot/services/auto_memory_integration.py`
//! and `memory_maintenance.py`. Both run as `system:`-named scheduler jobs
//! seeded at startup (see `nanobot-gateway::main`); `nanobot-gateway`'s
//! reminder dispatcher calls [`handle_system_event`] whenever one fires and
//! persists the returned state back onto the job.

use chrono::Timelike;
use serde_json::{json, Value};
use tracing::{info, warn};

use nanobot_memory::manager::MemoryManager;
use nanobot_sessions::SessionManager;

use crate::provider::{ChatRequest, Message, ProviderError, Role};
use crate::runtime::AgentRuntime;

/// Scope under which the main assistant's own long-term memory lives —
/// matches the convention already used by `MemoryManager`'s own tests
/// (`"global"`, no `agent_id`), as opposed to subagents' per-task `"agent"`
/// scope.
const GLOBAL_SCOPE: &str = "global";

const AUTO_INTEGRATE_SYSTEM_PROMPT: &str = "You are a memory-extraction assistant for a \
personal AI assistant. Read the recent conversation transcript below and decide which facts, \
preferences, or ongoing commitments are worth keeping in long-term memory permanently — \
durable details about the user's life, projects, or preferences, not small talk or one-off \
requests. Reply with one fact per line formatted as `- <fact>`, or the single word `none` if \
nothing in the transcript is worth keeping.";

const DAILY_EXTRACT_SYSTEM_PROMPT: &str = "You are a memory-extraction assistant for a personal \
AI assistant. Read the following day's activity notes and extract only durable facts worth \
keeping forever. Reply with one fact per line formatted as `- <fact>`, or the single word \
`none` if nothing is worth keeping.";

const SUMMARIZE_SYSTEM_PROMPT: &str = "You are a memory-curation assistant for a personal AI \
assistant. Rewrite the long-term memory entries below into a smaller, deduplicated set that \
still preserves every distinct fact and, for each, its earliest known date. Reply with one \
line per fact formatted exactly as `- [YYYY-MM-DD] <fact>`.";

/// Mutable state a `system:memory_maintenance` job carries between fires,
/// round-tripped through the job's own `jobs.action` JSON so a restart or
/// clock skew can't double-run the once-daily merge.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct MaintenanceState {
    #[serde(default)]
    last_daily_run_date: Option<String>,
}

/// Dispatch a fired `system:*` job by its event name, returning the
/// (possibly updated) state JSON to persist back onto the job, plus whether
/// the event ran to completion — the caller persists this onto the job's
/// `last_status`/`last_error` via `SchedulerHandle::record_result`, per
/// spec.md §4.9 and §7's `scheduler_job_failed` row.
pub async fn handle_system_event(
    agent: &AgentRuntime,
    sessions: &SessionManager,
    memory: &MemoryManager,
    event: &str,
    state: Value,
) -> (Value, Result<(), String>) {
    match event {
        "memory_auto_integrate" => {
            let outcome = run_auto_integrate(agent, sessions, memory).await;
            if let Err(ref e) = outcome {
                warn!("auto-memory-integration failed: {e}");
            }
            (state, outcome.map_err(|e| e.to_string()))
        }
        "memory_maintenance" => {
            let (new_state, outcome) = run_maintenance_tick(agent, memory, state).await;
            (new_state, outcome)
        }
        other => {
            warn!(event = other, "unknown system event, ignoring");
            (state, Err(format!("unknown system event: {other}")))
        }
    }
}

/// Pull the lookback window of recent user/assistant turns, ask the LLM
/// which facts are durable, dedupe against existing long-term memory by
/// substring containment, and append the survivors.
async fn run_auto_integrate(
    agent: &AgentRuntime,
    sessions: &SessionManager,
    memory: &MemoryManager,
) -> Result<(), ProviderError> {
    let cfg = &agent.config().memory_maintenance;
    let since = (chrono::Utc::now() - chrono::Duration::minutes(cfg.lookback_minutes)).to_rfc3339();

    let rows = match sessions.recent_messages_since(&since, cfg.max_messages) {
        Ok(r) => r,
        Err(e) => {
            warn!("auto-integration: failed to load recent messages: {e}");
            return Ok(());
        }
    };
    if rows.is_empty() {
        return Ok(());
    }

    let transcript = rows
        .iter()
        .map(|(_, msg)| {
            let content: String = if msg.content.chars().count() > 500 {
                msg.content.chars().take(500).collect()
            } else {
                msg.content.clone()
            };
            format!("{}: {}", msg.role, content)
        })
        .collect::<Vec<_>>()
        .join("\n");

    let request = raw_request(agent.get_model().await, AUTO_INTEGRATE_SYSTEM_PROMPT, transcript);
    let response = agent.provider().send(&request).await?;
    let candidates = parse_fact_lines(&response.content);
    if candidates.is_empty() {
        return Ok(());
    }

    let existing = memory
        .get_memories_for_summarize(GLOBAL_SCOPE, None)
        .unwrap_or_default();
    let today = chrono::Local::now().format("%Y-%m-%d").to_string();
    let fresh: Vec<(String, String)> = candidates
        .into_iter()
        .filter(|fact| !existing.iter().any(|(_, content)| content.contains(fact.as_str())))
        .map(|fact| (today.clone(), fact))
        .collect();

    if fresh.is_empty() {
        return Ok(());
    }
    info!(count = fresh.len(), "auto-integration appending new long-term memories");
    if let Err(e) = memory.append_memories(GLOBAL_SCOPE, None, &fresh, Some("auto_integrate")) {
        warn!("auto-integration: failed to append memories: {e}");
    }
    Ok(())
}

/// Run the daily-merge (once per local day, at/after 00:05) and
/// over-threshold summarization checks. Returns the first error encountered
/// (if any) alongside the updated state — each sub-step still runs
/// best-effort (a daily-merge failure doesn't skip the summarize check),
/// but the tick as a whole is reported as failed so `last_status`/
/// `last_error` reflect it.
async fn run_maintenance_tick(
    agent: &AgentRuntime,
    memory: &MemoryManager,
    state: Value,
) -> (Value, Result<(), String>) {
    let mut st: MaintenanceState = serde_json::from_value(state).unwrap_or_default();
    let now = chrono::Local::now();
    let today = now.format("%Y-%m-%d").to_string();
    let mut first_error: Option<String> = None;

    if now.hour() == 0 && now.minute() >= 5 && st.last_daily_run_date.as_deref() != Some(today.as_str()) {
        match run_daily_merge(agent, memory, &today).await {
            Err(e) => {
                warn!("daily memory merge failed: {e}");
                first_error.get_or_insert_with(|| e.to_string());
            }
            Ok(()) => st.last_daily_run_date = Some(today.clone()),
        }
    }

    match memory.needs_summarize(GLOBAL_SCOPE, None) {
        Ok(true) => {
            if let Err(e) = run_summarize(agent, memory).await {
                warn!("memory summarization failed: {e}");
                first_error.get_or_insert_with(|| e.to_string());
            }
        }
        Ok(false) => {}
        Err(e) => {
            warn!("failed to check memory summarization threshold: {e}");
            first_error.get_or_insert_with(|| e.to_string());
        }
    }

    let new_state = serde_json::to_value(&st).unwrap_or_else(|_| json!({}));
    (new_state, first_error.map_or(Ok(()), Err))
}

/// Fold every unprocessed daily note strictly before `today` into long-term
/// memory via a dedicated extraction prompt, then mark each processed.
async fn run_daily_merge(agent: &AgentRuntime, memory: &MemoryManager, today: &str) -> Result<(), ProviderError> {
    let notes = match memory.get_unprocessed_daily_notes(GLOBAL_SCOPE, None, today) {
        Ok(n) => n,
        Err(e) => {
            warn!("daily merge: failed to load daily notes: {e}");
            return Ok(());
        }
    };

    for note in notes {
        if !note.content.trim().is_empty() {
            let request = raw_request(
                agent.get_model().await,
                DAILY_EXTRACT_SYSTEM_PROMPT,
                note.content.clone(),
            );
            let response = agent.provider().send(&request).await?;
            let facts = parse_fact_lines(&response.content);
            if !facts.is_empty() {
                let entries: Vec<(String, String)> =
                    facts.into_iter().map(|f| (note.note_date.clone(), f)).collect();
                if let Err(e) = memory.append_memories(GLOBAL_SCOPE, None, &entries, Some("daily_merge")) {
                    warn!("daily merge: failed to append memories: {e}");
                }
            }
        }
        if let Err(e) = memory.mark_daily_note_processed(GLOBAL_SCOPE, None, &note.note_date) {
            warn!("daily merge: failed to mark note processed: {e}");
        }
    }
    Ok(())
}

/// Rewrite the whole long-term memory store into a smaller, deduplicated set
/// once it has crossed the read thresholds.
async fn run_summarize(agent: &AgentRuntime, memory: &MemoryManager) -> Result<(), ProviderError> {
    let entries = match memory.get_memories_for_summarize(GLOBAL_SCOPE, None) {
        Ok(e) => e,
        Err(e) => {
            warn!("summarize: failed to load memory entries: {e}");
            return Ok(());
        }
    };
    if entries.is_empty() {
        return Ok(());
    }

    let rendered = nanobot_memory::format_entries(&entries);
    let request = raw_request(agent.get_model().await, SUMMARIZE_SYSTEM_PROMPT, rendered);
    let response = agent.provider().send(&request).await?;
    let rewritten = nanobot_memory::parse_memory_entries(&response.content);
    if rewritten.is_empty() {
        warn!("summarize: LLM returned no parseable entries, leaving memory untouched");
        return Ok(());
    }

    if let Err(e) = memory.replace_memories(GLOBAL_SCOPE, None, &rewritten) {
        warn!("summarize: failed to replace memory entries: {e}");
        return Ok(());
    }
    info!(before = entries.len(), after = rewritten.len(), "long-term memory summarized");
    Ok(())
}

/// Build a tool-less, single-turn [`ChatRequest`] — every C10 job talks to
/// the LLM directly (no tool loop), exactly like the subagent runner's raw
/// calls.
fn raw_request(model: String, system: &str, user_content: String) -> ChatRequest {
    ChatRequest {
        model,
        system: system.to_string(),
        system_prompt: None,
        messages: vec![Message {
            role: Role::User,
            content: user_content,
        }],
        max_tokens: 2048,
        stream: false,
        thinking: None,
        tools: Vec::new(),
        raw_messages: None,
    }
}

/// Parse `- <fact>` lines out of an LLM response; a bare `none` (or empty
/// response) means nothing to extract.
fn parse_fact_lines(text: &str) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
        return Vec::new();
    }
    trimmed
        .lines()
        .filter_map(|line| line.trim().strip_prefix('-'))
        .map(|fact| fact.trim().to_string())
        .filter(|fact| !fact.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_fact_lines_handles_none_sentinel() {
        assert!(parse_fact_lines("none").is_empty());
        assert!(parse_fact_lines("None\n").is_empty());
        assert!(parse_fact_lines("").is_empty());
    }

    #[test]
    fn parse_fact_lines_extracts_dash_prefixed_facts() {
        let facts = parse_fact_lines("- User prefers dark mode\n- User's birthday is March 3rd\n");
        assert_eq!(
            facts,
            vec!["User prefers dark mode".to_string(), "User's birthday is March 3rd".to_string()]
        );
    }

    #[test]
    fn parse_fact_lines_ignores_lines_without_dash() {
        let facts = parse_fact_lines("here is some preamble\n- actual fact");
        assert_eq!(facts, vec!["actual fact".to_string()]);
    }
}
