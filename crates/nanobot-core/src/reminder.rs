//! Reminder delivery types — shared between the scheduler engine and all channel adapters.

use serde::{Deserialize, Serialize};

/// Distinguishes a reminder fired as a plain notification from one that
/// should re-enter the agent loop (`payload.kind` in the scheduler's
/// `agent_turn | system_event | calendar_reminder` contract).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReminderKind {
    /// Deliver `message` (plus any `bash_command` output) straight to the
    /// channel — the original, static reminder behavior.
    #[default]
    CalendarReminder,
    /// Publish `message` as a synthetic inbound message on the origin
    /// session instead, so the LLM processes it like a real user turn
    /// before anything is delivered (scenario: a proactive check-in).
    AgentTurn,
}

/// Stored as a JSON string in the `jobs.action` column.
///
/// Created by `ReminderTool` when the user asks for a reminder; parsed by the
/// delivery router in `nanobot-gateway` when the scheduler fires the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderAction {
    /// Delivery channel: `"discord"` or `"ws"`.
    pub channel: String,
    /// Discord channel ID (`channel_id.get()` from serenity). `None` for WS broadcast.
    pub channel_id: Option<u64>,
    /// Text to deliver (prepended before bash output if `bash_command` is set).
    pub message: String,
    /// Optional bare image URL; Discord auto-embeds it below the text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Optional shell command to execute at fire-time; stdout is appended to `message`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bash_command: Option<String>,
    /// Session key for HTTP/terminal notification delivery.
    /// Used by the delivery router to queue notifications for the correct session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    /// Static delivery (default) vs. re-entering the agent loop.
    #[serde(default)]
    pub kind: ReminderKind,
}

/// Payload for the two system maintenance jobs seeded at startup
/// (`system:memory_auto_integrate`, `system:memory_maintenance`).
///
/// Distinguished from [`ReminderAction`] by the job's `name` column (it's
/// prefixed `"system:"`) rather than by a tag on the payload itself, since
/// these jobs are never created through `ReminderTool`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEventAction {
    /// `"memory_auto_integrate"` or `"memory_maintenance"`.
    pub event: String,
    /// Mutable state the handler rewrites into this job's own `jobs.action`
    /// column after each run (e.g. `last_daily_run_date`), so a restart or
    /// clock skew can't double-run the once-daily merge.
    #[serde(default)]
    pub state: serde_json::Value,
}

/// Parsed and ready-to-send reminder; passed from the delivery router to the
/// channel-specific delivery task (e.g. `run_discord_delivery`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderDelivery {
    /// Originating job ID — used for logging.
    pub job_id: String,
    /// Discord channel ID, if the delivery target is Discord.
    pub channel_id: Option<u64>,
    /// Text to send.
    pub message: String,
    /// Optional image URL appended to the message.
    pub image_url: Option<String>,
}
