use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Progress notification emitted by the agent loop while a turn is in
/// flight (thinking / tool start / tool end). Delivered through
/// `InboundMetadata::progress` so a channel adapter can render "typing…" or
/// streamed partial output without the agent loop knowing anything about
/// the target platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    Thinking,
    ToolStart { name: String },
    ToolEnd { name: String, result: String },
}

/// Callback a channel adapter installs to receive [`ProgressEvent`]s for a
/// single inbound message. Invocation errors (the adapter's send failing)
/// are caught and logged at `debug` by the caller — a broken progress sink
/// must never abort the turn it is reporting on.
pub type ProgressSink = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Out-of-band data accompanying an [`InboundMessage`] that doesn't belong
/// in `content` itself.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct InboundMetadata {
    /// Sink for progress events, if the originating channel wants them.
    /// Not serializable — always `None` after a round-trip through JSON;
    /// set directly when constructing in-process.
    #[serde(skip)]
    pub progress: Option<ProgressSink>,

    /// Set when this message is itself answering a pending decision/prompt
    /// the agent raised earlier in the same chat (e.g. a confirmation).
    #[serde(default)]
    pub pending_decision: bool,

    /// Free-form platform-specific extras that don't warrant their own field.
    #[serde(default)]
    pub extra: serde_json::Value,
}

impl std::fmt::Debug for InboundMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundMetadata")
            .field("progress", &self.progress.is_some())
            .field("pending_decision", &self.pending_decision)
            .field("extra", &self.extra)
            .finish()
    }
}

/// A message received from an external channel (Telegram, Discord, WebChat, …).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Logical channel name (e.g. "telegram", "discord"). The reserved name
    /// `"system"` carries synthetic messages (scheduler fires, subagent
    /// announce-back) whose `chat_id` encodes the originating
    /// `"<channel>:<chatId>"` pair — see [`encode_system_chat_id`].
    pub channel: String,

    /// Platform-native identifier for the sender (chat ID, user ID, …).
    pub sender_id: String,

    /// Human-readable display name for the sender, if available.
    pub sender_name: Option<String>,

    /// Chat/conversation identifier this message belongs to. For most
    /// channels this is the same value as `sender_id` (a 1:1 DM); kept as
    /// a distinct field for group chats where sender and chat differ.
    pub chat_id: String,

    /// Plain text content of the message.
    pub content: String,

    /// Local filesystem paths to media attached to this message (images,
    /// voice notes, …) already downloaded by the channel adapter.
    #[serde(default)]
    pub media: Vec<PathBuf>,

    /// ISO-8601 timestamp of when the message was received.
    pub timestamp: String,

    /// Full raw payload from the platform for cases that need extra fields.
    pub raw_payload: Option<serde_json::Value>,

    /// Out-of-band metadata (progress sink, pending-decision flag, extras).
    #[serde(default)]
    pub metadata: InboundMetadata,
}

impl InboundMessage {
    /// Build the `"system"` channel's encoded chat id: `"<channel>:<chatId>"`.
    pub fn encode_system_chat_id(origin_channel: &str, origin_chat_id: &str) -> String {
        format!("{origin_channel}:{origin_chat_id}")
    }

    /// Split a `"system"` channel's chat id back into `(channel, chatId)`.
    /// Splits on the first colon only, so a chat id that itself contains a
    /// colon (as `system` chat ids always do) round-trips correctly.
    pub fn decode_system_chat_id(encoded: &str) -> Option<(&str, &str)> {
        let pos = encoded.find(':')?;
        Some((&encoded[..pos], &encoded[pos + 1..]))
    }
}

/// A message to be delivered to an external channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Logical channel name (e.g. "telegram", "discord").
    pub channel: String,

    /// Platform-native identifier for the recipient (chat ID, user ID, …).
    pub recipient_id: String,

    /// Chat/conversation identifier (mirrors `InboundMessage::chat_id`).
    #[serde(default)]
    pub chat_id: String,

    /// Content to deliver.
    pub content: String,

    /// Formatting hint for the target platform.
    pub format: MessageFormat,

    /// Free-form delivery metadata (e.g. an image URL, a reply-to id).
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Formatting hint for outbound message content.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageFormat {
    /// Raw text with no special markup.
    #[default]
    PlainText,

    /// Markdown as understood by the target platform.
    Markdown,

    /// HTML markup (supported by Telegram, some web clients).
    Html,
}

/// Runtime connection state of a channel adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    /// Fully connected and ready to send/receive.
    Connected,

    /// Attempting to establish or re-establish the connection.
    Connecting,

    /// Cleanly disconnected (not an error condition).
    Disconnected,

    /// An unrecoverable (or pre-retry) error occurred.
    Error(String),
}
