use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Channel-scoped session key.
///
/// A session belongs to one `(channel, chatId)` pair — the unit a channel
/// adapter already knows how to address. Format: `"<channel>:<chatId>"`,
/// where `chatId` may itself contain colons (Discord/Telegram ids never do,
/// but the `system` channel encodes `"<originChannel>:<originChatId>"` into
/// its own chat id, so the split only ever happens on the *first* colon).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub channel: String,
    pub chat_id: String,
}

impl SessionKey {
    pub fn new(channel: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
        }
    }

    /// Canonical wire-format string: `"<channel>:<chatId>"`.
    pub fn format(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }

    /// Parse a wire-format key, splitting on the first colon only.
    pub fn parse(s: &str) -> Result<Self> {
        let pos = s
            .find(':')
            .ok_or_else(|| SessionError::InvalidKey(format!("missing ':' separator: {s}")))?;
        let channel = &s[..pos];
        let chat_id = &s[pos + 1..];
        if channel.is_empty() || chat_id.is_empty() {
            return Err(SessionError::InvalidKey(format!(
                "key components must not be empty: {s}"
            )));
        }
        Ok(Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
        })
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format())
    }
}

/// A binding between an assistant tool-call and the result message that
/// answers it. `id` matches the provider's `tool_call_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallBinding {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Inline record of one executed tool call, carried on the assistant message
/// that requested it. `tool_calls` gives the binding a later `tool`-role
/// message references by `tool_call_id`; `tool_steps` carries the same
/// call's outcome alongside it so a reader doesn't have to scan forward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolStep {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    pub result: String,
    pub is_error: bool,
}

/// Token accounting for a single turn, when the provider reports it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// One row of a session's message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Dense, 1-based position within the session. Reassigned on every
    /// `save()` so a compaction that drops the oldest turns never leaves
    /// gaps.
    pub sequence: u32,
    pub role: String,
    pub content: String,
    /// RFC3339 timestamp.
    pub timestamp: String,
    /// Set on a `tool` role message — the id of the assistant tool call it
    /// answers.
    pub tool_call_id: Option<String>,
    /// Set on an `assistant` message that requested tool calls.
    pub tool_calls: Option<Vec<ToolCallBinding>>,
    /// Set alongside `tool_calls` — the same calls' results, inline.
    pub tool_steps: Option<Vec<ToolStep>>,
    pub usage: Option<TokenUsage>,
}

/// A persisted conversation session: metadata plus its full message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub key: SessionKey,
    pub messages: Vec<StoredMessage>,
    pub title: Option<String>,
    pub last_model: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub metadata: serde_json::Value,
}

impl Session {
    pub fn new(key: SessionKey) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            key,
            messages: Vec::new(),
            title: None,
            last_model: None,
            created_at: now.clone(),
            updated_at: now,
            metadata: serde_json::Value::Null,
        }
    }

    /// Append a message, assigning the next dense sequence number.
    pub fn push(&mut self, mut message: StoredMessage) {
        let next = self.messages.last().map(|m| m.sequence + 1).unwrap_or(1);
        message.sequence = next;
        self.messages.push(message);
        self.updated_at = chrono::Utc::now().to_rfc3339();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_simple_key() {
        let key = SessionKey::new("telegram", "12345");
        let s = key.format();
        assert_eq!(s, "telegram:12345");
        let parsed = SessionKey::parse(&s).expect("parse failed");
        assert_eq!(parsed, key);
    }

    #[test]
    fn roundtrip_chat_id_with_colons() {
        // system channel encodes "<originChannel>:<originChatId>" as its chat id
        let key = SessionKey::new("system", "discord:555");
        let s = key.format();
        let parsed = SessionKey::parse(&s).expect("parse failed");
        assert_eq!(parsed.chat_id, "discord:555");
    }

    #[test]
    fn parse_missing_separator_returns_err() {
        assert!(SessionKey::parse("telegram").is_err());
    }

    #[test]
    fn push_assigns_dense_sequence() {
        let mut session = Session::new(SessionKey::new("cli", "local"));
        session.push(StoredMessage {
            sequence: 0,
            role: "user".into(),
            content: "hi".into(),
            timestamp: "t".into(),
            tool_call_id: None,
            tool_calls: None,
            tool_steps: None,
            usage: None,
        });
        session.push(StoredMessage {
            sequence: 0,
            role: "assistant".into(),
            content: "hello".into(),
            timestamp: "t".into(),
            tool_call_id: None,
            tool_calls: None,
            tool_steps: None,
            usage: None,
        });
        assert_eq!(session.messages[0].sequence, 1);
        assert_eq!(session.messages[1].sequence, 2);
    }
}
