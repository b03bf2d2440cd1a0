//! Drains the shared inbound message bus and drives each message through the
//! full agent pipeline.
//!
//! Interactive channels (Discord, Telegram, the HTTP/WS surface) call
//! `process_message_non_streaming` directly — they need the reply
//! synchronously, for typing indicators and HTTP responses. The bus instead
//! carries *synthetic* inbound messages: a subagent's completion announce
//! (C8) and a scheduler-fired `agent_turn` reminder (C9) both publish a
//! `"system"`-channel `InboundMessage` here instead of writing straight to
//! `notifications`, so the content is summarized by the LLM — with the
//! rest of the turn's context (history, tools) available to it — before a
//! user ever sees it.

use std::sync::Arc;

use nanobot_agent::pipeline::{process_message_non_streaming, MessageContext};
use nanobot_agent::provider::ProviderError;
use nanobot_channels::bus::MessageBus;
use nanobot_channels::InboundMessage;
use tracing::warn;

use crate::app::AppState;

/// Poll interval passed to `consume_inbound` — large enough that the loop
/// effectively blocks on the next message, small enough to notice a
/// shutdown in a bounded time if one is ever wired in.
const POLL_MS: u64 = 3_600_000;

/// Run forever, spawning one pipeline turn per inbound message so a slow
/// turn never blocks the next one from being picked up.
pub async fn run(state: Arc<AppState>, mut bus: MessageBus) {
    loop {
        if let Some(msg) = bus.consume_inbound(POLL_MS).await {
            let state = Arc::clone(&state);
            tokio::spawn(async move { handle(state, msg).await });
        }
    }
}

async fn handle(state: Arc<AppState>, msg: InboundMessage) {
    // The second component of a `"system"` chat_id IS the full session key
    // the triggering turn ran under — not a `{channel}:{chatId}` pair to
    // recombine. Session keys already contain colons of their own
    // (`user:42:discord:thread_7`), so treating the decoded remainder as
    // anything other than an opaque session key loses the original session.
    let (origin_channel, session_key) = if msg.channel == "system" {
        match InboundMessage::decode_system_chat_id(&msg.chat_id) {
            Some((channel, session_key)) => (channel.to_string(), session_key.to_string()),
            None => {
                warn!(chat_id = %msg.chat_id, "bus consumer: malformed system chat_id, dropping");
                return;
            }
        }
    } else {
        (msg.channel.clone(), msg.chat_id.clone())
    };

    let channel_id = msg
        .metadata
        .extra
        .get("channel_id")
        .and_then(|v| v.as_u64());

    let result = process_message_non_streaming(
        &state,
        &session_key,
        &origin_channel,
        &msg.content,
        None,
        None,
        channel_id,
        None,
        None,
    )
    .await;

    match result {
        Ok(processed) if !processed.content.is_empty() => {
            deliver(&state, &origin_channel, &session_key, channel_id, &processed.content);
        }
        Ok(_) => {}
        Err(ProviderError::Cancelled) => {}
        Err(e) => warn!(error = %e, session = %session_key, "bus consumer: pipeline turn failed"),
    }
}

/// Deliver a bus-originated reply: through the channel's own outbound sender
/// if a platform-native `channel_id` was carried along, else queued in
/// `notifications` keyed by the exact session key for the origin to poll
/// (the HTTP/WS terminal path).
fn deliver(state: &AppState, channel: &str, session_key: &str, channel_id: Option<u64>, content: &str) {
    if let Some(id) = channel_id {
        if state.send_to_channel(channel, &id.to_string(), content).is_ok() {
            return;
        }
    }
    state
        .notifications
        .entry(session_key.to_string())
        .or_default()
        .push(content.to_string());
}
