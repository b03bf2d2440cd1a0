//! In-process message bus connecting channel adapters to the agent pipeline.
//!
//! Every adapter (Discord, Telegram, the gateway's WS/HTTP surface, the
//! scheduler's synthetic `"system"` messages) publishes [`InboundMessage`]s
//! onto one shared bus and reads [`OutboundMessage`]s back off it; the
//! pipeline itself never imports a platform SDK. Built on unbounded mpsc
//! channels rather than broadcast: each inbound message has exactly one
//! consumer (the pipeline dispatcher), so there is no need for every
//! subscriber to see every message.

use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::warn;

use crate::types::{InboundMessage, OutboundMessage};

/// Shared inbound/outbound message queues.
///
/// Cloning a `MessageBus` clones the sender handles only (cheap, `Arc`-backed
/// internally by `tokio::mpsc`); only the clone that owns the original
/// receivers can `consume_*` — once taken via [`MessageBus::new`], the
/// receiver half lives in the handle that `.take_*` was called on.
pub struct MessageBus {
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    inbound_rx: mpsc::UnboundedReceiver<InboundMessage>,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    outbound_rx: mpsc::UnboundedReceiver<OutboundMessage>,
}

impl MessageBus {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            inbound_tx,
            inbound_rx,
            outbound_tx,
            outbound_rx,
        }
    }

    /// Clonable handle for publishing inbound messages (channel adapters hold
    /// one of these) without granting access to the receiver.
    pub fn inbound_sender(&self) -> mpsc::UnboundedSender<InboundMessage> {
        self.inbound_tx.clone()
    }

    /// Clonable handle for publishing outbound messages (the pipeline
    /// dispatcher holds one of these).
    pub fn outbound_sender(&self) -> mpsc::UnboundedSender<OutboundMessage> {
        self.outbound_tx.clone()
    }

    /// Enqueue an inbound message. Non-blocking; only fails if every
    /// receiver (the pipeline dispatcher) has been dropped, which only
    /// happens during shutdown.
    pub fn publish_inbound(&self, msg: InboundMessage) {
        if self.inbound_tx.send(msg).is_err() {
            warn!("message bus: no inbound consumer, message dropped");
        }
    }

    /// Enqueue an outbound message for delivery by whichever adapter owns
    /// `msg.channel`.
    pub fn publish_outbound(&self, msg: OutboundMessage) {
        if self.outbound_tx.send(msg).is_err() {
            warn!("message bus: no outbound consumer, message dropped");
        }
    }

    /// Wait up to `timeout_ms` for the next inbound message. `None` on
    /// timeout or if every sender has been dropped.
    pub async fn consume_inbound(&mut self, timeout_ms: u64) -> Option<InboundMessage> {
        timeout(Duration::from_millis(timeout_ms), self.inbound_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Wait up to `timeout_ms` for the next outbound message. `None` on
    /// timeout or if every sender has been dropped.
    pub async fn consume_outbound(&mut self, timeout_ms: u64) -> Option<OutboundMessage> {
        timeout(Duration::from_millis(timeout_ms), self.outbound_rx.recv())
            .await
            .ok()
            .flatten()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InboundMetadata, MessageFormat};

    fn sample_inbound() -> InboundMessage {
        InboundMessage {
            channel: "telegram".to_string(),
            sender_id: "123".to_string(),
            sender_name: Some("alice".to_string()),
            chat_id: "123".to_string(),
            content: "hello".to_string(),
            media: Vec::new(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            raw_payload: None,
            metadata: InboundMetadata::default(),
        }
    }

    #[tokio::test]
    async fn publishes_and_consumes_inbound() {
        let mut bus = MessageBus::new();
        bus.publish_inbound(sample_inbound());
        let got = bus.consume_inbound(100).await.expect("message");
        assert_eq!(got.content, "hello");
    }

    #[tokio::test]
    async fn consume_inbound_times_out_when_empty() {
        let mut bus = MessageBus::new();
        assert!(bus.consume_inbound(10).await.is_none());
    }

    #[tokio::test]
    async fn publishes_and_consumes_outbound() {
        let mut bus = MessageBus::new();
        bus.publish_outbound(OutboundMessage {
            channel: "telegram".to_string(),
            recipient_id: "123".to_string(),
            chat_id: "123".to_string(),
            content: "reply".to_string(),
            format: MessageFormat::PlainText,
            metadata: None,
        });
        let got = bus.consume_outbound(100).await.expect("message");
        assert_eq!(got.content, "reply");
    }

    #[tokio::test]
    async fn sender_handle_publishes_from_another_task() {
        let mut bus = MessageBus::new();
        let tx = bus.inbound_sender();
        tx.send(sample_inbound()).unwrap();
        let got = bus.consume_inbound(100).await.expect("message");
        assert_eq!(got.sender_name.as_deref(), Some("alice"));
    }
}
