//! `nanobot-protocol` — wire framing for the local Web-UI / WS gateway.
//!
//! Out of scope per the agent-core specification (§1: "the HTTP/Web-UI
//! layer" is an external collaborator), kept because it is the only
//! runnable transport the workspace ships and `nanobot-gateway` needs a
//! concrete frame format to talk to it.

pub mod frames;
pub mod handshake;
pub mod methods;
