//! Telegram context interface — re-exported from the shared pipeline.
//!
//! `TelegramAppContext` is an alias for `nanobot_agent::pipeline::MessageContext`.
//! All channel adapters share the same trait, defined once in `nanobot-agent`.

pub use nanobot_agent::pipeline::MessageContext as TelegramAppContext;
