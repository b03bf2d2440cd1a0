//! Discord context interface — re-exported from the shared pipeline.
//!
//! `DiscordAppContext` is now an alias for `nanobot_agent::pipeline::MessageContext`.
//! All channel adapters share the same trait, defined once in `nanobot-agent` to
//! avoid circular dependencies.

pub use nanobot_agent::pipeline::MessageContext as DiscordAppContext;
