//! Tool re-export for the Telegram adapter.
//!
//! All tools are shared — implemented once in `nanobot-agent` and re-exported here
//! following the same thin-wrapper pattern as `nanobot-discord/src/tools.rs`.

pub use nanobot_agent::tools::build::build_tools;
