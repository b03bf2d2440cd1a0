//! `nanobot-core` — shared types, configuration, error kinds, and the
//! self-update checker used by every other crate in the workspace.
//!
//! Nothing here depends on any other workspace crate; everything else
//! depends on this one. Keep it that way.

pub mod config;
pub mod db;
pub mod error;
pub mod reminder;
pub mod types;
pub mod update;

pub use error::{Result, NanobotError};
pub use types::{AgentId, ChannelOutbound, ConnId, SessionKey, UserId, UserRole};
