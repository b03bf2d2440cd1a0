//! `nanobot-hooks` — lifecycle hook engine for pre/post tool-call and LLM
//! observability events.
//!
//! Ambient relative to the core agent spec (not one of the numbered
//! components): `nanobot-agent`'s `AgentRuntime` optionally attaches a
//! [`HookEngine`] (behind the `hooks` cargo feature) so deployments can
//! observe or veto tool calls without the core loop knowing about it.

pub mod engine;
pub mod error;
pub mod types;

pub use engine::HookEngine;
pub use error::{HookError, Result};
pub use types::{HookAction, HookContext, HookDefinition, HookEvent, HookResult, HookTiming};
