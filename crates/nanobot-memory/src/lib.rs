//! `nanobot-memory` — long-term memory entries, daily notes, and the
//! legacy per-user preference store, all SQLite-backed.
//!
//! Three families of state share one database: scoped long-term memory
//! (`memory_entries`/`daily_notes`, consumed by the context builder and the
//! auto-memory/maintenance jobs), the conversation log used for session
//! history and turn counting, and an operator-curated knowledge base
//! searched on demand by the `knowledge_search`/`knowledge_write` tools.

pub mod db;
pub mod error;
pub mod manager;
pub mod types;

pub use error::{MemoryError, Result};
pub use manager::{format_entries, parse_memory_entries, MemoryManager};
pub use types::{
    ConversationMessage, DailyNote, KnowledgeEntry, MemoryCategory, MemoryEntry, MemorySource,
    UserContext, UserMemory,
};
