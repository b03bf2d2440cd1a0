use rusqlite::{Connection, Result};

/// Initialise memory tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_user_memory_table(conn)?;
    create_fts_index(conn)?;
    create_conversations_table(conn)?;
    create_memory_entries_table(conn)?;
    create_memory_entries_fts(conn)?;
    create_daily_notes_table(conn)?;
    create_knowledge_table(conn)?;
    create_tool_usage_table(conn)?;
    Ok(())
}

fn create_user_memory_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS user_memory (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     TEXT NOT NULL,
            category    TEXT NOT NULL,
            key         TEXT NOT NULL,
            value       TEXT NOT NULL,
            confidence  REAL NOT NULL DEFAULT 0.8,
            source      TEXT NOT NULL DEFAULT 'inferred',
            expires_at  TEXT,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL,
            UNIQUE(user_id, category, key)
        );
        CREATE INDEX IF NOT EXISTS idx_memory_user
            ON user_memory(user_id);",
    )
}

/// FTS5 virtual table for full-text search across memory keys and values.
/// content='' makes it an external-content table — we sync manually on write.
fn create_fts_index(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS user_memory_fts
            USING fts5(key, value, content='user_memory', content_rowid='id');",
    )
}

fn create_conversations_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversations (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     TEXT,
            session_key TEXT NOT NULL,
            channel     TEXT NOT NULL,
            role        TEXT NOT NULL,
            content     TEXT NOT NULL,
            model_used  TEXT,
            tokens_in   INTEGER NOT NULL DEFAULT 0,
            tokens_out  INTEGER NOT NULL DEFAULT 0,
            cost_usd    REAL NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conv_user
            ON conversations(user_id, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_conv_session
            ON conversations(session_key, created_at);",
    )
}

/// Long-term memory entries — scoped, size-bounded, append-mostly facts.
fn create_memory_entries_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS memory_entries (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            agent_id    TEXT,
            scope       TEXT NOT NULL DEFAULT 'global',
            content     TEXT NOT NULL,
            source_type TEXT,
            source_id   TEXT,
            entry_date  TEXT NOT NULL,
            entry_time  TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_memory_entries_scope
            ON memory_entries(scope, agent_id);
        CREATE INDEX IF NOT EXISTS idx_memory_entries_created
            ON memory_entries(created_at);",
    )
}

/// FTS5 index over memory entry content. Probed separately at startup —
/// queries fall back to `LIKE` when fts5 isn't compiled in.
fn create_memory_entries_fts(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS memory_entries_fts
            USING fts5(content, content='memory_entries', content_rowid='id');",
    )
}

/// Returns whether the running SQLite build has fts5 compiled in.
pub fn fts5_available(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT 1 FROM pragma_compile_options WHERE compile_options = 'ENABLE_FTS5'",
        [],
        |_| Ok(()),
    )
    .is_ok()
}

fn create_daily_notes_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS daily_notes (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            agent_id     TEXT,
            scope        TEXT NOT NULL DEFAULT 'global',
            note_date    TEXT NOT NULL,
            content      TEXT NOT NULL,
            is_processed INTEGER NOT NULL DEFAULT 0,
            processed_at TEXT,
            created_at   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_daily_notes_scope
            ON daily_notes(scope, agent_id, note_date);
        CREATE INDEX IF NOT EXISTS idx_daily_notes_processed
            ON daily_notes(is_processed, note_date);",
    )
}

/// Operator/bot-curated knowledge base, topic-keyed, FTS5-searched.
fn create_knowledge_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS knowledge (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            topic      TEXT NOT NULL UNIQUE,
            content    TEXT NOT NULL,
            tags       TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE VIRTUAL TABLE IF NOT EXISTS knowledge_fts
            USING fts5(topic, content, tags, content='knowledge', content_rowid='id');",
    )
}

/// Per-call tool invocation log, used to derive hot-topic knowledge injection
/// (`get_top_tools` / `get_hot_topics` in `manager.rs`).
fn create_tool_usage_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tool_usage (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            tool_name   TEXT NOT NULL,
            session_key TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tool_usage_name_time
            ON tool_usage(tool_name, created_at);",
    )
}
