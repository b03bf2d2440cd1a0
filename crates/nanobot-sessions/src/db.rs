use rusqlite::Connection;

use crate::error::Result;

/// Initialise the session tables and their indexes.
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            session_key   TEXT PRIMARY KEY,
            channel       TEXT NOT NULL,
            chat_id       TEXT NOT NULL,
            title         TEXT,
            last_model    TEXT,
            metadata      TEXT NOT NULL DEFAULT 'null',
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_updated
            ON sessions(updated_at DESC);

        CREATE TABLE IF NOT EXISTS chat_messages (
            session_key  TEXT NOT NULL,
            sequence     INTEGER NOT NULL,
            role         TEXT NOT NULL,
            content      TEXT NOT NULL,
            timestamp    TEXT NOT NULL,
            tool_call_id TEXT,
            tool_calls   TEXT,
            tool_steps   TEXT,
            usage        TEXT,
            PRIMARY KEY (session_key, sequence),
            FOREIGN KEY (session_key) REFERENCES sessions(session_key) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_chat_messages_session
            ON chat_messages(session_key, sequence DESC);",
    )?;
    Ok(())
}
