//! Shared SQLite connection bootstrap used by every store crate.
//!
//! Each store (`nanobot-sessions`, `nanobot-memory`, `nanobot-scheduler`,
//! `nanobot-users`) opens its own [`rusqlite::Connection`] against the same
//! database file and runs its own idempotent `init_db`; this module only
//! owns the handful of pragmas every connection needs regardless of which
//! store opened it.

use std::path::Path;

use rusqlite::Connection;
use tracing::debug;

/// Open (creating parent directories as needed) a SQLite connection with
/// the pragmas every store in this workspace relies on: foreign key
/// enforcement (sessions' `chat_messages` table cascades on delete), WAL
/// journaling so readers never block a writer, and a busy timeout so two
/// connections racing for the same page back off instead of erroring.
pub fn open_db(path: &str) -> rusqlite::Result<Connection> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;",
    )?;
    debug!(path, "opened sqlite connection");
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_in_memory_equivalent_tempfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("nanobot.db");
        let conn = open_db(path.to_str().unwrap()).unwrap();
        let fk: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |r| r.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }
}
