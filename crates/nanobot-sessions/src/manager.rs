use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex as StdMutex};

use lru::LruCache;
use rusqlite::Connection;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, instrument};

use crate::error::{Result, SessionError};
use crate::types::{Session, SessionKey, StoredMessage};

/// Maximum number of sessions held warm in the in-process LRU cache.
/// Sessions beyond this are still durable in SQLite, just reloaded on
/// next access.
const CACHE_MAX: usize = 500;

/// Thread-safe manager for persisted channel sessions.
///
/// A single SQLite connection backs durability; an `lru::LruCache` bounded
/// to [`CACHE_MAX`] entries keeps hot sessions in memory, and a per-key
/// async lock serializes concurrent reads/writes to the same session so a
/// `save()` in flight for one chat never torn-reads against another turn
/// for the same chat.
pub struct SessionManager {
    db: StdMutex<Connection>,
    cache: StdMutex<LruCache<SessionKey, Session>>,
    locks: StdMutex<HashMap<SessionKey, Arc<AsyncMutex<()>>>>,
}

impl SessionManager {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: StdMutex::new(conn),
            cache: StdMutex::new(LruCache::new(NonZeroUsize::new(CACHE_MAX).unwrap())),
            locks: StdMutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, key: &SessionKey) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Cache a freshly loaded/saved session, dropping the lock entry for
    /// whatever session the LRU evicts to make room.
    fn cache_put(&self, session: Session) {
        let inserted_key = session.key.clone();
        let evicted = self.cache.lock().unwrap().push(inserted_key.clone(), session);
        // `push` also returns the old value when it merely updates an existing
        // key, not just on true eviction — only drop the lock entry when a
        // *different* key was pushed out to make room.
        if let Some((evicted_key, _)) = evicted {
            if evicted_key != inserted_key {
                self.locks.lock().unwrap().remove(&evicted_key);
            }
        }
    }

    /// Return an existing session or create a new, empty one.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn get_or_create(&self, key: &SessionKey) -> Result<Session> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        if let Some(session) = self.get_locked(key)? {
            return Ok(session);
        }
        let session = Session::new(key.clone());
        self.save_locked(&session)?;
        Ok(session)
    }

    /// Retrieve a session by key, returning `None` if it does not exist.
    #[instrument(skip(self), fields(key = %key))]
    pub fn get(&self, key: &SessionKey) -> Result<Option<Session>> {
        self.get_locked(key)
    }

    fn get_locked(&self, key: &SessionKey) -> Result<Option<Session>> {
        if let Some(session) = self.cache.lock().unwrap().get(key) {
            debug!("session cache hit");
            return Ok(Some(session.clone()));
        }

        let db = self.db.lock().unwrap();
        let key_str = key.format();
        let row = db.query_row(
            "SELECT title, last_model, metadata, created_at, updated_at
             FROM sessions WHERE session_key = ?1",
            rusqlite::params![key_str],
            |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        );
        let (title, last_model, metadata_raw, created_at, updated_at) = match row {
            Ok(v) => v,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(SessionError::Database(e)),
        };

        let mut stmt = db.prepare(
            "SELECT sequence, role, content, timestamp, tool_call_id, tool_calls, tool_steps, usage
             FROM chat_messages WHERE session_key = ?1 ORDER BY sequence ASC",
        )?;
        let messages = stmt
            .query_map(rusqlite::params![key_str], row_to_message)?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);
        drop(db);

        let session = Session {
            key: key.clone(),
            messages,
            title,
            last_model,
            created_at,
            updated_at,
            metadata: serde_json::from_str(&metadata_raw).unwrap_or(serde_json::Value::Null),
        };
        self.cache_put(session.clone());
        Ok(Some(session))
    }

    /// Persist a session's metadata and full message log in one transaction.
    ///
    /// The message log is replaced wholesale: existing rows for the key are
    /// deleted and the in-memory log is re-inserted with freshly assigned
    /// dense sequence numbers, so a compacted history never leaves gaps.
    #[instrument(skip(self, session), fields(key = %session.key))]
    pub async fn save(&self, session: &Session) -> Result<()> {
        let lock = self.lock_for(&session.key);
        let _guard = lock.lock().await;
        self.save_locked(session)
    }

    fn save_locked(&self, session: &Session) -> Result<()> {
        let key_str = session.key.format();
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO sessions (session_key, channel, chat_id, title, last_model, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(session_key) DO UPDATE SET
                title = excluded.title,
                last_model = excluded.last_model,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at",
            rusqlite::params![
                key_str,
                session.key.channel,
                session.key.chat_id,
                session.title,
                session.last_model,
                serde_json::to_string(&session.metadata)?,
                session.created_at,
                session.updated_at,
            ],
        )?;
        tx.execute(
            "DELETE FROM chat_messages WHERE session_key = ?1",
            rusqlite::params![key_str],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO chat_messages
                 (session_key, sequence, role, content, timestamp, tool_call_id, tool_calls, tool_steps, usage)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for (i, message) in session.messages.iter().enumerate() {
                let sequence = (i + 1) as i64;
                stmt.execute(rusqlite::params![
                    key_str,
                    sequence,
                    message.role,
                    message.content,
                    message.timestamp,
                    message.tool_call_id,
                    message
                        .tool_calls
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    message
                        .tool_steps
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    message
                        .usage
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                ])?;
            }
        }
        tx.commit()?;
        drop(db);

        self.cache_put(session.clone());
        Ok(())
    }

    /// Page through a session's message log, newest-first pagination
    /// expressed as oldest-first output.
    ///
    /// `limit` is clamped to `[1, 200]`. When `before_sequence` is set, only
    /// messages with `sequence < before_sequence` are considered — this is
    /// how a caller walks backwards through history one page at a time.
    #[instrument(skip(self), fields(key = %key, limit, before_sequence))]
    pub fn get_messages(
        &self,
        key: &SessionKey,
        limit: usize,
        before_sequence: Option<u32>,
    ) -> Result<Vec<StoredMessage>> {
        let safe_limit = limit.clamp(1, 200);
        let key_str = key.format();
        let db = self.db.lock().unwrap();
        let mut rows = if let Some(before) = before_sequence {
            let mut stmt = db.prepare(
                "SELECT sequence, role, content, timestamp, tool_call_id, tool_calls, tool_steps, usage
                 FROM chat_messages WHERE session_key = ?1 AND sequence < ?2
                 ORDER BY sequence DESC LIMIT ?3",
            )?;
            stmt.query_map(
                rusqlite::params![key_str, before, safe_limit as i64],
                row_to_message,
            )?
            .filter_map(|r| r.ok())
            .collect::<Vec<_>>()
        } else {
            let mut stmt = db.prepare(
                "SELECT sequence, role, content, timestamp, tool_call_id, tool_calls, tool_steps, usage
                 FROM chat_messages WHERE session_key = ?1
                 ORDER BY sequence DESC LIMIT ?2",
            )?;
            stmt.query_map(rusqlite::params![key_str, safe_limit as i64], row_to_message)?
                .filter_map(|r| r.ok())
                .collect::<Vec<_>>()
        };
        rows.reverse();
        Ok(rows)
    }

    /// Recent `user`/`assistant` messages across *all* sessions since
    /// `since_iso`, oldest first, capped to `limit`. Used by the
    /// auto-memory-integration job (C10) to pull a lookback window of chat
    /// history without needing the caller to already know which sessions
    /// were active.
    ///
    /// Subagent turns never reach `chat_messages` (subagent history is
    /// ephemeral — see `nanobot-agent::subagent`), so no exclusion filter is
    /// needed here to honour the "excluding subagent turns" requirement.
    #[instrument(skip(self), fields(since_iso, limit))]
    pub fn recent_messages_since(
        &self,
        since_iso: &str,
        limit: usize,
    ) -> Result<Vec<(SessionKey, StoredMessage)>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT session_key, sequence, role, content, timestamp, tool_call_id, tool_calls, tool_steps, usage
             FROM chat_messages
             WHERE timestamp >= ?1 AND role IN ('user', 'assistant')
             ORDER BY timestamp DESC
             LIMIT ?2",
        )?;
        let mut rows: Vec<(SessionKey, StoredMessage)> = stmt
            .query_map(rusqlite::params![since_iso, limit as i64], |row| {
                let key_str: String = row.get(0)?;
                let msg = row_to_message_offset(row, 1)?;
                Ok((key_str, msg))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(key_str, msg)| SessionKey::parse(&key_str).ok().map(|k| (k, msg)))
            .collect();
        rows.reverse();
        Ok(rows)
    }

    /// List the most-recently-updated session keys, newest first.
    #[instrument(skip(self), fields(limit))]
    pub fn list_recent(&self, limit: usize) -> Result<Vec<SessionKey>> {
        let db = self.db.lock().unwrap();
        let mut stmt =
            db.prepare("SELECT channel, chat_id FROM sessions ORDER BY updated_at DESC LIMIT ?1")?;
        let rows = stmt.query_map(rusqlite::params![limit as i64], |row| {
            Ok(SessionKey::new(
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
            ))
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Permanently delete a session and its message log.
    #[instrument(skip(self), fields(key = %key))]
    pub fn delete(&self, key: &SessionKey) -> Result<()> {
        let key_str = key.format();
        let db = self.db.lock().unwrap();
        let rows_changed = db.execute(
            "DELETE FROM sessions WHERE session_key = ?1",
            rusqlite::params![key_str],
        )?;
        drop(db);
        self.cache.lock().unwrap().pop(key);
        self.locks.lock().unwrap().remove(key);
        if rows_changed == 0 {
            return Err(SessionError::NotFound { key: key_str });
        }
        Ok(())
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    row_to_message_offset(row, 0)
}

/// Same column layout as `row_to_message`, but starting at `offset` — lets
/// `recent_messages_since` prefix the row with a `session_key` column.
fn row_to_message_offset(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<StoredMessage> {
    let tool_calls_raw: Option<String> = row.get(offset + 5)?;
    let tool_steps_raw: Option<String> = row.get(offset + 6)?;
    let usage_raw: Option<String> = row.get(offset + 7)?;
    Ok(StoredMessage {
        sequence: row.get::<_, i64>(offset)? as u32,
        role: row.get(offset + 1)?,
        content: row.get(offset + 2)?,
        timestamp: row.get(offset + 3)?,
        tool_call_id: row.get(offset + 4)?,
        tool_calls: tool_calls_raw.and_then(|s| serde_json::from_str(&s).ok()),
        tool_steps: tool_steps_raw.and_then(|s| serde_json::from_str(&s).ok()),
        usage: usage_raw.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::types::StoredMessage;

    fn manager() -> SessionManager {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        SessionManager::new(conn)
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let mgr = manager();
        let key = SessionKey::new("telegram", "1");
        let a = mgr.get_or_create(&key).await.unwrap();
        let b = mgr.get_or_create(&key).await.unwrap();
        assert_eq!(a.created_at, b.created_at);
    }

    #[tokio::test]
    async fn save_assigns_dense_sequence_and_replaces_log() {
        let mgr = manager();
        let key = SessionKey::new("cli", "local");
        let mut session = mgr.get_or_create(&key).await.unwrap();
        session.push(StoredMessage {
            sequence: 0,
            role: "user".into(),
            content: "hi".into(),
            timestamp: "t1".into(),
            tool_call_id: None,
            tool_calls: None,
            tool_steps: None,
            usage: None,
        });
        mgr.save(&session).await.unwrap();

        let reloaded = mgr.get(&key).unwrap().expect("session exists");
        assert_eq!(reloaded.messages.len(), 1);
        assert_eq!(reloaded.messages[0].sequence, 1);

        // Replace wholesale with a trimmed 2-message log; sequence must stay dense.
        session.messages.clear();
        session.push(StoredMessage {
            sequence: 0,
            role: "user".into(),
            content: "a".into(),
            timestamp: "t2".into(),
            tool_call_id: None,
            tool_calls: None,
            tool_steps: None,
            usage: None,
        });
        session.push(StoredMessage {
            sequence: 0,
            role: "assistant".into(),
            content: "b".into(),
            timestamp: "t3".into(),
            tool_call_id: None,
            tool_calls: None,
            tool_steps: None,
            usage: None,
        });
        mgr.save(&session).await.unwrap();
        let reloaded = mgr.get(&key).unwrap().expect("session exists");
        assert_eq!(
            reloaded.messages.iter().map(|m| m.sequence).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[tokio::test]
    async fn get_messages_paginates_backwards() {
        let mgr = manager();
        let key = SessionKey::new("cli", "local");
        let mut session = mgr.get_or_create(&key).await.unwrap();
        for i in 0..5 {
            session.push(StoredMessage {
                sequence: 0,
                role: "user".into(),
                content: format!("msg{i}"),
                timestamp: "t".into(),
                tool_call_id: None,
                tool_calls: None,
                tool_steps: None,
                usage: None,
            });
        }
        mgr.save(&session).await.unwrap();

        let last_two = mgr.get_messages(&key, 2, None).unwrap();
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].content, "msg3");
        assert_eq!(last_two[1].content, "msg4");

        let before = mgr.get_messages(&key, 2, Some(last_two[0].sequence)).unwrap();
        assert_eq!(before.len(), 2);
        assert_eq!(before[0].content, "msg1");
        assert_eq!(before[1].content, "msg2");
    }

    #[tokio::test]
    async fn delete_clears_cache_and_lock() {
        let mgr = manager();
        let key = SessionKey::new("cli", "local");
        mgr.get_or_create(&key).await.unwrap();
        mgr.delete(&key).unwrap();
        assert!(mgr.get(&key).unwrap().is_none());
    }

    #[tokio::test]
    async fn recent_messages_since_excludes_older_and_non_chat_roles() {
        let mgr = manager();
        let key = SessionKey::new("cli", "local");
        let mut session = mgr.get_or_create(&key).await.unwrap();
        session.push(StoredMessage {
            sequence: 0,
            role: "user".into(),
            content: "too old".into(),
            timestamp: "2026-01-01T00:00:00Z".into(),
            tool_call_id: None,
            tool_calls: None,
            tool_steps: None,
            usage: None,
        });
        session.push(StoredMessage {
            sequence: 0,
            role: "tool".into(),
            content: "tool output, should be excluded".into(),
            timestamp: "2026-01-02T00:00:00Z".into(),
            tool_call_id: Some("call1".into()),
            tool_calls: None,
            tool_steps: None,
            usage: None,
        });
        session.push(StoredMessage {
            sequence: 0,
            role: "assistant".into(),
            content: "recent reply".into(),
            timestamp: "2026-01-02T00:05:00Z".into(),
            tool_call_id: None,
            tool_calls: None,
            tool_steps: None,
            usage: None,
        });
        mgr.save(&session).await.unwrap();

        let recent = mgr.recent_messages_since("2026-01-01T12:00:00Z", 10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].1.content, "recent reply");
    }
}
