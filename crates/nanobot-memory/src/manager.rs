use std::collections::HashMap;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::debug;

use crate::error::MemoryError;
use crate::types::*;

/// Maximum rendered context size in characters (~1500 tokens).
const MAX_CONTEXT_CHARS: usize = 6000;
/// Cache entries expire after 5 minutes.
const CACHE_TTL_SECS: i64 = 300;
/// Maximum cache entries before eviction.
const MAX_CACHE_ENTRIES: usize = 256;

/// Write caps for long-term memory: per (agent_id, scope), at most this many
/// entries and this many bytes. Exceeding either evicts the oldest entry
/// until both hold again.
const MEMORY_MAX_ENTRIES: i64 = 100;
const MEMORY_MAX_BYTES: i64 = 30 * 1024;

/// Read caps: below these thresholds `get_memories` returns everything;
/// above them it returns the oldest `MEMORY_READ_KEEP_HEAD` plus the newest
/// `MEMORY_READ_KEEP_TAIL` (a head+tail window over oldest-first order).
const MEMORY_READ_MAX_ENTRIES: usize = 80;
const MEMORY_READ_MAX_BYTES: usize = 25 * 1024;
const MEMORY_READ_KEEP_HEAD: usize = 30;
const MEMORY_READ_KEEP_TAIL: usize = 50;

/// Manages per-user memory and conversation history.
///
/// Thread-safe: wraps SQLite connection in Mutex and keeps an in-memory
/// cache of rendered UserContext to avoid rebuilding on every message.
pub struct MemoryManager {
    db: Mutex<Connection>,
    cache: Mutex<HashMap<String, UserContext>>,
}

impl MemoryManager {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Store or update a memory entry. Higher confidence wins on conflict.
    /// Automatically syncs the FTS5 index.
    pub fn learn(
        &self,
        user_id: &str,
        category: MemoryCategory,
        key: &str,
        value: &str,
        confidence: f64,
        source: MemorySource,
    ) -> Result<(), MemoryError> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        let cat = category.to_string();
        let src = source.to_string();

        // Check existing confidence — only overwrite if new confidence >= old
        let existing: Option<(i64, f64)> = db
            .query_row(
                "SELECT id, confidence FROM user_memory
                 WHERE user_id = ?1 AND category = ?2 AND key = ?3",
                rusqlite::params![user_id, cat, key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();

        match existing {
            Some((id, old_conf)) if confidence < old_conf => {
                debug!(
                    user_id,
                    key,
                    old_conf,
                    new_conf = confidence,
                    "skipping learn: existing confidence is higher"
                );
                return Ok(());
            }
            Some((id, _)) => {
                db.execute(
                    "UPDATE user_memory SET value = ?1, confidence = ?2, source = ?3,
                     updated_at = ?4 WHERE id = ?5",
                    rusqlite::params![value, confidence, src, now, id],
                )?;
                // Sync FTS: delete old, insert new
                db.execute(
                    "INSERT INTO user_memory_fts(user_memory_fts, rowid, key, value)
                     VALUES('delete', ?1, ?2, ?3)",
                    rusqlite::params![id, key, value],
                )?;
                db.execute(
                    "INSERT INTO user_memory_fts(rowid, key, value) VALUES(?1, ?2, ?3)",
                    rusqlite::params![id, key, value],
                )?;
            }
            None => {
                db.execute(
                    "INSERT INTO user_memory (user_id, category, key, value, confidence,
                     source, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                    rusqlite::params![user_id, cat, key, value, confidence, src, now],
                )?;
                let id = db.last_insert_rowid();
                db.execute(
                    "INSERT INTO user_memory_fts(rowid, key, value) VALUES(?1, ?2, ?3)",
                    rusqlite::params![id, key, value],
                )?;
            }
        }

        // Invalidate cached context for this user
        self.invalidate_cache(user_id);
        Ok(())
    }

    /// Delete a specific memory ("forget that I'm vegetarian").
    pub fn forget(
        &self,
        user_id: &str,
        category: MemoryCategory,
        key: &str,
    ) -> Result<(), MemoryError> {
        let db = self.db.lock().unwrap();
        let cat = category.to_string();

        // Get the row first for FTS cleanup
        let row: Option<(i64, String)> = db
            .query_row(
                "SELECT id, value FROM user_memory
                 WHERE user_id = ?1 AND category = ?2 AND key = ?3",
                rusqlite::params![user_id, cat, key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();

        if let Some((id, value)) = row {
            db.execute(
                "INSERT INTO user_memory_fts(user_memory_fts, rowid, key, value)
                 VALUES('delete', ?1, ?2, ?3)",
                rusqlite::params![id, key, value],
            )?;
            db.execute(
                "DELETE FROM user_memory WHERE id = ?1",
                rusqlite::params![id],
            )?;
            self.invalidate_cache(user_id);
            Ok(())
        } else {
            Err(MemoryError::NotFound {
                category: cat,
                key: key.to_string(),
            })
        }
    }

    /// Full-text search across user memories.
    pub fn search(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<UserMemory>, MemoryError> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT m.id, m.user_id, m.category, m.key, m.value, m.confidence,
                    m.source, m.expires_at, m.created_at, m.updated_at
             FROM user_memory m
             JOIN user_memory_fts f ON m.id = f.rowid
             WHERE m.user_id = ?1 AND user_memory_fts MATCH ?2
             ORDER BY rank
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(rusqlite::params![user_id, query, limit], row_to_memory)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Load all memories for a user and render into a prompt section.
    /// Results are cached for 5 minutes to avoid repeated DB hits.
    pub fn build_user_context(&self, user_id: &str) -> Result<UserContext, MemoryError> {
        // Check cache first
        if let Some(cached) = self.get_cached(user_id) {
            return Ok(cached);
        }

        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, user_id, category, key, value, confidence,
                    source, expires_at, created_at, updated_at
             FROM user_memory
             WHERE user_id = ?1 AND (expires_at IS NULL OR expires_at > ?2)
             ORDER BY
                CASE category
                    WHEN 'instruction' THEN 0
                    WHEN 'preference' THEN 1
                    WHEN 'fact' THEN 2
                    WHEN 'context' THEN 3
                END,
                confidence DESC",
        )?;
        let now = chrono::Utc::now().to_rfc3339();
        let memories: Vec<UserMemory> = stmt
            .query_map(rusqlite::params![user_id, now], row_to_memory)?
            .filter_map(|r| r.ok())
            .collect();

        let rendered = render_context(&memories);
        let ctx = UserContext {
            user_id: user_id.to_string(),
            rendered,
            memory_count: memories.len(),
            built_at: chrono::Utc::now(),
        };

        // Store in cache
        let mut cache = self.cache.lock().unwrap();
        if cache.len() >= MAX_CACHE_ENTRIES {
            // Evict oldest entry
            let oldest_key = cache
                .iter()
                .min_by_key(|(_, v)| v.built_at)
                .map(|(k, _)| k.clone());
            if let Some(k) = oldest_key {
                cache.remove(&k);
            }
        }
        cache.insert(user_id.to_string(), ctx.clone());
        Ok(ctx)
    }

    /// Store a conversation message for history and cost tracking.
    pub fn save_message(&self, msg: &ConversationMessage) -> Result<(), MemoryError> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO conversations
             (user_id, session_key, channel, role, content, model_used,
              tokens_in, tokens_out, cost_usd, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                msg.user_id,
                msg.session_key,
                msg.channel,
                msg.role,
                msg.content,
                msg.model_used,
                msg.tokens_in,
                msg.tokens_out,
                msg.cost_usd,
                msg.created_at,
            ],
        )?;
        Ok(())
    }

    /// Retrieve recent conversation history for a session.
    pub fn get_history(
        &self,
        session_key: &str,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>, MemoryError> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, user_id, session_key, channel, role, content,
                    model_used, tokens_in, tokens_out, cost_usd, created_at
             FROM conversations
             WHERE session_key = ?1
             ORDER BY created_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![session_key, limit], |row| {
            Ok(ConversationMessage {
                id: row.get(0)?,
                user_id: row.get(1)?,
                session_key: row.get(2)?,
                channel: row.get(3)?,
                role: row.get(4)?,
                content: row.get(5)?,
                model_used: row.get(6)?,
                tokens_in: row.get(7)?,
                tokens_out: row.get(8)?,
                cost_usd: row.get(9)?,
                created_at: row.get(10)?,
            })
        })?;
        // Reverse so oldest first
        let mut msgs: Vec<_> = rows.filter_map(|r| r.ok()).collect();
        msgs.reverse();
        Ok(msgs)
    }

    fn get_cached(&self, user_id: &str) -> Option<UserContext> {
        let cache = self.cache.lock().unwrap();
        let ctx = cache.get(user_id)?;
        let age = chrono::Utc::now()
            .signed_duration_since(ctx.built_at)
            .num_seconds();
        if age < CACHE_TTL_SECS {
            Some(ctx.clone())
        } else {
            None
        }
    }

    fn invalidate_cache(&self, user_id: &str) {
        let mut cache = self.cache.lock().unwrap();
        cache.remove(user_id);
    }

    // ---------------------------------------------------------------
    // Long-term memory entries (scope + agent-id isolated)
    // ---------------------------------------------------------------

    /// Append a single long-term memory entry, then enforce write caps.
    pub fn append_memory(
        &self,
        scope: &str,
        agent_id: Option<&str>,
        content: &str,
        source_type: Option<&str>,
        source_id: Option<&str>,
    ) -> Result<i64, MemoryError> {
        let now = chrono::Local::now();
        let entry_date = now.format("%Y-%m-%d").to_string();
        let entry_time = now.format("%H:%M").to_string();
        let created_at = now.to_rfc3339();

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO memory_entries
             (agent_id, scope, content, source_type, source_id, entry_date, entry_time, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![agent_id, scope, content, source_type, source_id, entry_date, entry_time, created_at],
        )?;
        let id = db.last_insert_rowid();
        sync_memory_fts(&db, id, content)?;
        drop(db);
        self.enforce_memory_caps(scope, agent_id)?;
        Ok(id)
    }

    /// Batch-append `(date, content)` pairs, where `date` is
    /// `"YYYY-MM-DD"` or `"YYYY-MM-DD HH:MM"` (the latter's time component is
    /// split off; a bare date falls back to the current time). Used by
    /// auto-integration and the daily-note folding job.
    pub fn append_memories(
        &self,
        scope: &str,
        agent_id: Option<&str>,
        entries: &[(String, String)],
        source_type: Option<&str>,
    ) -> Result<(), MemoryError> {
        if entries.is_empty() {
            return Ok(());
        }
        let now = chrono::Local::now();
        let created_at = now.to_rfc3339();

        {
            let db = self.db.lock().unwrap();
            for (date_str, content) in entries {
                let content = content.trim();
                if content.is_empty() {
                    continue;
                }
                let (entry_date, entry_time) = split_date_time(date_str, &now);
                db.execute(
                    "INSERT INTO memory_entries
                     (agent_id, scope, content, source_type, entry_date, entry_time, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![agent_id, scope, content, source_type, entry_date, entry_time, created_at],
                )?;
                let id = db.last_insert_rowid();
                sync_memory_fts(&db, id, content)?;
            }
        }
        self.enforce_memory_caps(scope, agent_id)?;
        Ok(())
    }

    /// Evicts the single oldest entry, repeatedly, until both the entry-count
    /// and byte-size caps hold for `(scope, agent_id)`.
    fn enforce_memory_caps(&self, scope: &str, agent_id: Option<&str>) -> Result<(), MemoryError> {
        loop {
            let db = self.db.lock().unwrap();
            let (count, total_bytes): (i64, i64) = db.query_row(
                "SELECT COUNT(*), COALESCE(SUM(LENGTH(content) + LENGTH(entry_date) + LENGTH(entry_time) + 20), 0)
                 FROM memory_entries
                 WHERE scope = ?1 AND agent_id IS ?2",
                rusqlite::params![scope, agent_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            if count <= MEMORY_MAX_ENTRIES && total_bytes <= MEMORY_MAX_BYTES {
                return Ok(());
            }
            let oldest: Option<i64> = db
                .query_row(
                    "SELECT id FROM memory_entries WHERE scope = ?1 AND agent_id IS ?2
                     ORDER BY created_at ASC, id ASC LIMIT 1",
                    rusqlite::params![scope, agent_id],
                    |row| row.get(0),
                )
                .ok();
            match oldest {
                Some(id) => {
                    db.execute("DELETE FROM memory_entries WHERE id = ?1", [id])?;
                    db.execute(
                        "INSERT INTO memory_entries_fts(memory_entries_fts, rowid, content) VALUES('delete', ?1, '')",
                        [id],
                    )
                    .ok(); // fts sync is best-effort if fts5 is unavailable
                }
                None => return Ok(()),
            }
        }
    }

    /// Raw paginated read, newest first — mirrors a plain list view (not the
    /// capped prompt-injection composition, see [`MemoryManager::get_memory_context`]).
    pub fn get_memories(
        &self,
        scope: &str,
        agent_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MemoryEntry>, MemoryError> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, agent_id, scope, content, source_type, source_id, entry_date, entry_time, created_at
             FROM memory_entries
             WHERE scope = ?1 AND agent_id IS ?2
             ORDER BY created_at DESC
             LIMIT ?3 OFFSET ?4",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![scope, agent_id, limit as i64, offset as i64],
            row_to_memory_entry,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Whether long-term memory for `(scope, agent_id)` has crossed the read
    /// thresholds — the same point at which `get_memory_context` would start
    /// truncating. The maintenance job treats this as "summarization due".
    pub fn needs_summarize(&self, scope: &str, agent_id: Option<&str>) -> Result<bool, MemoryError> {
        let db = self.db.lock().unwrap();
        let (count, total_bytes): (i64, i64) = db.query_row(
            "SELECT COUNT(*), COALESCE(SUM(LENGTH(content) + LENGTH(entry_date) + LENGTH(entry_time) + 20), 0)
             FROM memory_entries
             WHERE scope = ?1 AND agent_id IS ?2",
            rusqlite::params![scope, agent_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(count > MEMORY_READ_MAX_ENTRIES as i64 || total_bytes > MEMORY_READ_MAX_BYTES as i64)
    }

    /// Oldest-first read-composition for prompt inclusion: all entries if
    /// within the read caps, otherwise the oldest 30 plus the newest 50.
    pub fn get_memory_context(&self, scope: &str, agent_id: Option<&str>) -> Result<String, MemoryError> {
        let entries = self.get_memories_for_summarize(scope, agent_id)?;
        if entries.is_empty() {
            return Ok(String::new());
        }
        let total_bytes: usize = entries.iter().map(|(d, c)| d.len() + c.len() + 20).sum();
        let composed = if entries.len() <= MEMORY_READ_MAX_ENTRIES && total_bytes <= MEMORY_READ_MAX_BYTES {
            entries
        } else {
            let n = entries.len();
            let tail_start = MEMORY_READ_KEEP_HEAD.max(n.saturating_sub(MEMORY_READ_KEEP_TAIL));
            let mut head: Vec<_> = entries[..MEMORY_READ_KEEP_HEAD.min(n)].to_vec();
            head.extend_from_slice(&entries[tail_start..]);
            head
        };
        Ok(format_entries(&composed))
    }

    /// All entries as `(date, content)` pairs in oldest-first order, ready for
    /// the summarization job (`replace_memories`) or for [`get_memory_context`].
    pub fn get_memories_for_summarize(
        &self,
        scope: &str,
        agent_id: Option<&str>,
    ) -> Result<Vec<(String, String)>, MemoryError> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT entry_date, entry_time, content FROM memory_entries
             WHERE scope = ?1 AND agent_id IS ?2
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(rusqlite::params![scope, agent_id], |row| {
            let date: String = row.get(0)?;
            let time: String = row.get(1)?;
            let content: String = row.get(2)?;
            Ok((format!("{date} {time}"), content))
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Replace every entry for `(scope, agent_id)` with `entries` — used by
    /// the maintenance job after an LLM-driven summarization pass.
    pub fn replace_memories(
        &self,
        scope: &str,
        agent_id: Option<&str>,
        entries: &[(String, String)],
    ) -> Result<(), MemoryError> {
        let now = chrono::Local::now();
        let created_at = now.to_rfc3339();
        let db = self.db.lock().unwrap();

        let old_ids: Vec<i64> = {
            let mut stmt = db.prepare("SELECT id FROM memory_entries WHERE scope = ?1 AND agent_id IS ?2")?;
            let rows = stmt.query_map(rusqlite::params![scope, agent_id], |row| row.get(0))?;
            rows.filter_map(|r| r.ok()).collect()
        };
        db.execute(
            "DELETE FROM memory_entries WHERE scope = ?1 AND agent_id IS ?2",
            rusqlite::params![scope, agent_id],
        )?;
        for id in old_ids {
            db.execute(
                "INSERT INTO memory_entries_fts(memory_entries_fts, rowid, content) VALUES('delete', ?1, '')",
                [id],
            )
            .ok();
        }

        for (date_str, content) in entries {
            let content = content.trim();
            if content.is_empty() {
                continue;
            }
            let (entry_date, entry_time) = split_date_time(date_str, &now);
            db.execute(
                "INSERT INTO memory_entries (agent_id, scope, content, entry_date, entry_time, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![agent_id, scope, content, entry_date, entry_time, created_at],
            )?;
            let id = db.last_insert_rowid();
            sync_memory_fts(&db, id, content)?;
        }
        Ok(())
    }

    /// Full-text search over long-term memory, optionally scoped.
    pub fn search_memories(
        &self,
        query: &str,
        scope: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, MemoryError> {
        let db = self.db.lock().unwrap();
        if crate::db::fts5_available(&db) {
            let sql = match scope {
                Some(_) => {
                    "SELECT m.id, m.agent_id, m.scope, m.content, m.source_type, m.source_id,
                            m.entry_date, m.entry_time, m.created_at
                     FROM memory_entries m
                     JOIN memory_entries_fts f ON m.id = f.rowid
                     WHERE memory_entries_fts MATCH ?1 AND m.scope = ?2
                     ORDER BY rank LIMIT ?3"
                }
                None => {
                    "SELECT m.id, m.agent_id, m.scope, m.content, m.source_type, m.source_id,
                            m.entry_date, m.entry_time, m.created_at
                     FROM memory_entries m
                     JOIN memory_entries_fts f ON m.id = f.rowid
                     WHERE memory_entries_fts MATCH ?1
                     ORDER BY rank LIMIT ?3"
                }
            };
            let mut stmt = db.prepare(sql)?;
            let rows = match scope {
                Some(s) => stmt.query_map(rusqlite::params![query, s, limit], row_to_memory_entry)?,
                None => stmt.query_map(rusqlite::params![query, query, limit], row_to_memory_entry)?,
            };
            Ok(rows.filter_map(|r| r.ok()).collect())
        } else {
            let like = format!("%{query}%");
            let sql = match scope {
                Some(_) => {
                    "SELECT id, agent_id, scope, content, source_type, source_id, entry_date, entry_time, created_at
                     FROM memory_entries WHERE content LIKE ?1 AND scope = ?2
                     ORDER BY created_at DESC LIMIT ?3"
                }
                None => {
                    "SELECT id, agent_id, scope, content, source_type, source_id, entry_date, entry_time, created_at
                     FROM memory_entries WHERE content LIKE ?1
                     ORDER BY created_at DESC LIMIT ?2"
                }
            };
            let mut stmt = db.prepare(sql)?;
            let rows = match scope {
                Some(s) => stmt.query_map(rusqlite::params![like, s, limit], row_to_memory_entry)?,
                None => stmt.query_map(rusqlite::params![like, limit], row_to_memory_entry)?,
            };
            Ok(rows.filter_map(|r| r.ok()).collect())
        }
    }

    // ---------------------------------------------------------------
    // Daily notes
    // ---------------------------------------------------------------

    /// Append to (or create) today's note. Append-only: existing content is
    /// never overwritten, only extended with a newline separator.
    pub fn append_daily_note(
        &self,
        scope: &str,
        agent_id: Option<&str>,
        note_date: &str,
        content: &str,
    ) -> Result<(), MemoryError> {
        let db = self.db.lock().unwrap();
        let existing: Option<(i64, String)> = db
            .query_row(
                "SELECT id, content FROM daily_notes WHERE note_date = ?1 AND scope = ?2 AND agent_id IS ?3",
                rusqlite::params![note_date, scope, agent_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();
        let now = chrono::Local::now().to_rfc3339();
        match existing {
            Some((id, prior)) => {
                let merged = format!("{prior}\n{content}");
                db.execute(
                    "UPDATE daily_notes SET content = ?1 WHERE id = ?2",
                    rusqlite::params![merged, id],
                )?;
            }
            None => {
                db.execute(
                    "INSERT INTO daily_notes (agent_id, scope, note_date, content, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![agent_id, scope, note_date, content, now],
                )?;
            }
        }
        Ok(())
    }

    pub fn get_daily_note(&self, scope: &str, agent_id: Option<&str>, note_date: &str) -> Result<String, MemoryError> {
        let db = self.db.lock().unwrap();
        let content: Option<String> = db
            .query_row(
                "SELECT content FROM daily_notes WHERE note_date = ?1 AND scope = ?2 AND agent_id IS ?3",
                rusqlite::params![note_date, scope, agent_id],
                |row| row.get(0),
            )
            .ok();
        Ok(content.unwrap_or_default())
    }

    /// Notes strictly before `before_date` not yet folded into long-term
    /// memory, oldest first — consumed by the daily-merge maintenance job.
    pub fn get_unprocessed_daily_notes(
        &self,
        scope: &str,
        agent_id: Option<&str>,
        before_date: &str,
    ) -> Result<Vec<DailyNote>, MemoryError> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, agent_id, scope, note_date, content, is_processed, processed_at, created_at
             FROM daily_notes
             WHERE note_date < ?1 AND is_processed = 0 AND scope = ?2 AND agent_id IS ?3
             ORDER BY note_date ASC",
        )?;
        let rows = stmt.query_map(rusqlite::params![before_date, scope, agent_id], row_to_daily_note)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn mark_daily_note_processed(
        &self,
        scope: &str,
        agent_id: Option<&str>,
        note_date: &str,
    ) -> Result<(), MemoryError> {
        let db = self.db.lock().unwrap();
        let now = chrono::Local::now().to_rfc3339();
        db.execute(
            "UPDATE daily_notes SET is_processed = 1, processed_at = ?1
             WHERE note_date = ?2 AND scope = ?3 AND agent_id IS ?4",
            rusqlite::params![now, note_date, scope, agent_id],
        )?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Conversation-turn bookkeeping used by the context builder (C6)
    // ---------------------------------------------------------------

    /// Count of conversation turns recorded for a session (used to report the
    /// running turn count back to the model in its session-info header).
    pub fn count_turns(&self, session_key: &str) -> Result<u32, MemoryError> {
        let db = self.db.lock().unwrap();
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM conversations WHERE session_key = ?1",
            [session_key],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    /// Record one tool invocation for frequency tracking (see [`get_top_tools`]).
    ///
    /// [`get_top_tools`]: MemoryManager::get_top_tools
    pub fn log_tool_call(&self, tool_name: &str, session_key: &str) -> Result<(), MemoryError> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        db.execute(
            "INSERT INTO tool_usage (tool_name, session_key, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![tool_name, session_key, now],
        )?;
        Ok(())
    }

    /// Most-frequently-called tool names over the trailing `days` window.
    pub fn get_top_tools(&self, days: u32, limit: usize) -> Result<Vec<String>, MemoryError> {
        let db = self.db.lock().unwrap();
        let since = (chrono::Utc::now() - chrono::Duration::days(days as i64)).to_rfc3339();
        let mut stmt = db.prepare(
            "SELECT tool_name, COUNT(*) as c FROM tool_usage
             WHERE created_at >= ?1
             GROUP BY tool_name
             ORDER BY c DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![since, limit as i64], |row| row.get::<_, String>(0))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Knowledge entries whose topic or tags mention one of `tool_names` —
    /// a loose correlation used to surface "hot" knowledge alongside
    /// frequently-used tools without requiring an explicit link table.
    pub fn get_hot_topics(&self, tool_names: &[String], limit: usize) -> Result<Vec<KnowledgeEntry>, MemoryError> {
        if tool_names.is_empty() {
            return Ok(Vec::new());
        }
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, topic, content, tags, created_at, updated_at FROM knowledge
             WHERE topic LIKE ?1 OR tags LIKE ?1
             ORDER BY updated_at DESC
             LIMIT ?2",
        )?;
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for name in tool_names {
            let like = format!("%{name}%");
            let rows = stmt.query_map(rusqlite::params![like, limit as i64], row_to_knowledge_entry)?;
            for row in rows.filter_map(|r| r.ok()) {
                if seen.insert(row.id) {
                    out.push(row);
                }
                if out.len() >= limit {
                    return Ok(out);
                }
            }
        }
        Ok(out)
    }

    // ---------------------------------------------------------------
    // Knowledge base — operator/bot-curated facts, FTS5-searched
    // ---------------------------------------------------------------

    pub fn knowledge_search(&self, query: &str, limit: usize) -> Result<Vec<KnowledgeEntry>, MemoryError> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT k.id, k.topic, k.content, k.tags, k.created_at, k.updated_at
             FROM knowledge k
             JOIN knowledge_fts f ON k.id = f.rowid
             WHERE knowledge_fts MATCH ?1
             ORDER BY rank
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![query, limit], row_to_knowledge_entry)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn knowledge_write(&self, topic: &str, content: &str, tags: &str) -> Result<(), MemoryError> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        let existing: Option<i64> = db
            .query_row("SELECT id FROM knowledge WHERE topic = ?1", [topic], |row| row.get(0))
            .ok();
        match existing {
            Some(id) => {
                db.execute(
                    "UPDATE knowledge SET content = ?1, tags = ?2, updated_at = ?3 WHERE id = ?4",
                    rusqlite::params![content, tags, now, id],
                )?;
                db.execute(
                    "INSERT INTO knowledge_fts(knowledge_fts, rowid, topic, content, tags) VALUES('delete', ?1, ?2, ?3, ?4)",
                    rusqlite::params![id, topic, content, tags],
                )
                .ok();
                db.execute(
                    "INSERT INTO knowledge_fts(rowid, topic, content, tags) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![id, topic, content, tags],
                )?;
            }
            None => {
                db.execute(
                    "INSERT INTO knowledge (topic, content, tags, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)",
                    rusqlite::params![topic, content, tags, now],
                )?;
                let id = db.last_insert_rowid();
                db.execute(
                    "INSERT INTO knowledge_fts(rowid, topic, content, tags) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![id, topic, content, tags],
                )?;
            }
        }
        Ok(())
    }
}

/// Splits a `"YYYY-MM-DD"` or `"YYYY-MM-DD HH:MM"` string into its date and
/// time parts, defaulting the time to `now` when absent.
fn split_date_time(date_str: &str, now: &chrono::DateTime<chrono::Local>) -> (String, String) {
    match date_str.split_once(' ') {
        Some((d, t)) => (d.to_string(), t.to_string()),
        None if !date_str.is_empty() => (date_str.to_string(), now.format("%H:%M").to_string()),
        None => (now.format("%Y-%m-%d").to_string(), now.format("%H:%M").to_string()),
    }
}

fn sync_memory_fts(db: &Connection, id: i64, content: &str) -> rusqlite::Result<()> {
    db.execute(
        "INSERT INTO memory_entries_fts(rowid, content) VALUES (?1, ?2)",
        rusqlite::params![id, content],
    )
    .map(|_| ())
    .or(Ok(())) // fts5 unavailable: silently skip, search() falls back to LIKE
}

fn row_to_memory_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryEntry> {
    Ok(MemoryEntry {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        scope: row.get(2)?,
        content: row.get(3)?,
        source_type: row.get(4)?,
        source_id: row.get(5)?,
        entry_date: row.get(6)?,
        entry_time: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn row_to_daily_note(row: &rusqlite::Row<'_>) -> rusqlite::Result<DailyNote> {
    Ok(DailyNote {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        scope: row.get(2)?,
        note_date: row.get(3)?,
        content: row.get(4)?,
        processed: row.get::<_, i64>(5)? != 0,
        processed_at: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn row_to_knowledge_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<KnowledgeEntry> {
    Ok(KnowledgeEntry {
        id: row.get(0)?,
        topic: row.get(1)?,
        content: row.get(2)?,
        tags: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

/// Parses `"- [YYYY-MM-DD HH:MM] content"` lines (as produced by
/// [`format_entries`]) back into `(date, content)` pairs. Entries may span
/// multiple lines; a new entry starts at the next `"- ["` marker or a `#`
/// heading.
pub fn parse_memory_entries(text: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut lines = text.lines().peekable();
    while let Some(line) = lines.next() {
        let trimmed = line.trim_start();
        if !trimmed.starts_with("- [") {
            continue;
        }
        let Some(close) = trimmed.find(']') else { continue };
        let date_part = trimmed[3..close].trim().to_string();
        let mut content = trimmed[close + 1..].trim().to_string();
        while let Some(next) = lines.peek() {
            let next_trimmed = next.trim_start();
            if next_trimmed.starts_with("- [") || next_trimmed.starts_with('#') {
                break;
            }
            if next_trimmed.is_empty() {
                lines.next();
                continue;
            }
            content.push('\n');
            content.push_str(next_trimmed);
            lines.next();
        }
        out.push((date_part, content));
    }
    out
}

/// Formats `(date, content)` pairs as `"- [date] content"` lines under a
/// `"# Long-term Memory"` heading, mirroring the original file format.
pub fn format_entries(entries: &[(String, String)]) -> String {
    if entries.is_empty() {
        return "# Long-term Memory\n\n".to_string();
    }
    let mut out = String::from("# Long-term Memory");
    for (date, content) in entries {
        out.push_str(&format!("\n- [{date}] {content}"));
    }
    out.push('\n');
    out
}

/// Render memories into a text block for prompt injection.
/// Priority: instruction > preference > fact > context.
/// Truncates to MAX_CONTEXT_CHARS.
fn render_context(memories: &[UserMemory]) -> String {
    let mut out = String::with_capacity(MAX_CONTEXT_CHARS);
    let mut current_cat = String::new();

    for mem in memories {
        let cat = mem.category.to_string();
        if cat != current_cat {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!("## {}\n", capitalize(&cat)));
            current_cat = cat;
        }
        let line = format!("- {}: {}\n", mem.key, mem.value);
        if out.len() + line.len() > MAX_CONTEXT_CHARS {
            break;
        }
        out.push_str(&line);
    }
    out
}

fn capitalize(s: &str) -> String {
    let mut c = s.chars();
    match c.next() {
        None => String::new(),
        Some(f) => f.to_uppercase().to_string() + c.as_str(),
    }
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserMemory> {
    let cat_str: String = row.get(2)?;
    let src_str: String = row.get(6)?;
    Ok(UserMemory {
        id: row.get(0)?,
        user_id: row.get(1)?,
        category: cat_str.parse().unwrap_or(MemoryCategory::Context),
        key: row.get(3)?,
        value: row.get(4)?,
        confidence: row.get(5)?,
        source: src_str.parse().unwrap_or(MemorySource::Inferred),
        expires_at: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> MemoryManager {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        MemoryManager::new(conn)
    }

    #[test]
    fn append_and_read_memory_roundtrips() {
        let mgr = manager();
        mgr.append_memory("global", None, "likes dark mode", Some("user_said"), None)
            .unwrap();
        let entries = mgr.get_memories("global", None, 10, 0).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, "likes dark mode");
    }

    #[test]
    fn write_cap_evicts_oldest_entry() {
        let mgr = manager();
        let batch: Vec<(String, String)> = (0..105)
            .map(|i| (format!("2026-01-01 {:02}:00", i % 24), format!("fact {i}")))
            .collect();
        mgr.append_memories("global", None, &batch, Some("test")).unwrap();
        let all = mgr.get_memories_for_summarize("global", None).unwrap();
        assert!(all.len() <= 100);
        // the oldest entries ("fact 0", "fact 1", ...) should have been evicted
        assert!(!all.iter().any(|(_, c)| c == "fact 0"));
        assert!(all.iter().any(|(_, c)| c == "fact 104"));
    }

    #[test]
    fn needs_summarize_reflects_the_read_entry_threshold() {
        let mgr = manager();
        assert!(!mgr.needs_summarize("global", None).unwrap());

        let batch: Vec<(String, String)> = (0..85)
            .map(|i| (format!("2026-01-01 {:02}:00", i % 24), format!("fact {i}")))
            .collect();
        mgr.append_memories("global", None, &batch, Some("test")).unwrap();
        assert!(mgr.needs_summarize("global", None).unwrap());
    }

    #[test]
    fn read_composition_returns_head_and_tail_when_over_threshold() {
        let mgr = manager();
        let batch: Vec<(String, String)> = (0..90)
            .map(|i| (format!("2026-01-01 {:02}:00", i % 24), format!("entry {i}")))
            .collect();
        mgr.append_memories("global", None, &batch, None).unwrap();
        let rendered = mgr.get_memory_context("global", None).unwrap();
        // head (oldest 30) and tail (newest 50) should both be present...
        assert!(rendered.contains("entry 0"));
        assert!(rendered.contains("entry 89"));
        // ...but the middle should have been dropped.
        assert!(!rendered.contains("entry 50"));
    }

    #[test]
    fn replace_memories_discards_prior_entries() {
        let mgr = manager();
        mgr.append_memory("global", None, "old fact", None, None).unwrap();
        mgr.replace_memories("global", None, &[("2026-02-01 09:00".to_string(), "new fact".to_string())])
            .unwrap();
        let all = mgr.get_memories_for_summarize("global", None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].1, "new fact");
    }

    #[test]
    fn daily_notes_append_and_mark_processed() {
        let mgr = manager();
        mgr.append_daily_note("global", None, "2026-01-01", "line one").unwrap();
        mgr.append_daily_note("global", None, "2026-01-01", "line two").unwrap();
        let note = mgr.get_daily_note("global", None, "2026-01-01").unwrap();
        assert_eq!(note, "line one\nline two");

        let unprocessed = mgr.get_unprocessed_daily_notes("global", None, "2026-01-02").unwrap();
        assert_eq!(unprocessed.len(), 1);

        mgr.mark_daily_note_processed("global", None, "2026-01-01").unwrap();
        let unprocessed = mgr.get_unprocessed_daily_notes("global", None, "2026-01-02").unwrap();
        assert!(unprocessed.is_empty());
    }

    #[test]
    fn tool_usage_tracks_frequency() {
        let mgr = manager();
        mgr.log_tool_call("search_files", "sess:1").unwrap();
        mgr.log_tool_call("search_files", "sess:1").unwrap();
        mgr.log_tool_call("read_file", "sess:1").unwrap();
        let top = mgr.get_top_tools(30, 5).unwrap();
        assert_eq!(top.first().map(String::as_str), Some("search_files"));
    }

    #[test]
    fn parse_and_format_entries_roundtrip() {
        let entries = vec![
            ("2026-01-01 09:00".to_string(), "first fact".to_string()),
            ("2026-01-02 10:30".to_string(), "second fact".to_string()),
        ];
        let text = format_entries(&entries);
        let parsed = parse_memory_entries(&text);
        assert_eq!(parsed, entries);
    }

    #[test]
    fn knowledge_write_then_search_finds_entry() {
        let mgr = manager();
        mgr.knowledge_write("deploy_steps", "run cargo build then systemctl restart", "ops,deploy")
            .unwrap();
        let found = mgr.knowledge_search("deploy", 5).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].topic, "deploy_steps");
    }
}
