use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use palaver_common::{ChatMessage, Error, Result, Role, ToolCall};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

/// Provider-reported accounting attached to a persisted message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageMetrics {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub latency_ms: Option<u64>,
    pub model: Option<String>,
    pub provider: Option<String>,
}

/// A message row as it goes in: the store assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub tool_call_id: Option<String>,
    pub sequence_number: i64,
    pub metrics: MessageMetrics,
}

/// A message row as it comes back out.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub tool_call_id: Option<String>,
    pub sequence_number: i64,
    pub metrics: MessageMetrics,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    /// Project the persisted row back into the in-flight chat shape.
    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
            tool_calls: self.tool_calls.clone(),
            tool_call_id: self.tool_call_id.clone(),
            attachments: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversationRow {
    pub id: String,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub last_summarized_seq: i64,
    pub message_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A cold-memory hit: a past message with its cosine similarity score.
#[derive(Debug, Clone)]
pub struct ScoredMessage {
    pub message: StoredMessage,
    pub score: f32,
}

/// Persistent storage for conversations and their messages.
///
/// Cheap to share across tasks; the connection sits behind a mutex.
/// Background workers should not reuse the foreground handle — call
/// [`ConversationStore::background_handle`] to get a session of their own.
#[derive(Clone)]
pub struct ConversationStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
    embedding_dim: usize,
}

impl ConversationStore {
    pub fn open(db_path: &Path, embedding_dim: usize) -> Result<Self> {
        info!("opening conversation store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(db_path.to_path_buf()),
            embedding_dim,
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn in_memory(embedding_dim: usize) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        let store = Self { conn: Arc::new(Mutex::new(conn)), path: None, embedding_dim };
        store.run_migrations()?;
        Ok(store)
    }

    /// A separate session for background work (embedding, summarization).
    /// File-backed stores get a fresh connection; in-memory stores share
    /// the existing one, which only matters in tests.
    pub fn background_handle(&self) -> Result<Self> {
        match &self.path {
            Some(path) => Self::open(path, self.embedding_dim),
            None => Ok(self.clone()),
        }
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                title TEXT,
                summary TEXT,
                last_summarized_seq INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                tool_calls TEXT,
                tool_call_id TEXT,
                sequence_number INTEGER NOT NULL,
                prompt_tokens INTEGER,
                completion_tokens INTEGER,
                latency_ms INTEGER,
                model TEXT,
                provider TEXT,
                embedding BLOB,
                embedding_dim INTEGER,
                created_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_conv_seq
                ON messages(conversation_id, sequence_number);

            CREATE INDEX IF NOT EXISTS idx_messages_conv
                ON messages(conversation_id, sequence_number DESC);",
        )
        .map_err(|e| Error::Database(format!("migration failed: {e}")))?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create the conversation row if it does not exist yet; the title is
    /// set once, from the first user message.
    pub fn ensure_conversation(&self, id: &str, title: Option<&str>) -> Result<()> {
        self.lock()
            .execute(
                "INSERT INTO conversations (id, title) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET updated_at = datetime('now')",
                params![id, title],
            )
            .map_err(|e| Error::Database(format!("failed to upsert conversation: {e}")))?;
        Ok(())
    }

    /// Next free sequence number for a conversation (1-based, gapless).
    pub fn next_sequence_number(&self, conversation_id: &str) -> Result<i64> {
        let seq: i64 = self
            .lock()
            .query_row(
                "SELECT COALESCE(MAX(sequence_number), 0) + 1 FROM messages
                 WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(format!("failed to read sequence number: {e}")))?;
        Ok(seq)
    }

    /// Append one message. The unique (conversation, sequence) index makes
    /// replays fail instead of duplicating rows.
    pub fn append_message(&self, msg: &NewMessage) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let tool_calls_json = msg
            .tool_calls
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.lock()
            .execute(
                "INSERT INTO messages (id, conversation_id, role, content, tool_calls,
                    tool_call_id, sequence_number, prompt_tokens, completion_tokens,
                    latency_ms, model, provider, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    id,
                    msg.conversation_id,
                    msg.role.as_str(),
                    msg.content,
                    tool_calls_json,
                    msg.tool_call_id,
                    msg.sequence_number,
                    msg.metrics.prompt_tokens,
                    msg.metrics.completion_tokens,
                    msg.metrics.latency_ms,
                    msg.metrics.model,
                    msg.metrics.provider,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| Error::Database(format!("failed to append message: {e}")))?;

        self.lock()
            .execute(
                "UPDATE conversations SET updated_at = datetime('now') WHERE id = ?1",
                params![msg.conversation_id],
            )
            .map_err(|e| Error::Database(format!("failed to touch conversation: {e}")))?;

        Ok(id)
    }

    /// The hot window: most recent `limit` messages in chronological order.
    pub fn recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, conversation_id, role, content, tool_calls, tool_call_id,
                        sequence_number, prompt_tokens, completion_tokens, latency_ms,
                        model, provider, embedding, embedding_dim, created_at
                 FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY sequence_number DESC
                 LIMIT ?2",
            )
            .map_err(|e| Error::Database(format!("failed to prepare window query: {e}")))?;

        let mut messages = collect_messages(&mut stmt, params![conversation_id, limit as i64])?;
        // Query is DESC for an efficient tail fetch; flip to chronological.
        messages.reverse();
        Ok(messages)
    }

    /// Messages with sequence numbers in (after_seq, after_seq + limit],
    /// chronological. Used by the summarizer to fetch the unsummarized delta.
    pub fn messages_after(
        &self,
        conversation_id: &str,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, conversation_id, role, content, tool_calls, tool_call_id,
                        sequence_number, prompt_tokens, completion_tokens, latency_ms,
                        model, provider, embedding, embedding_dim, created_at
                 FROM messages
                 WHERE conversation_id = ?1 AND sequence_number > ?2
                 ORDER BY sequence_number ASC
                 LIMIT ?3",
            )
            .map_err(|e| Error::Database(format!("failed to prepare range query: {e}")))?;

        collect_messages(&mut stmt, params![conversation_id, after_seq, limit as i64])
    }

    pub fn conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.lock()
            .query_row(
                "SELECT c.id, c.title, c.summary, c.last_summarized_seq, c.created_at, c.updated_at,
                        (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id)
                 FROM conversations c WHERE c.id = ?1",
                params![id],
                row_to_conversation,
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to load conversation: {e}")))
    }

    pub fn list_conversations(&self, limit: usize) -> Result<Vec<ConversationRow>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT c.id, c.title, c.summary, c.last_summarized_seq, c.created_at, c.updated_at,
                        (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id)
                 FROM conversations c
                 ORDER BY c.updated_at DESC
                 LIMIT ?1",
            )
            .map_err(|e| Error::Database(format!("failed to prepare list query: {e}")))?;

        let rows = stmt
            .query_map(params![limit as i64], row_to_conversation)
            .map_err(|e| Error::Database(format!("failed to list conversations: {e}")))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| Error::Database(format!("failed to read row: {e}")))?);
        }
        Ok(out)
    }

    pub fn delete_conversation(&self, id: &str) -> Result<bool> {
        let deleted = self
            .lock()
            .execute("DELETE FROM conversations WHERE id = ?1", params![id])
            .map_err(|e| Error::Database(format!("failed to delete conversation: {e}")))?;
        Ok(deleted > 0)
    }

    pub fn conversation_summary(&self, id: &str) -> Result<Option<(Option<String>, i64)>> {
        self.lock()
            .query_row(
                "SELECT summary, last_summarized_seq FROM conversations WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to read summary: {e}")))
    }

    /// Atomically replace the rolling summary and its watermark.
    pub fn update_summary(&self, id: &str, summary: &str, last_seq: i64) -> Result<()> {
        self.lock()
            .execute(
                "UPDATE conversations
                 SET summary = ?2, last_summarized_seq = ?3, updated_at = datetime('now')
                 WHERE id = ?1",
                params![id, summary, last_seq],
            )
            .map_err(|e| Error::Database(format!("failed to update summary: {e}")))?;
        Ok(())
    }

    /// Late embedding write. The row is otherwise immutable; a dimension
    /// mismatch is rejected, never coerced.
    pub fn update_message_embedding(&self, message_id: &str, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.embedding_dim {
            return Err(Error::Database(format!(
                "embedding dimension mismatch: got {}, expected {}",
                embedding.len(),
                self.embedding_dim
            )));
        }

        self.lock()
            .execute(
                "UPDATE messages SET embedding = ?2, embedding_dim = ?3 WHERE id = ?1",
                params![message_id, embedding_to_blob(embedding), embedding.len() as i64],
            )
            .map_err(|e| Error::Database(format!("failed to write embedding: {e}")))?;
        Ok(())
    }

    /// Cold memory recall: the `limit` most similar embedded messages in
    /// this conversation with sequence_number < `before_seq` (i.e. outside
    /// the hot window). Similarity is cosine over the stored vectors.
    pub fn similar_messages(
        &self,
        conversation_id: &str,
        query: &[f32],
        limit: usize,
        before_seq: i64,
    ) -> Result<Vec<ScoredMessage>> {
        if query.len() != self.embedding_dim {
            return Err(Error::Database(format!(
                "query embedding dimension mismatch: got {}, expected {}",
                query.len(),
                self.embedding_dim
            )));
        }

        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, conversation_id, role, content, tool_calls, tool_call_id,
                        sequence_number, prompt_tokens, completion_tokens, latency_ms,
                        model, provider, embedding, embedding_dim, created_at
                 FROM messages
                 WHERE conversation_id = ?1
                   AND sequence_number < ?2
                   AND embedding IS NOT NULL
                   AND embedding_dim = ?3",
            )
            .map_err(|e| Error::Database(format!("failed to prepare similarity query: {e}")))?;

        let candidates = collect_messages(
            &mut stmt,
            params![conversation_id, before_seq, self.embedding_dim as i64],
        )?;
        drop(stmt);
        drop(conn);

        let mut scored: Vec<ScoredMessage> = candidates
            .into_iter()
            .filter_map(|message| {
                let score = cosine_similarity(query, message.embedding.as_ref()?);
                Some(ScoredMessage { message, score })
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    let created: String = row.get(4)?;
    let updated: String = row.get(5)?;
    Ok(ConversationRow {
        id: row.get(0)?,
        title: row.get(1)?,
        summary: row.get(2)?,
        last_summarized_seq: row.get(3)?,
        created_at: parse_timestamp(&created),
        updated_at: parse_timestamp(&updated),
        message_count: row.get(6)?,
    })
}

fn collect_messages(
    stmt: &mut rusqlite::Statement<'_>,
    params: impl rusqlite::Params,
) -> Result<Vec<StoredMessage>> {
    let rows = stmt
        .query_map(params, |row| {
            let role_raw: String = row.get(2)?;
            let tool_calls_raw: Option<String> = row.get(4)?;
            let embedding_raw: Option<Vec<u8>> = row.get(12)?;
            let created_raw: String = row.get(14)?;
            Ok(StoredMessage {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                role: role_raw.parse().unwrap_or(Role::User),
                content: row.get(3)?,
                tool_calls: tool_calls_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
                tool_call_id: row.get(5)?,
                sequence_number: row.get(6)?,
                metrics: MessageMetrics {
                    prompt_tokens: row.get(7)?,
                    completion_tokens: row.get(8)?,
                    latency_ms: row.get(9)?,
                    model: row.get(10)?,
                    provider: row.get(11)?,
                },
                embedding: embedding_raw.as_deref().map(blob_to_embedding),
                created_at: parse_timestamp(&created_raw),
            })
        })
        .map_err(|e| Error::Database(format!("failed to query messages: {e}")))?;

    let mut messages = Vec::new();
    for row in rows {
        messages.push(row.map_err(|e| Error::Database(format!("failed to read message row: {e}")))?);
    }
    Ok(messages)
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .map(|naive| naive.and_utc())
        })
        .unwrap_or_else(|_| Utc::now())
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
