//! Durable store: relational source of truth for sessions and messages.
//!
//! The SQLite backend keeps one connection behind a mutex and pushes all
//! database work through `spawn_blocking`, so callers never block a
//! runtime worker on disk I/O. Message inserts are keyed by message id
//! and therefore idempotent: replaying a migration batch is safe.

use crate::error::{EngineError, Result};
use crate::model::{MessageRecord, RoleCounts, SenderRole, SessionRecord, SessionStatus};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Async trait for the durable tier.
///
/// Every call may block on I/O and is treated as a network round trip.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Upsert a session row keyed by session id.
    async fn persist_session(&self, session: &SessionRecord) -> Result<()>;

    /// Load a session row, if present.
    async fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>>;

    /// Idempotent batch append keyed by message id.
    ///
    /// Returns the number of rows actually inserted; replayed messages
    /// count as zero.
    async fn persist_messages(&self, session_id: &str, batch: &[MessageRecord]) -> Result<usize>;

    /// Full ordered history for a session, sorted by `order`.
    async fn load_history(&self, session_id: &str) -> Result<Vec<MessageRecord>>;

    /// Sessions for an owner, last-activity descending.
    async fn list_sessions(&self, owner: &str) -> Result<Vec<SessionRecord>>;

    /// Highest persisted `order` for a session.
    async fn max_order(&self, session_id: &str) -> Result<Option<u64>>;

    /// Number of persisted rows for a session.
    async fn message_count(&self, session_id: &str) -> Result<u64>;

    /// Counts recomputed by sender role, for reconciliation and stats.
    async fn role_counts(&self, session_id: &str) -> Result<RoleCounts>;

    /// Hard delete a session and all its messages.
    async fn delete_session(&self, session_id: &str) -> Result<()>;

    /// Lightweight liveness round trip.
    async fn probe(&self) -> Result<()>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    session_id    TEXT PRIMARY KEY,
    owner         TEXT NOT NULL,
    title         TEXT NOT NULL,
    created_at    INTEGER NOT NULL,
    last_activity INTEGER NOT NULL,
    total_count   INTEGER NOT NULL DEFAULT 0,
    user_count    INTEGER NOT NULL DEFAULT 0,
    agent_count   INTEGER NOT NULL DEFAULT 0,
    status        TEXT NOT NULL DEFAULT 'active'
);
CREATE INDEX IF NOT EXISTS idx_sessions_owner_created ON sessions (owner, created_at);
CREATE INDEX IF NOT EXISTS idx_sessions_owner_activity ON sessions (owner, last_activity);
CREATE INDEX IF NOT EXISTS idx_sessions_status_created ON sessions (status, created_at);

CREATE TABLE IF NOT EXISTS messages (
    message_id      TEXT PRIMARY KEY,
    session_id      TEXT NOT NULL REFERENCES sessions (session_id) ON DELETE CASCADE,
    role            TEXT NOT NULL,
    content         TEXT NOT NULL,
    msg_order       INTEGER NOT NULL,
    is_tool_query   INTEGER NOT NULL DEFAULT 0,
    tool_name       TEXT,
    tool_parameters TEXT,
    tool_result     TEXT,
    created_at      INTEGER NOT NULL,
    extra           TEXT,
    UNIQUE (session_id, msg_order)
);
CREATE INDEX IF NOT EXISTS idx_messages_session_order ON messages (session_id, msg_order);
CREATE INDEX IF NOT EXISTS idx_messages_session_created ON messages (session_id, created_at);
CREATE INDEX IF NOT EXISTS idx_messages_role_created ON messages (role, created_at);
CREATE INDEX IF NOT EXISTS idx_messages_tool_created ON messages (is_tool_query, created_at);
";

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or_default()
}

fn json_to_text(v: &Value) -> Result<Option<String>> {
    if v.is_null() {
        Ok(None)
    } else {
        Ok(Some(serde_json::to_string(v)?))
    }
}

fn text_to_json(s: Option<String>) -> Result<Value> {
    match s {
        Some(s) => Ok(serde_json::from_str(&s)?),
        None => Ok(Value::Null),
    }
}

/// Raw row shape before role/JSON decoding.
struct RawMessage {
    id: String,
    session_id: String,
    role: String,
    content: String,
    order: i64,
    is_tool_query: bool,
    tool_name: Option<String>,
    tool_parameters: Option<String>,
    tool_result: Option<String>,
    created_at: i64,
    extra: Option<String>,
}

impl RawMessage {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            role: row.get(2)?,
            content: row.get(3)?,
            order: row.get(4)?,
            is_tool_query: row.get(5)?,
            tool_name: row.get(6)?,
            tool_parameters: row.get(7)?,
            tool_result: row.get(8)?,
            created_at: row.get(9)?,
            extra: row.get(10)?,
        })
    }

    fn into_record(self) -> Result<MessageRecord> {
        let tool_parameters = match self.tool_parameters {
            Some(s) => Some(serde_json::from_str(&s)?),
            None => None,
        };
        Ok(MessageRecord {
            id: self.id,
            session_id: self.session_id,
            role: SenderRole::parse(&self.role)?,
            content: self.content,
            order: to_u64(self.order),
            is_tool_query: self.is_tool_query,
            tool_name: self.tool_name,
            tool_parameters,
            tool_result: self.tool_result,
            created_at: to_u64(self.created_at),
            extra: text_to_json(self.extra)?,
        })
    }
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(SessionRecord, String)> {
    let status: String = row.get(8)?;
    Ok((
        SessionRecord {
            id: row.get(0)?,
            owner: row.get(1)?,
            title: row.get(2)?,
            created_at: to_u64(row.get(3)?),
            last_activity: to_u64(row.get(4)?),
            total_count: to_u64(row.get(5)?),
            user_count: to_u64(row.get(6)?),
            agent_count: to_u64(row.get(7)?),
            // Placeholder until the status string is parsed by the caller.
            status: SessionStatus::Active,
        },
        status,
    ))
}

fn decode_session(raw: (SessionRecord, String)) -> Result<SessionRecord> {
    let (mut session, status) = raw;
    session.status = SessionStatus::parse(&status)?;
    Ok(session)
}

const SELECT_SESSION: &str = "SELECT session_id, owner, title, created_at, last_activity, \
     total_count, user_count, agent_count, status FROM sessions";

const SELECT_MESSAGE: &str = "SELECT message_id, session_id, role, content, msg_order, \
     is_tool_query, tool_name, tool_parameters, tool_result, created_at, extra FROM messages";

/// SQLite-backed durable store.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file and apply the schema.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        Self::init(conn, busy_timeout)
    }

    /// Open an in-memory database (tests).
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, Duration::from_secs(5))
    }

    fn init(conn: Connection, busy_timeout: Duration) -> Result<Self> {
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|e| EngineError::Lock(e.to_string()))?;
            f(&mut conn)
        })
        .await?
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn persist_session(&self, session: &SessionRecord) -> Result<()> {
        let s = session.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sessions (session_id, owner, title, created_at, last_activity, \
                 total_count, user_count, agent_count, status) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                 ON CONFLICT(session_id) DO UPDATE SET \
                 title = excluded.title, \
                 last_activity = excluded.last_activity, \
                 total_count = excluded.total_count, \
                 user_count = excluded.user_count, \
                 agent_count = excluded.agent_count, \
                 status = excluded.status",
                params![
                    s.id,
                    s.owner,
                    s.title,
                    to_i64(s.created_at),
                    to_i64(s.last_activity),
                    to_i64(s.total_count),
                    to_i64(s.user_count),
                    to_i64(s.agent_count),
                    s.status.as_str(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let id = session_id.to_string();
        self.with_conn(move |conn| {
            let raw = conn
                .query_row(
                    &format!("{SELECT_SESSION} WHERE session_id = ?1"),
                    params![id],
                    session_from_row,
                )
                .optional()?;
            raw.map(decode_session).transpose()
        })
        .await
    }

    async fn persist_messages(&self, session_id: &str, batch: &[MessageRecord]) -> Result<usize> {
        if let Some(stray) = batch.iter().find(|m| m.session_id != session_id) {
            return Err(EngineError::validation(format!(
                "message {} belongs to session {}, not {session_id}",
                stray.id, stray.session_id
            )));
        }
        let batch = batch.to_vec();
        let id = session_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut inserted = 0;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO messages (message_id, session_id, role, content, msg_order, \
                     is_tool_query, tool_name, tool_parameters, tool_result, created_at, extra) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                     ON CONFLICT(message_id) DO NOTHING",
                )?;
                for m in &batch {
                    let parameters = match &m.tool_parameters {
                        Some(v) => Some(serde_json::to_string(v)?),
                        None => None,
                    };
                    inserted += stmt.execute(params![
                        m.id,
                        m.session_id,
                        m.role.as_str(),
                        m.content,
                        to_i64(m.order),
                        m.is_tool_query,
                        m.tool_name,
                        parameters,
                        m.tool_result,
                        to_i64(m.created_at),
                        json_to_text(&m.extra)?,
                    ])?;
                }
            }
            tx.commit()?;
            debug!(session_id = %id, batch = batch.len(), inserted, "persisted message batch");
            Ok(inserted)
        })
        .await
    }

    async fn load_history(&self, session_id: &str) -> Result<Vec<MessageRecord>> {
        let id = session_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_MESSAGE} WHERE session_id = ?1 ORDER BY msg_order ASC"
            ))?;
            let raw: Vec<RawMessage> = stmt
                .query_map(params![id], RawMessage::from_row)?
                .collect::<rusqlite::Result<_>>()?;
            raw.into_iter().map(RawMessage::into_record).collect()
        })
        .await
    }

    async fn list_sessions(&self, owner: &str) -> Result<Vec<SessionRecord>> {
        let owner = owner.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_SESSION} WHERE owner = ?1 ORDER BY last_activity DESC"
            ))?;
            let raw: Vec<(SessionRecord, String)> = stmt
                .query_map(params![owner], session_from_row)?
                .collect::<rusqlite::Result<_>>()?;
            raw.into_iter().map(decode_session).collect()
        })
        .await
    }

    async fn max_order(&self, session_id: &str) -> Result<Option<u64>> {
        let id = session_id.to_string();
        self.with_conn(move |conn| {
            let max: Option<i64> = conn.query_row(
                "SELECT MAX(msg_order) FROM messages WHERE session_id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            Ok(max.map(to_u64))
        })
        .await
    }

    async fn message_count(&self, session_id: &str) -> Result<u64> {
        let id = session_id.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            Ok(to_u64(count))
        })
        .await
    }

    async fn role_counts(&self, session_id: &str) -> Result<RoleCounts> {
        let id = session_id.to_string();
        self.with_conn(move |conn| {
            let (total, user, agent, tool): (i64, Option<i64>, Option<i64>, Option<i64>) = conn
                .query_row(
                    "SELECT COUNT(*), \
                     SUM(CASE WHEN role = 'user' THEN 1 ELSE 0 END), \
                     SUM(CASE WHEN role = 'agent' THEN 1 ELSE 0 END), \
                     SUM(CASE WHEN is_tool_query THEN 1 ELSE 0 END) \
                     FROM messages WHERE session_id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )?;
            Ok(RoleCounts {
                total: to_u64(total),
                user: to_u64(user.unwrap_or(0)),
                agent: to_u64(agent.unwrap_or(0)),
                tool_queries: to_u64(tool.unwrap_or(0)),
            })
        })
        .await
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        let id = session_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM messages WHERE session_id = ?1", params![id])?;
            tx.execute("DELETE FROM sessions WHERE session_id = ?1", params![id])?;
            tx.commit()?;
            debug!(session_id = %id, "hard-deleted session");
            Ok(())
        })
        .await
    }

    async fn probe(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .await
    }
}
