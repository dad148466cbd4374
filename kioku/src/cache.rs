//! Cache tier: fast ephemeral per-session message buffer.
//!
//! The cache holds a *mirror* of recent session state, never the sole
//! copy once a migration has committed. Messages carry a flushed marker
//! so that eviction can refuse to drop anything that has not yet landed
//! in the durable store.

use crate::error::{EngineError, Result};
use crate::model::{MessageRecord, SessionRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Async trait for the ephemeral cache tier.
///
/// Implementations must be `Send + Sync`; every call may be a network
/// round trip and can fail with [`EngineError::TierUnavailable`].
#[async_trait]
pub trait CacheTier: Send + Sync {
    /// Upsert the session mirror (counters, timestamps, status).
    async fn put_session(&self, session: &SessionRecord) -> Result<()>;

    /// Read the session mirror, if cached.
    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>>;

    /// Append a message to the session buffer, initially unflushed.
    async fn append(&self, session_id: &str, message: &MessageRecord) -> Result<()>;

    /// Insert a session mirror together with already-durable history.
    ///
    /// Used to rehydrate a resumed session; the messages are marked
    /// flushed so a later eviction will not rewrite them.
    async fn hydrate(&self, session: &SessionRecord, history: &[MessageRecord]) -> Result<()>;

    /// Most-recent-first read of up to `limit` buffered messages.
    async fn read_recent(&self, session_id: &str, limit: usize) -> Result<Vec<MessageRecord>>;

    /// All messages not yet confirmed durable, in `order`.
    async fn unflushed(&self, session_id: &str) -> Result<Vec<MessageRecord>>;

    /// Mark the given message ids as durably persisted.
    async fn mark_flushed(&self, session_id: &str, ids: &[String]) -> Result<()>;

    /// Highest `order` currently buffered for the session.
    async fn max_order(&self, session_id: &str) -> Result<Option<u64>>;

    /// Suspend or resume idle-based eviction for a session.
    ///
    /// Suspended entries are skipped by [`idle_sessions`](Self::idle_sessions);
    /// the migration coordinator suspends a session for the whole
    /// `pending`/`migrating`/`failed` window.
    async fn set_ttl_suspended(&self, session_id: &str, suspended: bool) -> Result<()>;

    /// Sessions idle since before `cutoff_ms` and not TTL-suspended.
    async fn idle_sessions(&self, cutoff_ms: u64) -> Result<Vec<String>>;

    /// Drop a fully-flushed entry. Fails if unflushed messages remain.
    async fn evict(&self, session_id: &str) -> Result<()>;

    /// Drop an entry unconditionally (administrative hard delete only).
    async fn purge(&self, session_id: &str) -> Result<()>;

    /// Lightweight liveness round trip.
    async fn probe(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
struct CachedMessage {
    record: MessageRecord,
    flushed: bool,
}

#[derive(Debug)]
struct CacheEntry {
    session: SessionRecord,
    messages: Vec<CachedMessage>,
    ttl_suspended: bool,
}

/// In-memory cache tier.
///
/// Process-local and lost on restart, which is exactly the lifetime the
/// engine assumes for this tier: the durable store remains the source
/// of truth for anything committed.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheTier for MemoryCache {
    async fn put_session(&self, session: &SessionRecord) -> Result<()> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(&session.id) {
            Some(entry) => entry.session = session.clone(),
            None => {
                entries.insert(
                    session.id.clone(),
                    CacheEntry {
                        session: session.clone(),
                        messages: Vec::new(),
                        ttl_suspended: false,
                    },
                );
            }
        }
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        Ok(self
            .entries
            .read()
            .await
            .get(session_id)
            .map(|e| e.session.clone()))
    }

    async fn append(&self, session_id: &str, message: &MessageRecord) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(session_id)
            .ok_or_else(|| EngineError::not_found(session_id))?;
        entry.messages.push(CachedMessage {
            record: message.clone(),
            flushed: false,
        });
        Ok(())
    }

    async fn hydrate(&self, session: &SessionRecord, history: &[MessageRecord]) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(
            session.id.clone(),
            CacheEntry {
                session: session.clone(),
                messages: history
                    .iter()
                    .map(|m| CachedMessage {
                        record: m.clone(),
                        flushed: true,
                    })
                    .collect(),
                ttl_suspended: false,
            },
        );
        debug!(session_id = %session.id, messages = history.len(), "rehydrated session cache");
        Ok(())
    }

    async fn read_recent(&self, session_id: &str, limit: usize) -> Result<Vec<MessageRecord>> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(session_id)
            .ok_or_else(|| EngineError::not_found(session_id))?;
        Ok(entry
            .messages
            .iter()
            .rev()
            .take(limit)
            .map(|m| m.record.clone())
            .collect())
    }

    async fn unflushed(&self, session_id: &str) -> Result<Vec<MessageRecord>> {
        let entries = self.entries.read().await;
        let Some(entry) = entries.get(session_id) else {
            return Ok(Vec::new());
        };
        let mut pending: Vec<MessageRecord> = entry
            .messages
            .iter()
            .filter(|m| !m.flushed)
            .map(|m| m.record.clone())
            .collect();
        pending.sort_by_key(|m| m.order);
        Ok(pending)
    }

    async fn mark_flushed(&self, session_id: &str, ids: &[String]) -> Result<()> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(session_id) {
            for msg in &mut entry.messages {
                if ids.contains(&msg.record.id) {
                    msg.flushed = true;
                }
            }
        }
        Ok(())
    }

    async fn max_order(&self, session_id: &str) -> Result<Option<u64>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(session_id)
            .and_then(|e| e.messages.iter().map(|m| m.record.order).max()))
    }

    async fn set_ttl_suspended(&self, session_id: &str, suspended: bool) -> Result<()> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(session_id) {
            entry.ttl_suspended = suspended;
        }
        Ok(())
    }

    async fn idle_sessions(&self, cutoff_ms: u64) -> Result<Vec<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|(_, e)| !e.ttl_suspended && e.session.last_activity < cutoff_ms)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn evict(&self, session_id: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(session_id) {
            let pending = entry.messages.iter().filter(|m| !m.flushed).count();
            if pending > 0 {
                return Err(EngineError::consistency(format!(
                    "refusing to evict session {session_id}: {pending} unflushed messages"
                )));
            }
            entries.remove(session_id);
            debug!(session_id = %session_id, "evicted session from cache");
        }
        Ok(())
    }

    async fn purge(&self, session_id: &str) -> Result<()> {
        self.entries.write().await.remove(session_id);
        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        // Taking the read lock is the whole round trip for this backend.
        let _ = self.entries.read().await.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewMessage;

    fn message(session_id: &str, order: u64, content: &str) -> MessageRecord {
        MessageRecord::from_new(session_id, order, NewMessage::user(content))
    }

    #[tokio::test]
    async fn test_append_and_read_recent() {
        let cache = MemoryCache::new();
        let session = SessionRecord::new("alice", None);
        cache.put_session(&session).await.unwrap();

        for i in 1..=3 {
            cache
                .append(&session.id, &message(&session.id, i, &format!("m{i}")))
                .await
                .unwrap();
        }

        let recent = cache.read_recent(&session.id, 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].order, 3);
        assert_eq!(recent[1].order, 2);
    }

    #[tokio::test]
    async fn test_evict_refuses_unflushed() {
        let cache = MemoryCache::new();
        let session = SessionRecord::new("alice", None);
        cache.put_session(&session).await.unwrap();

        let msg = message(&session.id, 1, "hi");
        cache.append(&session.id, &msg).await.unwrap();

        let err = cache.evict(&session.id).await.unwrap_err();
        assert!(matches!(err, EngineError::Consistency(_)));

        cache
            .mark_flushed(&session.id, &[msg.id.clone()])
            .await
            .unwrap();
        cache.evict(&session.id).await.unwrap();
        assert!(cache.get_session(&session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unflushed_tracking() {
        let cache = MemoryCache::new();
        let session = SessionRecord::new("alice", None);
        cache.put_session(&session).await.unwrap();

        let m1 = message(&session.id, 1, "a");
        let m2 = message(&session.id, 2, "b");
        cache.append(&session.id, &m1).await.unwrap();
        cache.append(&session.id, &m2).await.unwrap();

        cache
            .mark_flushed(&session.id, &[m1.id.clone()])
            .await
            .unwrap();
        let pending = cache.unflushed(&session.id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, m2.id);
    }

    #[tokio::test]
    async fn test_idle_sessions_respect_suspension() {
        let cache = MemoryCache::new();
        let session = SessionRecord::new("alice", None);
        cache.put_session(&session).await.unwrap();

        let future = session.last_activity + 1;
        assert_eq!(cache.idle_sessions(future).await.unwrap().len(), 1);

        cache.set_ttl_suspended(&session.id, true).await.unwrap();
        assert!(cache.idle_sessions(future).await.unwrap().is_empty());

        cache.set_ttl_suspended(&session.id, false).await.unwrap();
        assert_eq!(cache.idle_sessions(future).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_hydrate_marks_flushed() {
        let cache = MemoryCache::new();
        let session = SessionRecord::new("alice", None);
        let history = vec![message(&session.id, 1, "a"), message(&session.id, 2, "b")];

        cache.hydrate(&session, &history).await.unwrap();
        assert!(cache.unflushed(&session.id).await.unwrap().is_empty());
        assert_eq!(cache.max_order(&session.id).await.unwrap(), Some(2));
        // Fully flushed, so eviction is allowed.
        cache.evict(&session.id).await.unwrap();
    }
}
