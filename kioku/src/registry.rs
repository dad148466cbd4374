//! Session registry: identifier allocation, metadata, and write routing.
//!
//! Each session gets a [`SessionHandle`] holding a single mutex over its
//! mutable state (order seed, counter mirror, migration state). That
//! mutex serializes sequence-number assignment and migration-state
//! transitions for one session; operations on distinct sessions run
//! fully in parallel.

use crate::cache::CacheTier;
use crate::durable::DurableStore;
use crate::error::{EngineError, Result, Tier};
use crate::health::TierHealth;
use crate::migration::MigrationState;
use crate::model::{MessageRecord, NewMessage, SessionRecord, SessionStatus};
use crate::util::timestamp_ms;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// Mutable per-session state, guarded by the handle mutex.
#[derive(Debug)]
pub struct SessionState {
    /// Freshest known session row (counter mirror).
    pub(crate) session: Option<SessionRecord>,
    /// Next sequence number; `None` until seeded from the tiers.
    pub(crate) next_order: Option<u64>,
    /// Migration state machine position.
    pub(crate) migration: MigrationState,
    /// Consecutive failed migration attempts.
    pub(crate) retry_attempts: u32,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            session: None,
            next_order: None,
            migration: MigrationState::Idle,
            retry_attempts: 0,
        }
    }
}

/// Per-session lock and state.
#[derive(Debug)]
pub struct SessionHandle {
    /// Session id this handle serializes.
    pub id: String,
    /// Guarded mutable state.
    pub state: Mutex<SessionState>,
}

/// Registry over both tiers. Routes reads and writes, assigns sequence
/// numbers, and owns the per-session handles.
pub struct SessionRegistry {
    cache: Arc<dyn CacheTier>,
    durable: Arc<dyn DurableStore>,
    health: Arc<TierHealth>,
    handles: RwLock<HashMap<String, Arc<SessionHandle>>>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry").finish_non_exhaustive()
    }
}

impl SessionRegistry {
    /// Create a registry over injected tier handles.
    pub fn new(
        cache: Arc<dyn CacheTier>,
        durable: Arc<dyn DurableStore>,
        health: Arc<TierHealth>,
    ) -> Self {
        Self {
            cache,
            durable,
            health,
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the handle for a session id.
    pub async fn handle(&self, session_id: &str) -> Arc<SessionHandle> {
        if let Some(handle) = self.handles.read().await.get(session_id) {
            return Arc::clone(handle);
        }
        let mut handles = self.handles.write().await;
        Arc::clone(handles.entry(session_id.to_string()).or_insert_with(|| {
            Arc::new(SessionHandle {
                id: session_id.to_string(),
                state: Mutex::new(SessionState::default()),
            })
        }))
    }

    /// Drop the handle for a session (administrative cleanup only).
    pub async fn remove_handle(&self, session_id: &str) {
        self.handles.write().await.remove(session_id);
    }

    /// Allocate a new session: active, zero counters, unique id.
    pub async fn create_session(
        &self,
        owner: &str,
        title: Option<String>,
    ) -> Result<SessionRecord> {
        if owner.trim().is_empty() {
            return Err(EngineError::validation("owner must not be empty"));
        }
        let session = SessionRecord::new(owner, title);
        // The durable store is the source of truth; creation must land
        // there. The cache mirror is best-effort.
        self.durable.persist_session(&session).await?;
        if self.health.cache_available()
            && let Err(e) = self.cache.put_session(&session).await
        {
            self.mark_cache_down(&e);
        }

        let handle = self.handle(&session.id).await;
        let mut state = handle.state.lock().await;
        state.session = Some(session.clone());
        state.next_order = Some(1);
        drop(state);

        info!(session_id = %session.id, owner, "created session");
        Ok(session)
    }

    /// Return the most recent active session for an owner, or create one.
    pub async fn get_or_create(&self, owner: &str, title: Option<String>) -> Result<SessionRecord> {
        if owner.trim().is_empty() {
            return Err(EngineError::validation("owner must not be empty"));
        }
        let sessions = self.durable.list_sessions(owner).await?;
        if let Some(active) = sessions
            .into_iter()
            .find(|s| s.status == SessionStatus::Active)
        {
            return Ok(active);
        }
        self.create_session(owner, title).await
    }

    /// Look up a session, preferring the freshest mirror.
    pub async fn get_session(&self, session_id: &str) -> Result<SessionRecord> {
        validate_session_id(session_id)?;
        let handle = self.handle(session_id).await;
        let mut state = handle.state.lock().await;
        self.session_snapshot(&mut state, session_id).await
    }

    /// Update the last-activity timestamp.
    pub async fn touch(&self, session_id: &str) -> Result<()> {
        validate_session_id(session_id)?;
        let handle = self.handle(session_id).await;
        let mut state = handle.state.lock().await;
        let mut session = self.session_snapshot(&mut state, session_id).await?;
        session.last_activity = timestamp_ms();

        if self.health.cache_available() {
            if let Err(e) = self.cache.put_session(&session).await {
                self.mark_cache_down(&e);
                self.durable.persist_session(&session).await?;
            }
        } else {
            self.durable.persist_session(&session).await?;
        }
        state.session = Some(session);
        Ok(())
    }

    /// Sessions for an owner, last-activity descending.
    pub async fn list_sessions(&self, owner: &str) -> Result<Vec<SessionRecord>> {
        self.durable.list_sessions(owner).await
    }

    /// Append a message: assign the next `order`, route the write, and
    /// acknowledge only once it landed in at least one tier.
    pub async fn append_message(
        &self,
        session_id: &str,
        new: NewMessage,
    ) -> Result<MessageRecord> {
        validate_session_id(session_id)?;
        if new.content.is_empty() && new.tool.is_none() {
            return Err(EngineError::validation("message content must not be empty"));
        }

        let handle = self.handle(session_id).await;
        let mut state = handle.state.lock().await;

        let mut session = self.session_snapshot(&mut state, session_id).await?;
        if session.status == SessionStatus::Deleted {
            return Err(EngineError::not_found(session_id));
        }
        if session.status == SessionStatus::Archived {
            self.resume_archived(&mut state, &mut session, session_id)
                .await;
        }

        let order = match state.next_order {
            Some(n) => n,
            None => self.seed_order(session_id).await + 1,
        };

        let record = MessageRecord::from_new(session_id, order, new);
        session.record_append(record.role, record.created_at);

        // While a migration is underway every append is dual-written to
        // bound the window of cache-only data.
        let dual_write = !matches!(state.migration, MigrationState::Idle);

        let mut cache_ok = false;
        if self.health.cache_available() {
            let write = async {
                self.cache.put_session(&session).await?;
                self.cache.append(session_id, &record).await
            };
            match write.await {
                Ok(()) => cache_ok = true,
                Err(e) => self.mark_cache_down(&e),
            }
        }

        let mut durable_ok = false;
        if dual_write || !cache_ok {
            match self
                .durable
                .persist_messages(session_id, std::slice::from_ref(&record))
                .await
            {
                Ok(_) => {
                    durable_ok = true;
                    if let Err(e) = self.durable.persist_session(&session).await {
                        warn!(session_id, error = %e, "failed to update durable counters");
                    }
                    if cache_ok
                        && let Err(e) = self
                            .cache
                            .mark_flushed(session_id, std::slice::from_ref(&record.id))
                            .await
                    {
                        self.mark_cache_down(&e);
                    }
                }
                Err(e) if cache_ok => {
                    // The message is safely cache-resident; migration
                    // retry will flush it.
                    warn!(session_id, error = %e, "durable write deferred to migration");
                }
                Err(e) => return Err(e),
            }
        }

        if !cache_ok && !durable_ok {
            return Err(EngineError::durable_unavailable(
                "append could not be recorded in any tier",
            ));
        }

        state.next_order = Some(order + 1);
        state.session = Some(session);
        Ok(record)
    }

    /// Handles with a failed migration whose retry is due.
    pub async fn sessions_due_retry(&self, now_ms: u64) -> Vec<String> {
        let handles = self.handles.read().await;
        let mut due = Vec::new();
        for (id, handle) in handles.iter() {
            if let Ok(state) = handle.state.try_lock()
                && let MigrationState::Failed { next_retry_ms } = state.migration
                && next_retry_ms <= now_ms
            {
                due.push(id.clone());
            }
        }
        due
    }

    /// Handles sitting in `pending` awaiting a flush.
    pub async fn sessions_pending(&self) -> Vec<String> {
        let handles = self.handles.read().await;
        let mut pending = Vec::new();
        for (id, handle) in handles.iter() {
            if let Ok(state) = handle.state.try_lock()
                && state.migration == MigrationState::Pending
            {
                pending.push(id.clone());
            }
        }
        pending
    }

    /// Load the freshest session row into the locked state.
    pub(crate) async fn session_snapshot(
        &self,
        state: &mut SessionState,
        session_id: &str,
    ) -> Result<SessionRecord> {
        if let Some(session) = &state.session {
            return Ok(session.clone());
        }
        let from_cache = if self.health.cache_available() {
            match self.cache.get_session(session_id).await {
                Ok(found) => found,
                Err(e) => {
                    self.mark_cache_down(&e);
                    None
                }
            }
        } else {
            None
        };
        let session = match from_cache {
            Some(session) => session,
            None => self
                .durable
                .load_session(session_id)
                .await?
                .ok_or_else(|| EngineError::not_found(session_id))?,
        };
        state.session = Some(session.clone());
        Ok(session)
    }

    /// Reactivate an archived session for further appends.
    async fn resume_archived(
        &self,
        state: &mut SessionState,
        session: &mut SessionRecord,
        session_id: &str,
    ) {
        session.status = SessionStatus::Active;
        state.migration = MigrationState::Idle;
        state.retry_attempts = 0;
        state.next_order = None;

        if self.health.cache_available() {
            match self.durable.load_history(session_id).await {
                Ok(history) => {
                    if let Err(e) = self.cache.hydrate(session, &history).await {
                        self.mark_cache_down(&e);
                    }
                }
                Err(e) => {
                    warn!(session_id, error = %e, "could not rehydrate session cache");
                }
            }
        }
        info!(session_id, "resumed archived session");
    }

    /// Seed the sequence from `max(order)` across both tiers.
    async fn seed_order(&self, session_id: &str) -> u64 {
        let durable_max = match self.durable.max_order(session_id).await {
            Ok(max) => max,
            Err(e) => {
                warn!(session_id, error = %e, "order seed skipped durable tier");
                None
            }
        };
        let cache_max = match self.cache.max_order(session_id).await {
            Ok(max) => max,
            Err(e) => {
                self.mark_cache_down(&e);
                None
            }
        };
        durable_max
            .into_iter()
            .chain(cache_max)
            .max()
            .unwrap_or(0)
    }

    fn mark_cache_down(&self, err: &EngineError) {
        warn!(error = %err, "cache tier error");
        if err.is_tier_unavailable(Tier::Cache) {
            self.health.set(Tier::Cache, false);
        }
    }
}

fn validate_session_id(session_id: &str) -> Result<()> {
    if session_id.trim().is_empty() {
        return Err(EngineError::validation("session id must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::durable::SqliteStore;

    fn registry() -> (SessionRegistry, Arc<dyn DurableStore>) {
        let cache: Arc<dyn CacheTier> = Arc::new(MemoryCache::new());
        let durable: Arc<dyn DurableStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let health = Arc::new(TierHealth::new());
        (
            SessionRegistry::new(cache, Arc::clone(&durable), health),
            durable,
        )
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (registry, _durable) = registry();
        let session = registry.create_session("alice", None).await.unwrap();

        let loaded = registry.get_session(&session.id).await.unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.status, SessionStatus::Active);
        assert_eq!(loaded.total_count, 0);

        assert!(matches!(
            registry.get_session("no-such-session").await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_empty_owner() {
        let (registry, _durable) = registry();
        assert!(matches!(
            registry.create_session("  ", None).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_active() {
        let (registry, _durable) = registry();
        let first = registry.get_or_create("alice", None).await.unwrap();
        let second = registry.get_or_create("alice", None).await.unwrap();
        assert_eq!(first.id, second.id);

        let other = registry.get_or_create("bob", None).await.unwrap();
        assert_ne!(first.id, other.id);
    }

    #[tokio::test]
    async fn test_append_assigns_gapless_orders() {
        let (registry, _durable) = registry();
        let session = registry.create_session("alice", None).await.unwrap();

        let m1 = registry
            .append_message(&session.id, NewMessage::user("hi"))
            .await
            .unwrap();
        let m2 = registry
            .append_message(&session.id, NewMessage::agent("hello"))
            .await
            .unwrap();
        assert_eq!(m1.order, 1);
        assert_eq!(m2.order, 2);

        let loaded = registry.get_session(&session.id).await.unwrap();
        assert_eq!(loaded.total_count, 2);
        assert_eq!(loaded.user_count, 1);
        assert_eq!(loaded.agent_count, 1);
        assert!(loaded.counters_consistent());
    }

    #[tokio::test]
    async fn test_order_seeded_from_durable_after_restart() {
        let cache: Arc<dyn CacheTier> = Arc::new(MemoryCache::new());
        let durable: Arc<dyn DurableStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let health = Arc::new(TierHealth::new());
        let registry = SessionRegistry::new(cache, Arc::clone(&durable), health);

        let session = registry.create_session("alice", None).await.unwrap();
        // Simulate prior migrated history already in the durable store.
        let history = vec![
            MessageRecord::from_new(&session.id, 1, NewMessage::user("old-1")),
            MessageRecord::from_new(&session.id, 2, NewMessage::agent("old-2")),
        ];
        durable
            .persist_messages(&session.id, &history)
            .await
            .unwrap();

        // Fresh registry + fresh cache, same durable store: a restart.
        let restarted = SessionRegistry::new(
            Arc::new(MemoryCache::new()),
            Arc::clone(&durable),
            Arc::new(TierHealth::new()),
        );
        let m = restarted
            .append_message(&session.id, NewMessage::user("new"))
            .await
            .unwrap();
        assert_eq!(m.order, 3);
    }

    #[tokio::test]
    async fn test_touch_advances_activity() {
        let (registry, _durable) = registry();
        let session = registry.create_session("alice", None).await.unwrap();
        let before = session.last_activity;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        registry.touch(&session.id).await.unwrap();
        let after = registry.get_session(&session.id).await.unwrap();
        assert!(after.last_activity >= before);
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let (registry, _durable) = registry();
        assert!(matches!(
            registry.append_message("", NewMessage::user("hi")).await,
            Err(EngineError::Validation(_))
        ));

        let session = registry.create_session("alice", None).await.unwrap();
        assert!(matches!(
            registry
                .append_message(&session.id, NewMessage::user(""))
                .await,
            Err(EngineError::Validation(_))
        ));
    }
}
