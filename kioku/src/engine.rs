//! Engine facade: the single public surface over both tiers.
//!
//! Wires the registry, migration coordinator, and health monitor
//! together and exposes the session/message API. Construct one via
//! [`Engine::builder`], call [`Engine::start`] to launch the background
//! loops, and [`Engine::shutdown`] to drain before exit.

use crate::cache::{CacheTier, MemoryCache};
use crate::config::EngineConfig;
use crate::durable::{DurableStore, SqliteStore};
use crate::error::{EngineError, Result, Tier};
use crate::health::{HealthMonitor, HealthSnapshot, MonitorHandle, TierHealth};
use crate::migration::{MigrationCoordinator, SweeperHandle};
use crate::model::{
    MessageRecord, NewMessage, ReconcileReport, RoleCounts, SenderRole, SessionRecord,
    SessionStats,
};
use crate::registry::SessionRegistry;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Builder for [`Engine`]. Tiers not injected explicitly are created
/// from the configuration (SQLite durable store, in-memory cache).
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    cache: Option<Arc<dyn CacheTier>>,
    durable: Option<Arc<dyn DurableStore>>,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EngineBuilder {
    /// Use the given configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Inject a cache tier implementation.
    #[must_use]
    pub fn cache(mut self, cache: Arc<dyn CacheTier>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Inject a durable store implementation.
    #[must_use]
    pub fn durable(mut self, durable: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(durable);
        self
    }

    /// Assemble the engine. Opens the SQLite database if no durable
    /// store was injected.
    pub fn build(self) -> Result<Engine> {
        let durable: Arc<dyn DurableStore> = match self.durable {
            Some(durable) => durable,
            None => Arc::new(SqliteStore::open(
                &self.config.durable.path,
                Duration::from_millis(self.config.durable.busy_timeout_ms),
            )?),
        };
        let cache: Arc<dyn CacheTier> = self
            .cache
            .unwrap_or_else(|| Arc::new(MemoryCache::new()));
        let health = Arc::new(TierHealth::new());

        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(&cache),
            Arc::clone(&durable),
            Arc::clone(&health),
        ));
        let coordinator = Arc::new(MigrationCoordinator::new(
            Arc::clone(&cache),
            Arc::clone(&durable),
            Arc::clone(&registry),
            self.config.clone(),
        ));

        Ok(Engine {
            cache,
            durable,
            health,
            registry,
            coordinator,
            config: self.config,
            monitor: Mutex::new(None),
            sweeper: Mutex::new(None),
        })
    }
}

/// The dual-tier persistence engine.
pub struct Engine {
    cache: Arc<dyn CacheTier>,
    durable: Arc<dyn DurableStore>,
    health: Arc<TierHealth>,
    registry: Arc<SessionRegistry>,
    coordinator: Arc<MigrationCoordinator>,
    config: EngineConfig,
    monitor: Mutex<Option<MonitorHandle>>,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Start building an engine.
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Launch the health monitor and migration sweeper.
    pub async fn start(&self) {
        let monitor = HealthMonitor::new(
            Arc::clone(&self.cache),
            Arc::clone(&self.durable),
            Arc::clone(&self.health),
            self.config.probe_interval(),
        );
        *self.monitor.lock().await = Some(monitor.start());
        *self.sweeper.lock().await = Some(self.coordinator.start());
        info!("engine started");
    }

    /// Stop the background loops and migrate everything still buffered.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.stop().await;
        }
        if let Some(handle) = self.monitor.lock().await.take() {
            handle.stop().await;
        }
        self.coordinator.drain().await;
        info!("engine shut down");
    }

    /// Create a new session for `owner`.
    pub async fn create_session(
        &self,
        owner: &str,
        title: Option<String>,
    ) -> Result<SessionRecord> {
        self.registry.create_session(owner, title).await
    }

    /// Return the most recent active session for `owner`, creating one
    /// if none exists.
    pub async fn get_or_create_session(&self, owner: &str) -> Result<SessionRecord> {
        self.registry.get_or_create(owner, None).await
    }

    /// Look up a session by id.
    pub async fn get_session(&self, session_id: &str) -> Result<SessionRecord> {
        self.registry.get_session(session_id).await
    }

    /// Sessions for an owner, last-activity descending.
    pub async fn list_sessions(&self, owner: &str) -> Result<Vec<SessionRecord>> {
        self.registry.list_sessions(owner).await
    }

    /// Refresh the last-activity timestamp without appending.
    pub async fn touch_session(&self, session_id: &str) -> Result<()> {
        self.registry.touch(session_id).await
    }

    /// Append a message. Acknowledged only once recorded in at least
    /// one tier; resumes the session if it was archived.
    pub async fn append_message(
        &self,
        session_id: &str,
        message: NewMessage,
    ) -> Result<MessageRecord> {
        self.registry.append_message(session_id, message).await
    }

    /// Append an agent message recording a tool invocation.
    pub async fn append_tool_message(
        &self,
        session_id: &str,
        tool_name: &str,
        parameters: Value,
        result: Option<String>,
    ) -> Result<MessageRecord> {
        self.registry
            .append_message(session_id, NewMessage::tool_call(tool_name, parameters, result))
            .await
    }

    /// Conversation history in `order`, merged across both tiers and
    /// deduplicated by message id. `limit` defaults from configuration.
    pub async fn get_history(
        &self,
        session_id: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<MessageRecord>> {
        // Existence check first so unknown ids are a clean NotFound.
        let _ = self.registry.get_session(session_id).await?;

        let mut messages = match self.durable.load_history(session_id).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(session_id, error = %e, "history read skipped durable tier");
                Vec::new()
            }
        };

        if self.health.cache_available() {
            match self.cache.read_recent(session_id, usize::MAX).await {
                Ok(mut cached) => {
                    cached.reverse();
                    let seen: HashSet<String> =
                        messages.iter().map(|m| m.id.clone()).collect();
                    messages.extend(cached.into_iter().filter(|m| !seen.contains(&m.id)));
                }
                Err(EngineError::NotFound(_)) => {}
                Err(e) => {
                    warn!(session_id, error = %e, "history read skipped cache tier");
                    if e.is_tier_unavailable(Tier::Cache) {
                        self.health.set(Tier::Cache, false);
                    }
                }
            }
        }

        messages.sort_by_key(|m| m.order);
        let limit = limit.unwrap_or(self.config.cache.default_limit);
        Ok(messages.into_iter().skip(offset).take(limit).collect())
    }

    /// Stored session row plus counts recomputed from both tiers.
    pub async fn get_session_stats(&self, session_id: &str) -> Result<SessionStats> {
        let session = self.registry.get_session(session_id).await?;
        let recomputed = self.recount(session_id).await?;
        Ok(SessionStats {
            session,
            recomputed,
        })
    }

    /// Compare stored counters against recomputed counts. Divergence is
    /// reported, never silently repaired.
    pub async fn reconcile(&self, session_id: &str) -> Result<ReconcileReport> {
        let session = self.registry.get_session(session_id).await?;
        let actual = self.recount(session_id).await?;
        let stored = (session.total_count, session.user_count, session.agent_count);
        let consistent = session.counters_consistent()
            && stored == (actual.total, actual.user, actual.agent);
        if !consistent {
            warn!(
                session_id,
                stored_total = stored.0,
                actual_total = actual.total,
                "session counters diverge from message rows"
            );
        }
        Ok(ReconcileReport {
            session_id: session.id,
            stored,
            actual,
            consistent,
        })
    }

    /// Migrate a session to the durable store and archive it.
    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        self.coordinator.migrate(session_id).await.map(|_| ())
    }

    /// Request a close without flushing yet; the sweeper finishes it.
    pub async fn request_close(&self, session_id: &str) -> Result<()> {
        self.coordinator.begin(session_id).await
    }

    /// Cancel a requested close that has not started flushing.
    pub async fn abort_close(&self, session_id: &str) -> Result<()> {
        self.coordinator.abort(session_id).await
    }

    /// Hard-delete a session and all its messages from both tiers.
    pub async fn cleanup_session(&self, session_id: &str) -> Result<()> {
        if let Err(e) = self.cache.purge(session_id).await {
            warn!(session_id, error = %e, "cache purge failed during cleanup");
        }
        self.durable.delete_session(session_id).await?;
        self.registry.remove_handle(session_id).await;
        info!(session_id, "session deleted");
        Ok(())
    }

    /// Current tier availability.
    #[must_use]
    pub fn health(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    /// Probe both tiers immediately and return the updated snapshot.
    pub async fn probe_now(&self) -> HealthSnapshot {
        let cache_ok = self.cache.probe().await.is_ok();
        self.health.set(Tier::Cache, cache_ok);
        let durable_ok = self.durable.probe().await.is_ok();
        self.health.set(Tier::Durable, durable_ok);
        self.health.snapshot()
    }

    async fn recount(&self, session_id: &str) -> Result<RoleCounts> {
        let mut counts = self.durable.role_counts(session_id).await?;
        // Unflushed cache rows are by definition absent from the
        // durable store, so adding them cannot double-count.
        if self.health.cache_available()
            && let Ok(pending) = self.cache.unflushed(session_id).await
        {
            for message in pending {
                counts.total += 1;
                match message.role {
                    SenderRole::User => counts.user += 1,
                    SenderRole::Agent => counts.agent += 1,
                }
                if message.is_tool_query {
                    counts.tool_queries += 1;
                }
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SessionStatus;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn engine() -> Engine {
        Engine::builder()
            .durable(Arc::new(SqliteStore::in_memory().unwrap()))
            .build()
            .unwrap()
    }

    /// Cache wrapper that can be switched off to simulate an outage.
    struct FlakyCache {
        inner: MemoryCache,
        down: AtomicBool,
    }

    impl FlakyCache {
        fn new() -> Self {
            Self {
                inner: MemoryCache::new(),
                down: AtomicBool::new(false),
            }
        }

        fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        fn check(&self) -> Result<()> {
            if self.down.load(Ordering::SeqCst) {
                Err(EngineError::cache_unavailable("simulated outage"))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl CacheTier for FlakyCache {
        async fn put_session(&self, session: &SessionRecord) -> Result<()> {
            self.check()?;
            self.inner.put_session(session).await
        }
        async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
            self.check()?;
            self.inner.get_session(session_id).await
        }
        async fn append(&self, session_id: &str, message: &MessageRecord) -> Result<()> {
            self.check()?;
            self.inner.append(session_id, message).await
        }
        async fn hydrate(
            &self,
            session: &SessionRecord,
            history: &[MessageRecord],
        ) -> Result<()> {
            self.check()?;
            self.inner.hydrate(session, history).await
        }
        async fn read_recent(
            &self,
            session_id: &str,
            limit: usize,
        ) -> Result<Vec<MessageRecord>> {
            self.check()?;
            self.inner.read_recent(session_id, limit).await
        }
        async fn unflushed(&self, session_id: &str) -> Result<Vec<MessageRecord>> {
            self.check()?;
            self.inner.unflushed(session_id).await
        }
        async fn mark_flushed(&self, session_id: &str, ids: &[String]) -> Result<()> {
            self.check()?;
            self.inner.mark_flushed(session_id, ids).await
        }
        async fn max_order(&self, session_id: &str) -> Result<Option<u64>> {
            self.check()?;
            self.inner.max_order(session_id).await
        }
        async fn set_ttl_suspended(&self, session_id: &str, suspended: bool) -> Result<()> {
            self.check()?;
            self.inner.set_ttl_suspended(session_id, suspended).await
        }
        async fn idle_sessions(&self, cutoff_ms: u64) -> Result<Vec<String>> {
            self.check()?;
            self.inner.idle_sessions(cutoff_ms).await
        }
        async fn evict(&self, session_id: &str) -> Result<()> {
            self.check()?;
            self.inner.evict(session_id).await
        }
        async fn purge(&self, session_id: &str) -> Result<()> {
            self.check()?;
            self.inner.purge(session_id).await
        }
        async fn probe(&self) -> Result<()> {
            self.check()?;
            self.inner.probe().await
        }
    }

    #[tokio::test]
    async fn test_conversation_end_to_end() {
        let engine = engine();
        let session = engine.get_or_create_session("alice").await.unwrap();

        engine
            .append_message(&session.id, NewMessage::user("what's the weather?"))
            .await
            .unwrap();
        engine
            .append_tool_message(
                &session.id,
                "weather",
                serde_json::json!({"city": "Tokyo"}),
                Some("sunny, 28C".into()),
            )
            .await
            .unwrap();
        engine
            .append_message(&session.id, NewMessage::agent("It is sunny in Tokyo."))
            .await
            .unwrap();

        let history = engine.get_history(&session.id, None, 0).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].order, 1);
        assert_eq!(history[1].tool_name.as_deref(), Some("weather"));
        assert_eq!(history[2].content, "It is sunny in Tokyo.");

        let stats = engine.get_session_stats(&session.id).await.unwrap();
        assert_eq!(stats.recomputed.total, 3);
        assert_eq!(stats.recomputed.user, 1);
        assert_eq!(stats.recomputed.agent, 2);
        assert_eq!(stats.recomputed.tool_queries, 1);

        engine.close_session(&session.id).await.unwrap();
        let archived = engine.get_session(&session.id).await.unwrap();
        assert_eq!(archived.status, SessionStatus::Archived);

        // The full record survives the close.
        let history = engine.get_history(&session.id, None, 0).await.unwrap();
        assert_eq!(history.len(), 3);
    }

    #[tokio::test]
    async fn test_resume_archived_session() {
        let engine = engine();
        let session = engine.get_or_create_session("alice").await.unwrap();
        engine
            .append_message(&session.id, NewMessage::user("first"))
            .await
            .unwrap();
        engine.close_session(&session.id).await.unwrap();

        // Appending to an archived session reactivates it and ordering
        // continues where it left off.
        let resumed = engine
            .append_message(&session.id, NewMessage::user("second"))
            .await
            .unwrap();
        assert_eq!(resumed.order, 2);

        let reactivated = engine.get_session(&session.id).await.unwrap();
        assert_eq!(reactivated.status, SessionStatus::Active);

        let history = engine.get_history(&session.id, None, 0).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_are_gapless() {
        let engine = Arc::new(engine());
        let session = engine.get_or_create_session("alice").await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..100 {
            let engine = Arc::clone(&engine);
            let session_id = session.id.clone();
            tasks.push(tokio::spawn(async move {
                engine
                    .append_message(&session_id, NewMessage::user(format!("m{i}")))
                    .await
                    .unwrap()
            }));
        }
        let mut orders: Vec<u64> = Vec::new();
        for task in tasks {
            orders.push(task.await.unwrap().order);
        }
        orders.sort_unstable();
        let expected: Vec<u64> = (1..=100).collect();
        assert_eq!(orders, expected);

        let report = engine.reconcile(&session.id).await.unwrap();
        assert!(report.consistent);
        assert_eq!(report.actual.total, 100);
    }

    #[tokio::test]
    async fn test_degraded_mode_falls_back_to_durable() {
        let cache = Arc::new(FlakyCache::new());
        let engine = Engine::builder()
            .cache(Arc::<FlakyCache>::clone(&cache))
            .durable(Arc::new(SqliteStore::in_memory().unwrap()))
            .build()
            .unwrap();

        let session = engine.get_or_create_session("alice").await.unwrap();
        engine
            .append_message(&session.id, NewMessage::user("cached"))
            .await
            .unwrap();

        cache.set_down(true);
        // The append is still acknowledged, written straight to the
        // durable store.
        let degraded = engine
            .append_message(&session.id, NewMessage::user("degraded"))
            .await
            .unwrap();
        assert_eq!(degraded.order, 2);
        assert!(!engine.health().cache);

        // Cache-resident data is unreachable for the duration of the
        // outage; the durable row is still served.
        let history = engine.get_history(&session.id, None, 0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "degraded");

        // Recovery: probe flips the flag back, appends resume through
        // the cache, and the merged history is whole again.
        cache.set_down(false);
        let snapshot = engine.probe_now().await;
        assert!(snapshot.cache);
        let recovered = engine
            .append_message(&session.id, NewMessage::agent("back"))
            .await
            .unwrap();
        assert_eq!(recovered.order, 3);

        let history = engine.get_history(&session.id, None, 0).await.unwrap();
        let orders: Vec<u64> = history.iter().map(|m| m.order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_idle_session_auto_commits() {
        let mut config = EngineConfig::default();
        config.cache.idle_timeout_ms = 10;
        config.migration.sweep_interval_ms = 20;
        let engine = Engine::builder()
            .config(config)
            .durable(Arc::new(SqliteStore::in_memory().unwrap()))
            .build()
            .unwrap();
        engine.start().await;

        let session = engine.get_or_create_session("alice").await.unwrap();
        engine
            .append_message(&session.id, NewMessage::user("hi"))
            .await
            .unwrap();

        let mut archived = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let current = engine.get_session(&session.id).await.unwrap();
            if current.status == SessionStatus::Archived {
                archived = true;
                break;
            }
        }
        engine.shutdown().await;
        assert!(archived, "idle session was never migrated");
    }

    #[tokio::test]
    async fn test_restart_recovers_from_durable_store() {
        let durable: Arc<dyn DurableStore> = Arc::new(SqliteStore::in_memory().unwrap());

        let first = Engine::builder()
            .durable(Arc::clone(&durable))
            .build()
            .unwrap();
        let session = first.get_or_create_session("alice").await.unwrap();
        first
            .append_message(&session.id, NewMessage::user("hello"))
            .await
            .unwrap();
        first.shutdown().await;

        // New engine, fresh cache, same durable store.
        let second = Engine::builder()
            .durable(Arc::clone(&durable))
            .build()
            .unwrap();
        let history = second.get_history(&session.id, None, 0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "hello");

        let appended = second
            .append_message(&session.id, NewMessage::agent("welcome back"))
            .await
            .unwrap();
        assert_eq!(appended.order, 2);
    }

    #[tokio::test]
    async fn test_request_close_and_abort() {
        let engine = engine();
        let session = engine.get_or_create_session("alice").await.unwrap();
        engine
            .append_message(&session.id, NewMessage::user("hi"))
            .await
            .unwrap();

        engine.request_close(&session.id).await.unwrap();
        // A second request while pending is a conflict.
        assert!(matches!(
            engine.request_close(&session.id).await,
            Err(EngineError::MigrationConflict(_))
        ));

        engine.abort_close(&session.id).await.unwrap();
        let still_active = engine.get_session(&session.id).await.unwrap();
        assert_eq!(still_active.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_cleanup_removes_everything() {
        let engine = engine();
        let session = engine.get_or_create_session("alice").await.unwrap();
        engine
            .append_message(&session.id, NewMessage::user("hi"))
            .await
            .unwrap();

        engine.cleanup_session(&session.id).await.unwrap();
        assert!(matches!(
            engine.get_session(&session.id).await,
            Err(EngineError::NotFound(_))
        ));
        assert!(engine.list_sessions("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_detects_counter_drift() {
        let durable: Arc<dyn DurableStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let engine = Engine::builder()
            .durable(Arc::clone(&durable))
            .build()
            .unwrap();

        let session = engine.get_or_create_session("alice").await.unwrap();
        engine
            .append_message(&session.id, NewMessage::user("hi"))
            .await
            .unwrap();
        engine
            .append_message(&session.id, NewMessage::agent("hello"))
            .await
            .unwrap();
        engine.close_session(&session.id).await.unwrap();

        // Corrupt the stored counters behind the engine's back.
        let mut row = durable
            .load_session(&session.id)
            .await
            .unwrap()
            .unwrap();
        row.total_count = 5;
        durable.persist_session(&row).await.unwrap();

        // A fresh engine has no in-process mirror and must read the
        // corrupted row.
        let checker = Engine::builder()
            .durable(Arc::clone(&durable))
            .build()
            .unwrap();
        let report = checker.reconcile(&session.id).await.unwrap();
        assert!(!report.consistent);
        assert_eq!(report.stored.0, 5);
        assert_eq!(report.actual.total, 2);
    }

    #[tokio::test]
    async fn test_history_pagination() {
        let engine = engine();
        let session = engine.get_or_create_session("alice").await.unwrap();
        for i in 1..=10 {
            engine
                .append_message(&session.id, NewMessage::user(format!("m{i}")))
                .await
                .unwrap();
        }

        let page = engine.get_history(&session.id, Some(3), 4).await.unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].order, 5);
        assert_eq!(page[2].order, 7);
    }
}
