//! Migration: moving a session's conversation from the cache tier into
//! the durable store, then archiving it.
//!
//! Per session the state machine is
//! `idle -> pending -> migrating -> committed | failed`, with `failed`
//! retrying back through `pending` on an exponential backoff. The
//! coordinator holds the session handle mutex across every transition,
//! so two migrations can never interleave on one session.

use crate::cache::CacheTier;
use crate::config::EngineConfig;
use crate::durable::DurableStore;
use crate::error::{EngineError, Result};
use crate::model::SessionStatus;
use crate::registry::{SessionRegistry, SessionState};
use crate::util::timestamp_ms;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Position of one session in the migration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    /// No migration in progress.
    Idle,
    /// Migration requested; new appends dual-write.
    Pending,
    /// Flush in progress.
    Migrating,
    /// Flush verified and the session archived.
    Committed,
    /// Flush failed; retry scheduled.
    Failed {
        /// Earliest wall-clock time (ms) the next attempt may run.
        next_retry_ms: u64,
    },
}

impl MigrationState {
    /// Short name for logs and errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pending => "pending",
            Self::Migrating => "migrating",
            Self::Committed => "committed",
            Self::Failed { .. } => "failed",
        }
    }

    /// `idle` or `failed` -> `pending`.
    pub fn mark_pending(&mut self) -> Result<()> {
        match self {
            Self::Idle | Self::Failed { .. } => {
                *self = Self::Pending;
                Ok(())
            }
            other => Err(transition_error(other, "pending")),
        }
    }

    /// `pending` -> `migrating`.
    pub fn mark_migrating(&mut self) -> Result<()> {
        match self {
            Self::Pending => {
                *self = Self::Migrating;
                Ok(())
            }
            other => Err(transition_error(other, "migrating")),
        }
    }

    /// `migrating` -> `committed`.
    pub fn mark_committed(&mut self) -> Result<()> {
        match self {
            Self::Migrating => {
                *self = Self::Committed;
                Ok(())
            }
            other => Err(transition_error(other, "committed")),
        }
    }

    /// `migrating` -> `failed`.
    pub fn mark_failed(&mut self, next_retry_ms: u64) -> Result<()> {
        match self {
            Self::Migrating => {
                *self = Self::Failed { next_retry_ms };
                Ok(())
            }
            other => Err(transition_error(other, "failed")),
        }
    }

    /// Cancel a not-yet-started migration: `pending` -> `idle` only.
    pub fn abort(&mut self) -> Result<()> {
        match self {
            Self::Pending => {
                *self = Self::Idle;
                Ok(())
            }
            other => Err(transition_error(other, "idle")),
        }
    }
}

fn transition_error(from: &MigrationState, to: &str) -> EngineError {
    EngineError::conflict(format!(
        "cannot move migration from {} to {to}",
        from.name()
    ))
}

/// Handle for stopping the background sweeper.
#[derive(Debug, Clone)]
pub struct SweeperHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl SweeperHandle {
    /// Signal the sweeper to stop.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Drives migrations: explicit closes, idle-timeout sweeps, and failed
/// retries.
pub struct MigrationCoordinator {
    cache: Arc<dyn CacheTier>,
    durable: Arc<dyn DurableStore>,
    registry: Arc<SessionRegistry>,
    config: EngineConfig,
}

impl std::fmt::Debug for MigrationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationCoordinator").finish_non_exhaustive()
    }
}

impl MigrationCoordinator {
    /// Create a coordinator over the given tiers and registry.
    pub fn new(
        cache: Arc<dyn CacheTier>,
        durable: Arc<dyn DurableStore>,
        registry: Arc<SessionRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            cache,
            durable,
            registry,
            config,
        }
    }

    /// Migrate a session end to end: flush, verify, archive, evict.
    ///
    /// Returns `Ok(false)` if the session is already archived and has
    /// nothing buffered. On failure the session is left in `failed`
    /// with a retry scheduled.
    pub async fn migrate(&self, session_id: &str) -> Result<bool> {
        let handle = self.registry.handle(session_id).await;
        let mut state = handle.state.lock().await;

        let session = self
            .registry
            .session_snapshot(&mut state, session_id)
            .await?;
        if session.status != SessionStatus::Active {
            debug!(session_id, status = session.status.as_str(), "nothing to migrate");
            // touch can re-create the cache mirror for an archived
            // session; drop it so the idle scan stops selecting it.
            if let Err(e) = self.cache.evict(session_id).await {
                debug!(session_id, error = %e, "stale mirror not evicted");
            }
            return Ok(false);
        }

        if state.migration != MigrationState::Pending {
            state.migration.mark_pending()?;
            if let Err(e) = self.cache.set_ttl_suspended(session_id, true).await {
                warn!(session_id, error = %e, "could not suspend cache eviction");
            }
        }
        state.migration.mark_migrating()?;
        info!(session_id, "migration started");

        match self.flush(&mut state, session_id).await {
            Ok(flushed) => {
                state.migration.mark_committed()?;
                state.retry_attempts = 0;
                if let Err(e) = self.cache.evict(session_id).await {
                    warn!(session_id, error = %e, "post-commit cache eviction failed");
                }
                info!(session_id, flushed, "migration committed");
                Ok(true)
            }
            Err(e) => {
                state.retry_attempts += 1;
                let attempts = state.retry_attempts;
                let backoff = self.config.migration.backoff_for(attempts.saturating_sub(1));
                let next_retry_ms = timestamp_ms().saturating_add(to_ms(backoff));
                state.migration.mark_failed(next_retry_ms)?;

                if attempts >= self.config.migration.max_retries {
                    error!(
                        session_id,
                        attempts,
                        error = %e,
                        "migration exhausted retries; operator intervention required"
                    );
                } else {
                    warn!(
                        session_id,
                        attempts,
                        retry_in_ms = to_ms(backoff),
                        error = %e,
                        "migration failed; retry scheduled"
                    );
                }
                Err(e)
            }
        }
    }

    /// Request a migration without flushing yet: the session enters
    /// `pending`, its cache eviction is suspended, and new appends
    /// dual-write until the sweeper (or an explicit close) flushes it.
    pub async fn begin(&self, session_id: &str) -> Result<()> {
        let handle = self.registry.handle(session_id).await;
        let mut state = handle.state.lock().await;

        let session = self
            .registry
            .session_snapshot(&mut state, session_id)
            .await?;
        if session.status != SessionStatus::Active {
            return Err(EngineError::conflict(format!(
                "session {session_id} is {}",
                session.status.as_str()
            )));
        }

        state.migration.mark_pending()?;
        if let Err(e) = self.cache.set_ttl_suspended(session_id, true).await {
            warn!(session_id, error = %e, "could not suspend cache eviction");
        }
        info!(session_id, "migration requested");
        Ok(())
    }

    /// Cancel a migration that has not started flushing.
    pub async fn abort(&self, session_id: &str) -> Result<()> {
        let handle = self.registry.handle(session_id).await;
        let mut state = handle.state.lock().await;
        state.migration.abort()?;
        state.retry_attempts = 0;
        if let Err(e) = self.cache.set_ttl_suspended(session_id, false).await {
            warn!(session_id, error = %e, "could not resume cache eviction");
        }
        info!(session_id, "migration aborted");
        Ok(())
    }

    /// One sweeper pass: idle sessions plus due retries.
    pub async fn sweep(&self) {
        let now = timestamp_ms();
        let cutoff = now.saturating_sub(self.config.cache.idle_timeout_ms);

        let mut candidates = match self.cache.idle_sessions(cutoff).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "idle-session scan failed");
                Vec::new()
            }
        };
        for id in self.registry.sessions_pending().await {
            if !candidates.contains(&id) {
                candidates.push(id);
            }
        }
        for id in self.registry.sessions_due_retry(now).await {
            if !candidates.contains(&id) {
                candidates.push(id);
            }
        }

        for session_id in candidates {
            if let Err(e) = self.migrate(&session_id).await {
                debug!(session_id = %session_id, error = %e, "sweep migration deferred");
            }
        }
    }

    /// Migrate everything still buffered, including failed sessions not
    /// yet due for retry. Used on shutdown.
    pub async fn drain(&self) {
        let mut candidates = match self.cache.idle_sessions(u64::MAX).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "drain scan failed");
                Vec::new()
            }
        };
        for id in self.registry.sessions_pending().await {
            if !candidates.contains(&id) {
                candidates.push(id);
            }
        }
        for id in self.registry.sessions_due_retry(u64::MAX).await {
            if !candidates.contains(&id) {
                candidates.push(id);
            }
        }

        info!(sessions = candidates.len(), "draining cache-resident sessions");
        for session_id in candidates {
            if let Err(e) = self.migrate(&session_id).await {
                warn!(session_id = %session_id, error = %e, "drain migration failed");
            }
        }
    }

    /// Start the periodic sweeper. Returns a handle used to stop it.
    #[must_use]
    pub fn start(self: &Arc<Self>) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let handle = SweeperHandle { shutdown_tx };
        let coordinator = Arc::clone(self);
        let interval = self.config.sweep_interval();

        tokio::spawn(async move {
            info!(interval = ?interval, "migration sweeper started");
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {
                        coordinator.sweep().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("migration sweeper shutting down");
                        break;
                    }
                }
            }
        });

        handle
    }

    /// Flush unflushed messages, verify the durable row count against
    /// the session counters, and archive the session row.
    async fn flush(&self, state: &mut SessionState, session_id: &str) -> Result<usize> {
        let mut session = self
            .registry
            .session_snapshot(state, session_id)
            .await?;

        let batch = self.cache.unflushed(session_id).await?;
        let flushed = batch.len();
        if !batch.is_empty() {
            self.durable.persist_messages(session_id, &batch).await?;
            let ids: Vec<String> = batch.iter().map(|m| m.id.clone()).collect();
            self.cache.mark_flushed(session_id, &ids).await?;
        }

        let count = self.durable.message_count(session_id).await?;
        if count != session.total_count {
            return Err(EngineError::consistency(format!(
                "session {session_id}: durable row count {count} != recorded total {}",
                session.total_count
            )));
        }

        session.status = SessionStatus::Archived;
        self.durable.persist_session(&session).await?;
        state.session = Some(session);
        Ok(flushed)
    }
}

const fn to_ms(d: std::time::Duration) -> u64 {
    d.as_millis() as u64
}
