//! Health monitor: periodic liveness probing of both tiers.
//!
//! The shared [`TierHealth`] flags drive degraded-mode behavior: when
//! the cache flag drops, appends fall back to synchronous durable
//! writes; a successful probe flips the flag back and normal dual-tier
//! operation resumes automatically.

use crate::cache::CacheTier;
use crate::durable::DurableStore;
use crate::error::Tier;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Point-in-time availability of the two tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSnapshot {
    /// Durable store reachable.
    pub durable: bool,
    /// Cache tier reachable.
    pub cache: bool,
}

impl HealthSnapshot {
    /// Collapse the two flags into an overall state.
    #[must_use]
    pub const fn state(self) -> HealthState {
        match (self.durable, self.cache) {
            (true, true) => HealthState::Healthy,
            (true, false) => HealthState::Degraded(Tier::Cache),
            (false, true) => HealthState::Degraded(Tier::Durable),
            (false, false) => HealthState::Unavailable,
        }
    }
}

/// Overall engine health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Both tiers reachable.
    Healthy,
    /// One tier down; the engine compensates.
    Degraded(Tier),
    /// Neither tier reachable; appends cannot be acknowledged.
    Unavailable,
}

/// Shared availability flags, updated by the monitor and by callers
/// that observe a tier failure first-hand.
#[derive(Debug)]
pub struct TierHealth {
    inner: RwLock<HealthSnapshot>,
}

impl Default for TierHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl TierHealth {
    /// Both tiers assumed reachable until a probe says otherwise.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: RwLock::new(HealthSnapshot {
                durable: true,
                cache: true,
            }),
        }
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> HealthSnapshot {
        self.inner.read().map_or(
            HealthSnapshot {
                durable: false,
                cache: false,
            },
            |s| *s,
        )
    }

    /// Whether the cache tier is currently considered reachable.
    #[must_use]
    pub fn cache_available(&self) -> bool {
        self.snapshot().cache
    }

    /// Record an observed tier state change.
    pub fn set(&self, tier: Tier, available: bool) {
        let Ok(mut snapshot) = self.inner.write() else {
            return;
        };
        let flag = match tier {
            Tier::Cache => &mut snapshot.cache,
            Tier::Durable => &mut snapshot.durable,
        };
        if *flag != available {
            *flag = available;
            if available {
                info!(%tier, "tier recovered");
            } else {
                warn!(%tier, "tier marked unavailable");
            }
        }
    }
}

/// Handle for stopping the monitor loop.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl MonitorHandle {
    /// Signal the monitor to stop.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Periodic probe loop over both tiers.
pub struct HealthMonitor {
    cache: Arc<dyn CacheTier>,
    durable: Arc<dyn DurableStore>,
    health: Arc<TierHealth>,
    interval: Duration,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    /// Create a monitor over the given tiers.
    pub fn new(
        cache: Arc<dyn CacheTier>,
        durable: Arc<dyn DurableStore>,
        health: Arc<TierHealth>,
        interval: Duration,
    ) -> Self {
        Self {
            cache,
            durable,
            health,
            interval,
        }
    }

    /// Probe both tiers once and update the shared flags.
    pub async fn probe_once(&self) {
        let cache_ok = self.cache.probe().await.is_ok();
        self.health.set(Tier::Cache, cache_ok);

        let durable_ok = self.durable.probe().await.is_ok();
        self.health.set(Tier::Durable, durable_ok);

        debug!(cache = cache_ok, durable = durable_ok, "health probe");
    }

    /// Start the probe loop. Returns a handle used to stop it.
    #[must_use]
    pub fn start(self) -> MonitorHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let handle = MonitorHandle { shutdown_tx };

        tokio::spawn(async move {
            info!(interval = ?self.interval, "health monitor started");
            loop {
                tokio::select! {
                    () = tokio::time::sleep(self.interval) => {
                        self.probe_once().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("health monitor shutting down");
                        break;
                    }
                }
            }
        });

        handle
    }
}
