//! Engine configuration.
//!
//! Tier connection parameters, pool/timeout knobs, the idle-session
//! window, and the migration retry policy. Persisted as JSON under the
//! data directory.

use crate::error::Result;
use crate::util::{data_dir, default_db_path};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Durable store (SQLite) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DurableConfig {
    /// Database file path.
    pub path: PathBuf,
    /// SQLite busy timeout in milliseconds.
    pub busy_timeout_ms: u64,
}

impl Default for DurableConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: 5_000,
        }
    }
}

/// Cache tier settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Idle window after which a session is migrated and evicted.
    pub idle_timeout_ms: u64,
    /// Default `read_recent` / history limit.
    pub default_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 30 * 60 * 1_000,
            default_limit: 50,
        }
    }
}

/// Migration retry and sweep policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Retries before raising an operator-visible alert.
    pub max_retries: u32,
    /// First retry delay in milliseconds.
    pub initial_backoff_ms: u64,
    /// Backoff multiplier applied per attempt.
    pub backoff_multiplier: u32,
    /// Upper bound on a single retry delay.
    pub max_backoff_ms: u64,
    /// Interval between sweeper passes.
    pub sweep_interval_ms: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 500,
            backoff_multiplier: 2,
            max_backoff_ms: 60_000,
            sweep_interval_ms: 10_000,
        }
    }
}

impl MigrationConfig {
    /// Delay before retry number `attempts` (exponential, capped).
    #[must_use]
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let factor = u64::from(self.backoff_multiplier).saturating_pow(attempts);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Health monitor settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between tier probes.
    pub probe_interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 30_000,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Durable store settings.
    pub durable: DurableConfig,
    /// Cache tier settings.
    pub cache: CacheConfig,
    /// Migration policy.
    pub migration: MigrationConfig,
    /// Health monitor settings.
    pub health: HealthConfig,
}

impl EngineConfig {
    /// Idle-session window as a [`Duration`].
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.cache.idle_timeout_ms)
    }

    /// Sweep interval as a [`Duration`].
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.migration.sweep_interval_ms)
    }

    /// Probe interval as a [`Duration`].
    #[must_use]
    pub const fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.health.probe_interval_ms)
    }
}

/// Default configuration file path (~/.kioku/config.json).
#[must_use]
pub fn config_path() -> PathBuf {
    data_dir().join("config.json")
}

/// Load configuration from the given path, or the default location.
pub async fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    let path = path.cloned().unwrap_or_else(config_path);
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    let content = tokio::fs::read_to_string(&path).await?;
    Ok(serde_json::from_str(&content)?)
}

/// Save configuration to the given path, or the default location.
pub async fn save_config(config: &EngineConfig, path: Option<&PathBuf>) -> Result<()> {
    let path = path.cloned().unwrap_or_else(config_path);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let content = serde_json::to_string_pretty(config)?;
    tokio::fs::write(&path, content).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.cache.idle_timeout_ms, 30 * 60 * 1_000);
        assert_eq!(config.migration.max_retries, 5);
        assert_eq!(config.idle_timeout(), Duration::from_secs(1800));
    }

    #[test]
    fn test_backoff_schedule() {
        let config = MigrationConfig::default();
        assert_eq!(config.backoff_for(0), Duration::from_millis(500));
        assert_eq!(config.backoff_for(1), Duration::from_millis(1_000));
        assert_eq!(config.backoff_for(3), Duration::from_millis(4_000));
        // Capped at max_backoff_ms.
        assert_eq!(config.backoff_for(20), Duration::from_millis(60_000));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"cache": {"idle_timeout_ms": 1000}}"#).unwrap();
        assert_eq!(config.cache.idle_timeout_ms, 1_000);
        assert_eq!(config.migration.max_retries, 5);
    }
}
