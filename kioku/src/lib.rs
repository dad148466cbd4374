//! Kioku - dual-tier conversation persistence for AI agents.
//!
//! Recent messages live in a low-latency cache tier while a durable
//! relational store keeps the permanent record. Idle or explicitly
//! closed sessions are migrated from cache to durable storage by a
//! verified, retryable state machine, and a health monitor degrades
//! the engine gracefully when a tier goes down.
//!
//! # Architecture
//!
//! - **Engine** ([`engine`]) - Public facade wiring everything together
//! - **Registry** ([`registry`]) - Per-session locks, ordering, write routing
//! - **Cache** ([`cache`]) - Ephemeral tier with flushed-marker tracking
//! - **Durable** ([`durable`]) - SQLite-backed permanent store
//! - **Migration** ([`migration`]) - Cache-to-durable state machine and sweeper
//! - **Health** ([`health`]) - Tier probing and degraded-mode flags
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use kioku::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let engine = Engine::builder().build()?;
//!     engine.start().await;
//!
//!     let session = engine.get_or_create_session("alice").await?;
//!     engine.append_message(&session.id, NewMessage::user("hello")).await?;
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod durable;
pub mod engine;
pub mod error;
pub mod health;
pub mod migration;
pub mod model;
pub mod registry;
pub mod util;

/// Prelude module for convenient imports.
pub mod prelude {
    // Errors
    pub use crate::error::{EngineError, Result, Tier};

    // Engine
    pub use crate::engine::{Engine, EngineBuilder};

    // Model
    pub use crate::model::{
        MessageRecord, NewMessage, ReconcileReport, RoleCounts, SenderRole, SessionRecord,
        SessionStats, SessionStatus, ToolCall,
    };

    // Tiers
    pub use crate::cache::{CacheTier, MemoryCache};
    pub use crate::durable::{DurableStore, SqliteStore};

    // Config
    pub use crate::config::{
        CacheConfig, DurableConfig, EngineConfig, HealthConfig, MigrationConfig, config_path,
        load_config, save_config,
    };

    // Health
    pub use crate::health::{HealthSnapshot, HealthState, TierHealth};

    // Migration
    pub use crate::migration::{MigrationCoordinator, MigrationState, SweeperHandle};

    // Utilities
    pub use crate::util::{data_dir, default_db_path, generate_id, timestamp_ms};
}
