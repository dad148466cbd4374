//! Unified error types for the persistence engine.
//!
//! All failure modes are consolidated into [`EngineError`]. Callers can
//! pattern-match on specific variants (e.g. to trigger the degraded-mode
//! fallback on a cache [`EngineError::TierUnavailable`]).

use std::fmt;

/// One of the two storage tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Ephemeral low-latency cache holding the active conversation.
    Cache,
    /// Durable relational store holding the permanent record.
    Durable,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cache => write!(f, "cache"),
            Self::Durable => write!(f, "durable"),
        }
    }
}

/// The main error type for engine operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Malformed session id or message.
    #[error("validation: {0}")]
    Validation(String),

    /// Unknown session.
    #[error("session not found: {0}")]
    NotFound(String),

    /// A storage tier is unreachable.
    #[error("{tier} tier unavailable: {reason}")]
    TierUnavailable {
        /// Which tier failed.
        tier: Tier,
        /// Human-readable failure description.
        reason: String,
    },

    /// Concurrent or out-of-order migration attempt on one session.
    #[error("migration conflict: {0}")]
    MigrationConflict(String),

    /// Counter/row-count mismatch found by verification or reconciliation.
    #[error("consistency: {0}")]
    Consistency(String),

    /// Serialization error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// A lock was poisoned by a panic.
    #[error("lock: {0}")]
    Lock(String),

    /// An async task failed to join.
    #[error("task: {0}")]
    Task(String),
}

impl EngineError {
    /// Create a validation error.
    #[inline]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-found error for the given session id.
    #[inline]
    pub fn not_found(session_id: impl Into<String>) -> Self {
        Self::NotFound(session_id.into())
    }

    /// Create a cache-unavailable error.
    #[inline]
    pub fn cache_unavailable(reason: impl Into<String>) -> Self {
        Self::TierUnavailable {
            tier: Tier::Cache,
            reason: reason.into(),
        }
    }

    /// Create a durable-store-unavailable error.
    #[inline]
    pub fn durable_unavailable(reason: impl Into<String>) -> Self {
        Self::TierUnavailable {
            tier: Tier::Durable,
            reason: reason.into(),
        }
    }

    /// Create a consistency error.
    #[inline]
    pub fn consistency(msg: impl Into<String>) -> Self {
        Self::Consistency(msg.into())
    }

    /// Create a migration-conflict error.
    #[inline]
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::MigrationConflict(msg.into())
    }

    /// Whether this error reports the given tier as unreachable.
    #[must_use]
    pub fn is_tier_unavailable(&self, tier: Tier) -> bool {
        matches!(self, Self::TierUnavailable { tier: t, .. } if *t == tier)
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

/// `#[from]` cannot be used here because the conversion targets
/// different variants: constraint violations (a second message id
/// claiming an occupied `order` slot) are data conflicts, everything
/// else is the durable tier being unreachable.
impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::Consistency(err.to_string())
            }
            _ => Self::durable_unavailable(err.to_string()),
        }
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_matching() {
        let err = EngineError::cache_unavailable("connection refused");
        assert!(err.is_tier_unavailable(Tier::Cache));
        assert!(!err.is_tier_unavailable(Tier::Durable));
    }

    #[test]
    fn test_error_helpers() {
        assert!(matches!(
            EngineError::not_found("s1"),
            EngineError::NotFound(_)
        ));
        assert!(matches!(
            EngineError::conflict("busy"),
            EngineError::MigrationConflict(_)
        ));
    }

    #[test]
    fn test_display() {
        let err = EngineError::durable_unavailable("disk full");
        assert_eq!(err.to_string(), "durable tier unavailable: disk full");
    }
}
