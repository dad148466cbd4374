//! Small shared utilities: ids, timestamps, default paths.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix timestamp in milliseconds.
#[must_use]
pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Generate a globally unique identifier (UUID v4).
#[must_use]
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Default data directory (~/.kioku).
#[must_use]
pub fn data_dir() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kioku")
}

/// Default location of the durable store database file.
#[must_use]
pub fn default_db_path() -> PathBuf {
    data_dir().join("kioku.db")
}

/// Default session title derived from the creation timestamp.
#[must_use]
pub fn default_title(created_at_ms: u64) -> String {
    format!("Session {created_at_ms}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_monotonic_enough() {
        let a = timestamp_ms();
        let b = timestamp_ms();
        assert!(b >= a);
        assert!(a > 0);
    }

    #[test]
    fn test_generate_id_unique() {
        assert_ne!(generate_id(), generate_id());
    }
}
