//! Configuration for databases and sync sessions.
//!
//! # Example
//!
//! ```
//! use docsync::{DatabaseConfig, SyncConfig};
//!
//! // In-memory replica with defaults
//! let config = DatabaseConfig::default();
//! assert!(config.path.is_none());
//! assert_eq!(config.max_history, 1024);
//!
//! // On-disk replica with a fixed identity
//! let config = DatabaseConfig {
//!     path: Some("notes.db".into()),
//!     replica_uid: Some("laptop".into()),
//!     ..Default::default()
//! };
//! assert_eq!(config.sqlite_url().as_deref(), Some("sqlite://notes.db?mode=rwc"));
//!
//! let sync = SyncConfig::default();
//! assert!(!sync.resolve_to_source);
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::resilience::retry::RetryConfig;

/// Configuration for one local database.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path or `sqlite:` URL. `None` keeps everything in memory.
    #[serde(default)]
    pub path: Option<String>,

    /// Identity for a newly created database. Ignored when reopening.
    #[serde(default)]
    pub replica_uid: Option<String>,

    /// Ancestors kept per revision (default: 1024)
    #[serde(default = "default_max_history")]
    pub max_history: usize,

    /// Change records fetched per backend query (default: 500)
    #[serde(default = "default_change_page_size")]
    pub change_page_size: usize,

    /// Buffered change notifications per subscriber (default: 1024)
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_history() -> usize { 1024 }
fn default_change_page_size() -> usize { 500 }
fn default_event_capacity() -> usize { 1024 }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            replica_uid: None,
            max_history: default_max_history(),
            change_page_size: default_change_page_size(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl DatabaseConfig {
    /// In-memory database with a fixed replica uid.
    pub fn in_memory(replica_uid: impl Into<String>) -> Self {
        Self {
            replica_uid: Some(replica_uid.into()),
            ..Default::default()
        }
    }

    /// Connection URL for the SQLite backend, `None` for in-memory.
    #[must_use]
    pub fn sqlite_url(&self) -> Option<String> {
        self.path.as_ref().map(|path| {
            if path.starts_with("sqlite:") {
                path.clone()
            } else {
                format!("sqlite://{}?mode=rwc", path)
            }
        })
    }
}

/// Configuration for sync sessions started by a [`Synchronizer`](crate::Synchronizer).
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Abort a session that runs longer than this (default: 30s)
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Whole-session attempts for retryable failures (default: 3)
    #[serde(default = "default_max_session_attempts")]
    pub max_session_attempts: usize,

    /// First backoff between session attempts (default: 200ms)
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,

    /// Backoff cap between session attempts (default: 5s)
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    /// Resolve conflicts created by a session in favour of the local content
    #[serde(default)]
    pub resolve_to_source: bool,
}

fn default_session_timeout_ms() -> u64 { 30_000 }
fn default_max_session_attempts() -> usize { 3 }
fn default_retry_initial_ms() -> u64 { 200 }
fn default_retry_max_ms() -> u64 { 5_000 }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: default_session_timeout_ms(),
            max_session_attempts: default_max_session_attempts(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_ms: default_retry_max_ms(),
            resolve_to_source: false,
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    /// Backoff policy for restarting whole sessions.
    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: Some(self.max_session_attempts.max(1)),
            initial_delay: Duration::from_millis(self.retry_initial_ms),
            max_delay: Duration::from_millis(self.retry_max_ms),
            ..RetryConfig::sync_session()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_defaults_from_empty_json() {
        let config: DatabaseConfig = serde_json::from_str("{}").unwrap();
        assert!(config.path.is_none());
        assert_eq!(config.max_history, 1024);
        assert_eq!(config.change_page_size, 500);
        assert_eq!(config.event_capacity, 1024);
        assert!(config.sqlite_url().is_none());
    }

    #[test]
    fn test_sqlite_url_passthrough() {
        let config = DatabaseConfig {
            path: Some("sqlite::memory:".into()),
            ..Default::default()
        };
        assert_eq!(config.sqlite_url().as_deref(), Some("sqlite::memory:"));
    }

    #[test]
    fn test_sync_config_partial_json() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"session_timeout_ms": 500, "resolve_to_source": true}"#).unwrap();
        assert_eq!(config.session_timeout(), Duration::from_millis(500));
        assert!(config.resolve_to_source);
        assert_eq!(config.max_session_attempts, 3);

        let retry = config.retry_config();
        assert_eq!(retry.max_retries, Some(3));
        assert_eq!(retry.initial_delay, Duration::from_millis(200));
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        let config = SyncConfig {
            max_session_attempts: 0,
            ..Default::default()
        };
        assert_eq!(config.retry_config().max_retries, Some(1));
    }
}
