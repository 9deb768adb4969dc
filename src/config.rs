//! Configuration for the replication cursor.
//!
//! Configuration is passed to [`CursorDaemon::new()`](crate::CursorDaemon::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use replication_cursor::config::{CursorConfig, ReaderConfig};
//!
//! let config = CursorConfig {
//!     lease_key: "replication_cursor:eu-west".into(),
//!     reader: ReaderConfig { batch_size: 250 },
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! CursorConfig
//! ├── lease_key: String            # Key contended by cursor instances
//! ├── daemon: DaemonConfig         # Loop timing and error budget
//! ├── reader: ReaderConfig         # Batch size
//! ├── gaps: GapConfig              # Backfill window
//! └── store: StoreConfig           # SQLite bookmark/gap persistence
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! lease_key: "replication_cursor"
//!
//! daemon:
//!   role_check_interval: "30s"
//!   lease_ttl: "10s"
//!   max_jitter: "5s"
//!   error_budget: "15m"
//!
//! reader:
//!   batch_size: 100
//!
//! gaps:
//!   retry_window: "10m"
//!
//! store:
//!   sqlite_path: "/var/lib/app/replication_cursor.db"
//! ```
//!
//! Durations are `humantime` strings. Unparsable values fall back to the
//! documented default at use sites; [`CursorConfig::validate`] reports them
//! up front.

use crate::error::{CursorError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `CursorDaemon::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorConfig {
    /// Lease key contended by every cursor instance tailing the same log.
    #[serde(default = "default_lease_key")]
    pub lease_key: String,

    /// Control loop timing and error budget.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Batch reader settings.
    #[serde(default)]
    pub reader: ReaderConfig,

    /// Gap tracker settings.
    #[serde(default)]
    pub gaps: GapConfig,

    /// Bookmark/gap persistence settings.
    #[serde(default)]
    pub store: StoreConfig,
}

fn default_lease_key() -> String {
    "replication_cursor".to_string()
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            lease_key: default_lease_key(),
            daemon: DaemonConfig::default(),
            reader: ReaderConfig::default(),
            gaps: GapConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl CursorConfig {
    /// Create a config for testing: in-memory store, short timings, no jitter.
    pub fn for_testing() -> Self {
        Self {
            lease_key: "replication_cursor:test".to_string(),
            daemon: DaemonConfig {
                role_check_interval: "1s".to_string(),
                lease_ttl: "1s".to_string(),
                max_jitter: "0s".to_string(),
                error_budget: "1m".to_string(),
                call_timeout: "5s".to_string(),
            },
            reader: ReaderConfig { batch_size: 10 },
            gaps: GapConfig::default(),
            store: StoreConfig::in_memory(),
        }
    }

    /// Check the configuration for values that would make the daemon misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.lease_key.trim().is_empty() {
            return Err(CursorError::Config("lease_key must not be empty".to_string()));
        }
        if self.reader.batch_size == 0 {
            return Err(CursorError::Config("reader.batch_size must be > 0".to_string()));
        }
        if self.gaps.max_tracked_gaps == 0 {
            return Err(CursorError::Config("gaps.max_tracked_gaps must be > 0".to_string()));
        }

        let durations = [
            ("daemon.role_check_interval", &self.daemon.role_check_interval),
            ("daemon.lease_ttl", &self.daemon.lease_ttl),
            ("daemon.max_jitter", &self.daemon.max_jitter),
            ("daemon.error_budget", &self.daemon.error_budget),
            ("daemon.call_timeout", &self.daemon.call_timeout),
            ("gaps.retry_window", &self.gaps.retry_window),
        ];
        for (field, value) in durations {
            humantime::parse_duration(value)
                .map_err(|e| CursorError::Config(format!("{field}: invalid duration '{value}': {e}")))?;
        }

        if self.daemon.call_timeout_duration().is_zero() {
            return Err(CursorError::Config("daemon.call_timeout must be > 0".to_string()));
        }
        Ok(())
    }
}

fn parse_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// DaemonConfig: control loop
// ═══════════════════════════════════════════════════════════════════════════════

/// Control loop timing and error budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// How long to sleep when this node is not a replication follower.
    #[serde(default = "default_role_check_interval")]
    pub role_check_interval: String,

    /// TTL requested when acquiring the lease; also the base sleep between
    /// iterations.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl: String,

    /// Upper bound of the random jitter added to each sleep.
    #[serde(default = "default_max_jitter")]
    pub max_jitter: String,

    /// Maximum time the daemon may keep failing (no successful iteration in
    /// between) before it stops itself.
    #[serde(default = "default_error_budget")]
    pub error_budget: String,

    /// Deadline for each individual collaborator call.
    #[serde(default = "default_call_timeout")]
    pub call_timeout: String,
}

fn default_role_check_interval() -> String {
    "30s".to_string()
}

fn default_lease_ttl() -> String {
    "10s".to_string()
}

fn default_max_jitter() -> String {
    "5s".to_string()
}

fn default_error_budget() -> String {
    "15m".to_string()
}

fn default_call_timeout() -> String {
    "30s".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            role_check_interval: default_role_check_interval(),
            lease_ttl: default_lease_ttl(),
            max_jitter: default_max_jitter(),
            error_budget: default_error_budget(),
            call_timeout: default_call_timeout(),
        }
    }
}

impl DaemonConfig {
    pub fn role_check_interval_duration(&self) -> Duration {
        parse_or(&self.role_check_interval, Duration::from_secs(30))
    }

    pub fn lease_ttl_duration(&self) -> Duration {
        parse_or(&self.lease_ttl, Duration::from_secs(10))
    }

    pub fn max_jitter_duration(&self) -> Duration {
        parse_or(&self.max_jitter, Duration::from_secs(5))
    }

    pub fn error_budget_duration(&self) -> Duration {
        parse_or(&self.error_budget, Duration::from_secs(15 * 60))
    }

    pub fn call_timeout_duration(&self) -> Duration {
        parse_or(&self.call_timeout, Duration::from_secs(30))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReaderConfig: batch reading
// ═══════════════════════════════════════════════════════════════════════════════

/// Batch reader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Maximum entries fetched per log query.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    100
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// GapConfig: backfill window
// ═══════════════════════════════════════════════════════════════════════════════

/// Gap tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapConfig {
    /// How long a missing id is retried before it is abandoned.
    #[serde(default = "default_retry_window")]
    pub retry_window: String,

    /// Upper bound on outstanding gaps. Past this, the oldest are abandoned.
    #[serde(default = "default_max_tracked_gaps")]
    pub max_tracked_gaps: usize,
}

fn default_retry_window() -> String {
    "10m".to_string()
}

fn default_max_tracked_gaps() -> usize {
    10_000
}

impl Default for GapConfig {
    fn default() -> Self {
        Self {
            retry_window: default_retry_window(),
            max_tracked_gaps: default_max_tracked_gaps(),
        }
    }
}

impl GapConfig {
    pub fn retry_window_duration(&self) -> Duration {
        parse_or(&self.retry_window, Duration::from_secs(10 * 60))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: SQLite persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Bookmark/gap persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_sqlite_path() -> String {
    "replication_cursor.db".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            wal_mode: true,
        }
    }
}

impl StoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
