//! Configuration for the replication engine.
//!
//! Two layers:
//!
//! - [`EngineConfig`]: process-wide, passed to
//!   [`SessionRegistry::new()`](crate::registry::SessionRegistry::new). Pull
//!   pacing and the durable metadata store.
//! - [`ReplicationOptions`]: per entity type, passed to
//!   [`setup_replication()`](crate::registry::SessionRegistry::setup_replication).
//!
//! Both can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use entity_replication::config::{EngineConfig, ReplicationOptions};
//!
//! let config = EngineConfig::for_testing();
//! let options = ReplicationOptions {
//!     batch_size: 50,
//!     ..Default::default()
//! };
//! assert!(options.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! EngineConfig
//! ├── settings: ReplicationSettings
//! │   └── pull: PullConfig          # debounce, skew, in-flight cap, timeouts
//! └── store: StoreConfig            # SQLite metadata persistence
//!
//! ReplicationOptions                # per entity type
//! ├── batch_size
//! ├── pull_interval
//! ├── enable_realtime
//! └── conflict_handler
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! settings:
//!   pull:
//!     min_pull_interval: "5s"
//!     watermark_skew: "5s"
//!     max_in_flight: 3
//!     admission_wait: "1s"
//!     manual_pull_timeout: "10s"
//!
//! store:
//!   sqlite_path: "/var/lib/app/replication_meta.db"
//! ```

use crate::error::{ReplicationError, Result};
use crate::merge::{ConflictHandler, LastWriteWins};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to SessionRegistry::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// Process-wide engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub settings: ReplicationSettings,

    /// Durable metadata persistence.
    #[serde(default)]
    pub store: StoreConfig,
}

impl EngineConfig {
    /// Create a minimal config for testing (in-memory SQLite).
    pub fn for_testing() -> Self {
        Self {
            settings: ReplicationSettings::default(),
            store: StoreConfig::in_memory(),
        }
    }
}

/// General settings for the replication logic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationSettings {
    #[serde(default)]
    pub pull: PullConfig,
}

// ═══════════════════════════════════════════════════════════════════════════════
// PullConfig: pacing of the pull pipeline
// ═══════════════════════════════════════════════════════════════════════════════

/// Pull pipeline pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullConfig {
    /// A pull within this long of the last completed one is skipped when the
    /// checkpoint is already marked pulled (e.g., "5s").
    #[serde(default = "default_min_pull_interval")]
    pub min_pull_interval: String,

    /// Subtracted from the checkpoint watermark before querying, to tolerate
    /// clock and visibility lag between remote writer and reader.
    #[serde(default = "default_watermark_skew")]
    pub watermark_skew: String,

    /// Soft cap on concurrent pulls per entity type.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Delay applied to a pull admitted over the cap.
    #[serde(default = "default_admission_wait")]
    pub admission_wait: String,

    /// How long `manual_pull` waits for the primitive to report documents.
    #[serde(default = "default_manual_pull_timeout")]
    pub manual_pull_timeout: String,
}

fn default_min_pull_interval() -> String {
    "5s".to_string()
}

fn default_watermark_skew() -> String {
    "5s".to_string()
}

fn default_max_in_flight() -> usize {
    3
}

fn default_admission_wait() -> String {
    "1s".to_string()
}

fn default_manual_pull_timeout() -> String {
    "10s".to_string()
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            min_pull_interval: default_min_pull_interval(),
            watermark_skew: default_watermark_skew(),
            max_in_flight: default_max_in_flight(),
            admission_wait: default_admission_wait(),
            manual_pull_timeout: default_manual_pull_timeout(),
        }
    }
}

impl PullConfig {
    pub fn min_pull_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.min_pull_interval).unwrap_or(Duration::from_secs(5))
    }

    pub fn watermark_skew_duration(&self) -> Duration {
        humantime::parse_duration(&self.watermark_skew).unwrap_or(Duration::from_secs(5))
    }

    pub fn admission_wait_duration(&self) -> Duration {
        humantime::parse_duration(&self.admission_wait).unwrap_or(Duration::from_secs(1))
    }

    pub fn manual_pull_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.manual_pull_timeout).unwrap_or(Duration::from_secs(10))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: durable metadata persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Durable metadata store configuration.
///
/// Checkpoints and cached counts are persisted to SQLite so a restarted
/// process resumes from its last watermark.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database, or `:memory:`.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_true() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "replication_meta.db".to_string(),
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
// ReplicationOptions: per entity type
// ═══════════════════════════════════════════════════════════════════════════════

/// How incoming rows are reconciled with local documents.
#[derive(Clone, Default, Serialize, Deserialize)]
pub enum ConflictPolicy {
    #[default]
    #[serde(rename = "last-write-wins")]
    LastWriteWins,

    /// Caller-supplied handler. Not serializable.
    #[serde(skip)]
    Custom(Arc<dyn ConflictHandler>),
}

impl ConflictPolicy {
    pub fn handler(&self) -> Arc<dyn ConflictHandler> {
        match self {
            ConflictPolicy::LastWriteWins => Arc::new(LastWriteWins),
            ConflictPolicy::Custom(handler) => Arc::clone(handler),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConflictPolicy::LastWriteWins => "last-write-wins",
            ConflictPolicy::Custom(_) => "custom",
        }
    }
}

impl std::fmt::Debug for ConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictPolicy::LastWriteWins => f.write_str("LastWriteWins"),
            ConflictPolicy::Custom(handler) => f.debug_tuple("Custom").field(handler).finish(),
        }
    }
}

/// Per-entity-type replication options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationOptions {
    /// Rows per pull cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Retry / polling cadence of the replication primitive (e.g., "60s").
    #[serde(default = "default_pull_interval")]
    pub pull_interval: String,

    /// Open a change-feed subscription alongside polling.
    #[serde(default = "default_true")]
    pub enable_realtime: bool,

    #[serde(default)]
    pub conflict_handler: ConflictPolicy,
}

fn default_batch_size() -> usize {
    100
}

fn default_pull_interval() -> String {
    "60s".to_string()
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            pull_interval: default_pull_interval(),
            enable_realtime: true,
            conflict_handler: ConflictPolicy::default(),
        }
    }
}

impl ReplicationOptions {
    pub fn pull_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.pull_interval).unwrap_or(Duration::from_secs(60))
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ReplicationError::Config("batch_size must be > 0".to_string()));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
