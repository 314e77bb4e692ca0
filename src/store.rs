// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable key/value cache for replication metadata.
//!
//! Holds two keys per entity type (`{entity}:checkpoint`, `{entity}:total_count`)
//! so a restarted process resumes pulling from its last watermark instead of
//! re-pulling everything.
//!
//! # Write-Through
//!
//! All entries are loaded into memory on open. `set()` updates the cache and
//! writes the row immediately. The values are tiny and written at most once
//! per pull cycle, so there is nothing to batch.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Writes retry with exponential backoff (5 attempts, 10ms → 500ms).
//! The cache is updated before the disk write, so a failed write leaves the
//! process consistent with itself and only loses durability.

use crate::config::StoreConfig;
use crate::error::{ReplicationError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Backoff schedule for contended writes: 10ms doubling up to 500ms, at most
/// 5 attempts in total.
#[derive(Debug, Clone, Copy)]
struct BusyBackoff {
    attempt: u32,
    delay: Duration,
}

impl BusyBackoff {
    const MAX_ATTEMPTS: u32 = 5;
    const MAX_DELAY: Duration = Duration::from_millis(500);

    fn new() -> Self {
        Self {
            attempt: 1,
            delay: Duration::from_millis(10),
        }
    }

    /// Delay before the next attempt, or `None` once attempts are spent.
    fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= Self::MAX_ATTEMPTS {
            return None;
        }
        let delay = self.delay;
        self.attempt += 1;
        self.delay = (self.delay * 2).min(Self::MAX_DELAY);
        Some(delay)
    }
}

/// SQLITE_BUSY (5) or SQLITE_LOCKED (6), extended variants included.
fn is_contention(e: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_err) = e else {
        return false;
    };
    match db_err.code().and_then(|code| code.parse::<i32>().ok()) {
        Some(code) => matches!(code & 0xff, 5 | 6),
        None => {
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
    }
}

/// Run `op` until it succeeds, fails with a non-contention error, or the
/// backoff schedule runs out.
async fn with_busy_retry<F, Fut, T>(operation: &str, mut op: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut backoff = BusyBackoff::new();
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_contention(&e) => e,
            Err(e) => return Err(e),
        };
        let Some(delay) = backoff.next_delay() else {
            warn!(operation, attempts = backoff.attempt, "Durable store still contended, giving up");
            return Err(err);
        };
        debug!(operation, attempt = backoff.attempt, ?delay, "Durable store contended, backing off");
        crate::metrics::durable_retries_total(operation);
        tokio::time::sleep(delay).await;
    }
}

/// Persistent string key/value store backed by SQLite.
pub struct DurableStore {
    pool: SqlitePool,
    /// In-memory mirror of every row
    cache: Arc<RwLock<HashMap<String, String>>>,
    path: String,
}

impl DurableStore {
    /// Open (or create) the store described by `config`.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let path = config.sqlite_path.clone();
        let in_memory = config.is_in_memory();
        info!(path = %path, in_memory, "Initializing durable store");

        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path)
        };

        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);
        if config.wal_mode && !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // An in-memory database lives and dies with its connection
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(2)
        };
        let pool = pool_options.connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replication_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM replication_meta")
            .fetch_all(&pool)
            .await?;

        let cache: HashMap<String, String> = rows.into_iter().collect();
        if !cache.is_empty() {
            info!(count = cache.len(), "Restored replication metadata from previous run");
        }

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
            path,
        })
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.cache.read().await.get(key).cloned()
    }

    /// Write-through set.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.cache.write().await.insert(key.to_string(), value.to_string());

        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;

        with_busy_retry("meta_set", || async move {
            sqlx::query(
                r#"
                INSERT INTO replication_meta (key, value, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(key)
            .bind(value)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        debug!(key = %key, "Durable metadata written");
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.cache.write().await.remove(key);

        let pool = &self.pool;
        with_busy_retry("meta_delete", || async move {
            sqlx::query("DELETE FROM replication_meta WHERE key = ?")
                .bind(key)
                .execute(pool)
                .await
        })
        .await?;

        debug!(key = %key, "Durable metadata deleted");
        Ok(())
    }

    /// Snapshot of every entry (for diagnostics).
    pub async fn get_all(&self) -> HashMap<String, String> {
        self.cache.read().await.clone()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database.
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;

        with_busy_retry("meta_checkpoint", || async move {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint the WAL and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Durable store closed");
    }
}

impl std::fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStore").field("path", &self.path).finish()
    }
}
