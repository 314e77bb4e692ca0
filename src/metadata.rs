// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoints and cached row counts.
//!
//! Two tiers: a per-process memory cache in front of the [`DurableStore`].
//! Reads fall through memory → durable → default; writes go to both.
//!
//! # Total Count
//!
//! The exact-count remote query is expensive, so it is issued at most once per
//! cache miss. Pull claims the fetch with [`MetadataStore::try_claim_count_fetch`]
//! before querying; the claim is only released by a failed fetch or by
//! [`MetadataStore::invalidate_total_count`]. Every [`MetadataStore::set_total_count`]
//! invokes the registered listeners synchronously, in registration order.
//!
//! # Checkpoint Monotonicity
//!
//! [`Checkpoint::advance`] never moves the watermark backwards, even if the
//! remote returns an older row than the one last seen. Pulls persist through
//! [`MetadataStore::advance_checkpoint`], which merges with the stored value
//! under a lock, so a slow pull that saw older data cannot rewind the
//! watermark written by a faster one.

use crate::config::StoreConfig;
use crate::error::Result;
use crate::store::DurableStore;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// How far an entity type's remote data has been pulled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// `updated_at` of the last row pulled. `None` means "from the beginning".
    pub updated_at: Option<DateTime<Utc>>,
    /// At least one pull has completed against this checkpoint.
    #[serde(default)]
    pub pulled: bool,
    /// Wall time of the last completed pull.
    #[serde(default)]
    pub last_pull_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn at(updated_at: DateTime<Utc>) -> Self {
        Self {
            updated_at: Some(updated_at),
            ..Self::default()
        }
    }

    /// Lower bound for the next remote query: the watermark minus `skew`,
    /// or the epoch when there is no watermark.
    pub fn query_watermark(&self, skew: Duration) -> DateTime<Utc> {
        let Some(updated_at) = self.updated_at else {
            return DateTime::<Utc>::UNIX_EPOCH;
        };
        chrono::Duration::from_std(skew)
            .ok()
            .and_then(|skew| updated_at.checked_sub_signed(skew))
            .map(|ts| ts.max(DateTime::<Utc>::UNIX_EPOCH))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// The checkpoint after a completed pull whose last row had `last_row`
    /// (if any rows came back).
    pub fn advance(&self, last_row: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        let updated_at = match (self.updated_at, last_row) {
            (Some(prev), Some(next)) => Some(prev.max(next)),
            (prev, next) => next.or(prev),
        };
        Self {
            updated_at,
            pulled: true,
            last_pull_at: Some(now),
        }
    }

    /// Whether a pull at `now` falls inside the debounce window.
    pub fn is_debounced(&self, now: DateTime<Utc>, min_interval: Duration) -> bool {
        if !self.pulled {
            return false;
        }
        let Some(last) = self.last_pull_at else {
            return false;
        };
        match (now - last).to_std() {
            Ok(elapsed) => elapsed < min_interval,
            // Last pull stamped in the future (clock correction): never suppress
            Err(_) => false,
        }
    }

    /// Combine with a checkpoint written by an overlapping pull. The
    /// watermark only moves forward; `last_pull_at` is taken from `newer`.
    pub fn merge(&self, newer: Checkpoint) -> Self {
        let updated_at = match (self.updated_at, newer.updated_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        Self {
            updated_at,
            pulled: self.pulled || newer.pulled,
            last_pull_at: newer.last_pull_at.or(self.last_pull_at),
        }
    }
}

type CountListener = Arc<dyn Fn(u64) + Send + Sync>;
type ListenerMap = Mutex<HashMap<String, Vec<(u64, CountListener)>>>;

/// Handle returned by [`MetadataStore::on_total_count_update`].
///
/// Dropping the handle does not unsubscribe; call [`unsubscribe`](Self::unsubscribe).
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct TotalCountSubscription {
    listeners: Weak<ListenerMap>,
    entity_type: String,
    id: u64,
}

impl TotalCountSubscription {
    /// Remove the listener. Idempotent.
    pub fn unsubscribe(&self) {
        let Some(listeners) = self.listeners.upgrade() else {
            return;
        };
        let mut map = listeners.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = map.get_mut(&self.entity_type) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                map.remove(&self.entity_type);
            }
        }
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }
}

impl std::fmt::Debug for TotalCountSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TotalCountSubscription")
            .field("entity_type", &self.entity_type)
            .field("id", &self.id)
            .finish()
    }
}

fn total_count_key(entity_type: &str) -> String {
    format!("{}:total_count", entity_type)
}

fn checkpoint_key(entity_type: &str) -> String {
    format!("{}:checkpoint", entity_type)
}

/// Two-tier cache for per-entity checkpoints and total row counts.
pub struct MetadataStore {
    durable: DurableStore,
    counts: DashMap<String, u64>,
    checkpoints: DashMap<String, Checkpoint>,
    count_claims: DashSet<String>,
    listeners: Arc<ListenerMap>,
    next_listener_id: AtomicU64,
    checkpoint_writes: tokio::sync::Mutex<()>,
}

impl MetadataStore {
    pub fn new(durable: DurableStore) -> Self {
        Self {
            durable,
            counts: DashMap::new(),
            checkpoints: DashMap::new(),
            count_claims: DashSet::new(),
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener_id: AtomicU64::new(0),
            checkpoint_writes: tokio::sync::Mutex::new(()),
        }
    }

    /// Open the durable store and wrap it.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        Ok(Self::new(DurableStore::open(config).await?))
    }

    pub fn durable(&self) -> &DurableStore {
        &self.durable
    }

    // ------------------------------------------------------------------
    // Total count
    // ------------------------------------------------------------------

    /// Cached count, or `None` on a miss in both tiers.
    pub async fn cached_total_count(&self, entity_type: &str) -> Option<u64> {
        if let Some(count) = self.counts.get(entity_type) {
            return Some(*count);
        }
        let raw = self.durable.get(&total_count_key(entity_type)).await?;
        match raw.parse::<u64>() {
            Ok(count) => {
                self.counts.insert(entity_type.to_string(), count);
                Some(count)
            }
            Err(e) => {
                warn!(entity_type = %entity_type, value = %raw, error = %e, "Ignoring unparseable cached total count");
                None
            }
        }
    }

    /// Cached count, falling back to 0.
    pub async fn get_total_count(&self, entity_type: &str) -> u64 {
        self.cached_total_count(entity_type).await.unwrap_or(0)
    }

    /// Store the count in both tiers and notify listeners.
    ///
    /// Listeners are notified even if the durable write fails; the error is
    /// still returned.
    pub async fn set_total_count(&self, entity_type: &str, count: u64) -> Result<()> {
        self.counts.insert(entity_type.to_string(), count);
        let written = self
            .durable
            .set(&total_count_key(entity_type), &count.to_string())
            .await;
        debug!(entity_type = %entity_type, count, "Total count updated");
        self.notify_total_count(entity_type, count);
        written
    }

    /// Forget the count so the next pull queries it again.
    pub async fn invalidate_total_count(&self, entity_type: &str) -> Result<()> {
        self.counts.remove(entity_type);
        self.count_claims.remove(entity_type);
        self.durable.delete(&total_count_key(entity_type)).await
    }

    /// Claim the one-shot count fetch. Returns `false` if already claimed.
    pub fn try_claim_count_fetch(&self, entity_type: &str) -> bool {
        self.count_claims.insert(entity_type.to_string())
    }

    /// Give the claim back after a failed fetch.
    pub fn release_count_fetch(&self, entity_type: &str) {
        self.count_claims.remove(entity_type);
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    pub fn on_total_count_update<F>(&self, entity_type: &str, callback: F) -> TotalCountSubscription
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(entity_type.to_string())
            .or_default()
            .push((id, Arc::new(callback)));

        TotalCountSubscription {
            listeners: Arc::downgrade(&self.listeners),
            entity_type: entity_type.to_string(),
            id,
        }
    }

    pub fn listener_count(&self, entity_type: &str) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(entity_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn notify_total_count(&self, entity_type: &str, count: u64) {
        // Snapshot so callbacks may (un)subscribe without deadlocking
        let snapshot: Vec<CountListener> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(entity_type)
            .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();

        for callback in snapshot {
            callback(count);
        }
    }

    // ------------------------------------------------------------------
    // Checkpoint
    // ------------------------------------------------------------------

    pub async fn get_checkpoint(&self, entity_type: &str) -> Option<Checkpoint> {
        if let Some(cp) = self.checkpoints.get(entity_type) {
            return Some(*cp);
        }
        let raw = self.durable.get(&checkpoint_key(entity_type)).await?;
        match serde_json::from_str::<Checkpoint>(&raw) {
            Ok(cp) => {
                self.checkpoints.insert(entity_type.to_string(), cp);
                Some(cp)
            }
            Err(e) => {
                warn!(entity_type = %entity_type, error = %e, "Ignoring corrupt cached checkpoint");
                None
            }
        }
    }

    /// Overwrite the checkpoint. Used to re-baseline after a full sync.
    pub async fn set_checkpoint(&self, entity_type: &str, checkpoint: Checkpoint) -> Result<()> {
        let _writes = self.checkpoint_writes.lock().await;
        self.write_checkpoint(entity_type, checkpoint).await
    }

    /// Merge `checkpoint` into the stored one and persist the result, which
    /// is returned. The stored watermark never moves backwards.
    pub async fn advance_checkpoint(&self, entity_type: &str, checkpoint: Checkpoint) -> Result<Checkpoint> {
        let _writes = self.checkpoint_writes.lock().await;
        let merged = match self.get_checkpoint(entity_type).await {
            Some(stored) => stored.merge(checkpoint),
            None => checkpoint,
        };
        self.write_checkpoint(entity_type, merged).await?;
        Ok(merged)
    }

    async fn write_checkpoint(&self, entity_type: &str, checkpoint: Checkpoint) -> Result<()> {
        self.checkpoints.insert(entity_type.to_string(), checkpoint);
        let json = serde_json::to_string(&checkpoint)
            .map_err(|e| crate::error::ReplicationError::Internal(format!("checkpoint encode: {}", e)))?;
        self.durable.set(&checkpoint_key(entity_type), &json).await
    }

    /// Drop the checkpoint from both tiers.
    pub async fn reset_checkpoint(&self, entity_type: &str) -> Result<()> {
        let _writes = self.checkpoint_writes.lock().await;
        self.checkpoints.remove(entity_type);
        self.durable.delete(&checkpoint_key(entity_type)).await
    }

    pub async fn close(&self) {
        self.durable.close().await;
    }
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("durable", &self.durable)
            .field("cached_counts", &self.counts.len())
            .field("cached_checkpoints", &self.checkpoints.len())
            .finish()
    }
}
