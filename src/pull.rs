// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pull pipeline: incremental fetch-and-merge driven by a checkpoint.
//!
//! # Cycle
//!
//! ```text
//!        pull()
//! Idle ─────────→ debounce check ──(recent + pulled)──→ Debounced
//!                      │
//!                      ↓ admit (in-flight cap, soft)
//!                  Fetching: fetch_since(watermark - skew, batch)
//!                      │     one-shot exact count on cache miss
//!                      ↓
//!                  map → merge each doc → merge checkpoint into stored
//!                      │
//!                      ↓
//!                    Idle
//! ```
//!
//! # Failure Handling
//!
//! A remote fetch error is logged and becomes "zero documents, checkpoint
//! unchanged". Nothing is propagated to the replication primitive, whose own
//! schedule retries later. Per-document merge failures are logged and skipped.
//!
//! # Debounce
//!
//! Live primitives call pull far more often than the network should be hit.
//! A pull is skipped when the checkpoint is marked `pulled` and the last
//! completed pull was less than `min_pull_interval` ago. Time is read through
//! [`Clock`], so tests drive the window with [`ManualClock`](crate::clock::ManualClock).

use crate::clock::Clock;
use crate::concurrency::ConcurrencyGovernor;
use crate::config::PullConfig;
use crate::document::{LocalDoc, RemoteRow};
use crate::local::LocalCollection;
use crate::mapper::{self, FieldSchema};
use crate::merge::{apply_incoming, ConflictHandler, LastWriteWins};
use crate::metadata::{Checkpoint, MetadataStore};
use crate::metrics;
use crate::remote::RemoteStore;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Observable state of the pull pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullPhase {
    /// No pull running; the last one (if any) fetched.
    Idle,
    /// No pull running; the last one was skipped by the debounce window.
    Debounced,
    /// At least one pull is past admission.
    Fetching,
}

impl std::fmt::Display for PullPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PullPhase::Idle => write!(f, "Idle"),
            PullPhase::Debounced => write!(f, "Debounced"),
            PullPhase::Fetching => write!(f, "Fetching"),
        }
    }
}

/// Result of one pull invocation.
#[derive(Debug, Clone)]
pub struct PullOutcome {
    /// Mapped documents returned by the remote, in remote order.
    pub documents: Vec<LocalDoc>,
    pub checkpoint: Checkpoint,
    /// The debounce window skipped this pull; no remote query was issued.
    pub debounced: bool,
}

impl PullOutcome {
    fn empty(checkpoint: Checkpoint, debounced: bool) -> Self {
        Self {
            documents: Vec::new(),
            checkpoint,
            debounced,
        }
    }
}

/// Incremental pull for one entity type.
pub struct PullPipeline<R: RemoteStore> {
    entity_type: String,
    remote: Arc<R>,
    collection: Arc<dyn LocalCollection>,
    metadata: Arc<MetadataStore>,
    handler: Arc<dyn ConflictHandler>,
    governor: ConcurrencyGovernor,
    clock: Arc<dyn Clock>,
    schema: Option<FieldSchema>,
    min_pull_interval: Duration,
    watermark_skew: Duration,
    /// Idle or Debounced; Fetching is derived from the governor.
    resting_phase: Mutex<PullPhase>,
    last_pull_at: Mutex<Option<DateTime<Utc>>>,
    stopped: AtomicBool,
    bypass_debounce: AtomicBool,
    /// One-shot batch cap for the next fetch; 0 = none
    next_batch_limit: AtomicUsize,
}

impl<R: RemoteStore> PullPipeline<R> {
    pub fn new(
        entity_type: &str,
        remote: Arc<R>,
        collection: Arc<dyn LocalCollection>,
        metadata: Arc<MetadataStore>,
        clock: Arc<dyn Clock>,
        config: &PullConfig,
    ) -> Self {
        let schema = collection.schema();
        Self {
            entity_type: entity_type.to_string(),
            remote,
            collection,
            metadata,
            handler: Arc::new(LastWriteWins),
            governor: ConcurrencyGovernor::new(
                entity_type,
                config.max_in_flight,
                config.admission_wait_duration(),
            ),
            clock,
            schema,
            min_pull_interval: config.min_pull_interval_duration(),
            watermark_skew: config.watermark_skew_duration(),
            resting_phase: Mutex::new(PullPhase::Idle),
            last_pull_at: Mutex::new(None),
            stopped: AtomicBool::new(false),
            bypass_debounce: AtomicBool::new(false),
            next_batch_limit: AtomicUsize::new(0),
        }
    }

    pub fn with_conflict_handler(mut self, handler: Arc<dyn ConflictHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn phase(&self) -> PullPhase {
        if self.governor.in_flight() > 0 {
            PullPhase::Fetching
        } else {
            *self.resting_phase.lock().unwrap_or_else(|e| e.into_inner())
        }
    }

    pub fn in_flight(&self) -> usize {
        self.governor.in_flight()
    }

    /// Skip the debounce check on the next pull only.
    pub fn bypass_debounce_once(&self) {
        self.bypass_debounce.store(true, Ordering::SeqCst);
    }

    /// Cap the batch size of the next fetch only.
    pub fn limit_next_batch(&self, limit: Option<usize>) {
        self.next_batch_limit.store(limit.unwrap_or(0), Ordering::SeqCst);
    }

    /// Stop merging. Pulls completing after this discard their results.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Run one pull cycle. Never fails.
    pub async fn pull(&self, checkpoint: Option<Checkpoint>, batch_size: usize) -> PullOutcome {
        let checkpoint = match checkpoint {
            Some(cp) => cp,
            None => self
                .metadata
                .get_checkpoint(&self.entity_type)
                .await
                .unwrap_or_default(),
        };

        if self.is_stopped() {
            return PullOutcome::empty(checkpoint, false);
        }

        let now = self.clock.now();
        let bypass = self.bypass_debounce.swap(false, Ordering::SeqCst);
        if !bypass && self.is_debounced(&checkpoint, now) {
            self.set_resting_phase(PullPhase::Debounced);
            metrics::record_pull_debounced(&self.entity_type);
            debug!(entity_type = %self.entity_type, "Pull debounced");
            return PullOutcome::empty(checkpoint, true);
        }

        let guard = self.governor.admit().await;
        let started = Instant::now();

        let after = checkpoint.query_watermark(self.watermark_skew);
        let limit = match self.next_batch_limit.swap(0, Ordering::SeqCst) {
            0 => batch_size,
            n => n,
        }
        .max(1);

        let fetched = self.remote.fetch_since(&self.entity_type, after, limit).await;

        // Issued whether or not the main fetch succeeded
        self.refresh_total_count_once().await;

        let rows = match fetched {
            Ok(rows) => rows,
            Err(e) => {
                warn!(entity_type = %self.entity_type, error = %e, "Pull fetch failed, keeping checkpoint");
                metrics::record_pull_error(&self.entity_type);
                drop(guard);
                self.set_resting_phase(PullPhase::Idle);
                return PullOutcome::empty(checkpoint, false);
            }
        };

        if self.is_stopped() {
            debug!(entity_type = %self.entity_type, rows = rows.len(), "Session stopped, discarding pull result");
            metrics::record_pull_discarded(&self.entity_type);
            drop(guard);
            self.set_resting_phase(PullPhase::Idle);
            return PullOutcome::empty(checkpoint, false);
        }

        let documents = self.map_rows(&rows);
        let last_row = rows.iter().filter_map(RemoteRow::updated_at).max();
        let completed_at = self.clock.now();
        let advanced = checkpoint.advance(last_row, completed_at);

        for doc in &documents {
            match apply_incoming(self.collection.as_ref(), self.handler.as_ref(), doc.clone()).await {
                Ok(decision) => {
                    metrics::record_merge_decision(&self.entity_type, "pull", decision.as_str());
                }
                Err(e) => {
                    warn!(
                        entity_type = %self.entity_type,
                        id = doc.id().unwrap_or_default(),
                        error = %e,
                        "Failed to merge pulled document"
                    );
                }
            }
        }

        // Overlapping pulls may have stored a newer watermark meanwhile
        let next = match self.metadata.advance_checkpoint(&self.entity_type, advanced).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(entity_type = %self.entity_type, error = %e, "Failed to persist checkpoint");
                advanced
            }
        };
        *self.last_pull_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(completed_at);

        debug!(
            entity_type = %self.entity_type,
            documents = documents.len(),
            watermark = ?next.updated_at,
            "Pull complete"
        );
        metrics::record_pull(&self.entity_type, documents.len(), started.elapsed());

        drop(guard);
        self.set_resting_phase(PullPhase::Idle);

        PullOutcome {
            documents,
            checkpoint: next,
            debounced: false,
        }
    }

    fn is_debounced(&self, checkpoint: &Checkpoint, now: DateTime<Utc>) -> bool {
        if !checkpoint.pulled {
            return false;
        }
        let local_last = *self.last_pull_at.lock().unwrap_or_else(|e| e.into_inner());
        let last = match (checkpoint.last_pull_at, local_last) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        Checkpoint {
            last_pull_at: last,
            ..*checkpoint
        }
        .is_debounced(now, self.min_pull_interval)
    }

    fn map_rows(&self, rows: &[RemoteRow]) -> Vec<LocalDoc> {
        rows.iter()
            .filter_map(|row| match mapper::to_local(&self.entity_type, row, self.schema.as_ref()) {
                Ok(doc) => Some(doc),
                Err(e) => {
                    warn!(entity_type = %self.entity_type, error = %e, "Skipping unmappable remote row");
                    None
                }
            })
            .collect()
    }

    async fn refresh_total_count_once(&self) {
        if self.metadata.cached_total_count(&self.entity_type).await.is_some() {
            return;
        }
        if !self.metadata.try_claim_count_fetch(&self.entity_type) {
            return;
        }

        match self.remote.count(&self.entity_type).await {
            Ok(count) => {
                metrics::record_total_count_fetch(&self.entity_type, true);
                metrics::set_total_count(&self.entity_type, count);
                if let Err(e) = self.metadata.set_total_count(&self.entity_type, count).await {
                    warn!(entity_type = %self.entity_type, error = %e, "Failed to persist total count");
                }
            }
            Err(e) => {
                warn!(entity_type = %self.entity_type, error = %e, "Total count query failed");
                metrics::record_total_count_fetch(&self.entity_type, false);
                self.metadata.release_count_fetch(&self.entity_type);
            }
        }
    }

    fn set_resting_phase(&self, phase: PullPhase) {
        *self.resting_phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }
}
