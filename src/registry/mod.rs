// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Session registry: the public control surface.
//!
//! Owns at most one [`Session`] per entity type and ties together:
//! - the remote backend ([`RemoteStore`])
//! - the durable checkpoint / count cache ([`MetadataStore`])
//! - the caller's local database ([`LocalDatabase`])
//!
//! # Lifecycle
//!
//! ```text
//! setup_replication(db, "breed", opts)
//!     │  validate options, resolve collection
//!     │  stop any existing "breed" session
//!     ↓
//! Session::start ── primitive.replicate(pull, push) ── realtime.subscribe
//!     │
//!     ↓
//! stop_replication("breed") / stop_all()
//!        primitive.cancel(), realtime.close(), late pull results discarded
//! ```
//!
//! # Error Reporting
//!
//! Operations report booleans and counts. Failures are logged with their
//! typed [`ReplicationError`](crate::error::ReplicationError) and affect only
//! the entity type they occurred on.

mod session;

pub use session::Session;

use crate::clock::{Clock, SystemClock};
use crate::config::{EngineConfig, ReplicationOptions};
use crate::document::{LocalDoc, RemoteRow};
use crate::error::{ReplicationError, Result};
use crate::local::{LocalCollection, LocalDatabase};
use crate::mapper;
use crate::merge::{ConflictHandler, MergeDecision};
use crate::metadata::{Checkpoint, MetadataStore, TotalCountSubscription};
use crate::metrics;
use crate::remote::RemoteStore;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Registry of active replication sessions.
pub struct SessionRegistry<R: RemoteStore> {
    remote: Arc<R>,
    metadata: Arc<MetadataStore>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    sessions: DashMap<String, Arc<Session<R>>>,
}

impl<R: RemoteStore> SessionRegistry<R> {
    pub fn new(remote: Arc<R>, metadata: Arc<MetadataStore>, config: EngineConfig) -> Self {
        Self {
            remote,
            metadata,
            config,
            clock: Arc::new(SystemClock),
            sessions: DashMap::new(),
        }
    }

    /// Open the durable store from `config.store` and build a registry.
    pub async fn open(remote: Arc<R>, config: EngineConfig) -> Result<Self> {
        let metadata = Arc::new(MetadataStore::open(&config.store).await?);
        Ok(Self::new(remote, metadata, config))
    }

    /// Replace the wall clock (tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.metadata
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start replicating `entity_type`. Any existing session for it is
    /// stopped first. Returns `false` on setup failure.
    pub async fn setup_replication(
        &self,
        db: &dyn LocalDatabase,
        entity_type: &str,
        options: ReplicationOptions,
    ) -> bool {
        match self.try_setup(db, entity_type, options).await {
            Ok(()) => {
                metrics::record_session_setup(entity_type, true);
                metrics::set_active_sessions(self.sessions.len());
                true
            }
            Err(e) => {
                error!(entity_type = %entity_type, error = %e, "Replication setup failed");
                metrics::record_session_setup(entity_type, false);
                false
            }
        }
    }

    async fn try_setup(&self, db: &dyn LocalDatabase, entity_type: &str, options: ReplicationOptions) -> Result<()> {
        options.validate()?;
        let collection = db
            .collection(entity_type)
            .ok_or_else(|| ReplicationError::MissingCollection(entity_type.to_string()))?;

        if self.sessions.contains_key(entity_type) {
            info!(entity_type = %entity_type, "Replacing existing replication session");
            self.stop_replication(entity_type).await;
        }

        let session = Arc::new(Session::new(
            entity_type,
            Arc::clone(&self.remote),
            collection,
            Arc::clone(&self.metadata),
            Arc::clone(&self.clock),
            &self.config.settings.pull,
            options,
        ));
        session.start().await?;

        if let Some(previous) = self.sessions.insert(entity_type.to_string(), session) {
            // A concurrent setup won the race; keep the newest
            warn!(entity_type = %entity_type, "Concurrent setup detected, stopping the older session");
            previous.stop().await;
        }
        Ok(())
    }

    /// Stop replicating `entity_type`. No-op if not active.
    pub async fn stop_replication(&self, entity_type: &str) {
        let Some((_, session)) = self.sessions.remove(entity_type) else {
            debug!(entity_type = %entity_type, "No session to stop");
            return;
        };
        session.stop().await;
        metrics::set_active_sessions(self.sessions.len());
    }

    /// Stop every session.
    pub async fn stop_all(&self) {
        let entity_types = self.active_entity_types();
        for entity_type in &entity_types {
            self.stop_replication(entity_type).await;
        }
        if !entity_types.is_empty() {
            info!(count = entity_types.len(), "All replication sessions stopped");
        }
    }

    /// Stop every session and close the durable store.
    pub async fn shutdown(&self) {
        self.stop_all().await;
        self.metadata.close().await;
    }

    pub fn is_replication_active(&self, entity_type: &str) -> bool {
        self.sessions
            .get(entity_type)
            .is_some_and(|session| session.is_active())
    }

    pub fn active_entity_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }

    pub fn session(&self, entity_type: &str) -> Option<Arc<Session<R>>> {
        self.sessions.get(entity_type).map(|e| Arc::clone(e.value()))
    }

    /// Trigger an immediate pull and wait for its document count.
    ///
    /// Returns 0 when no session is active or the pull does not report within
    /// `manual_pull_timeout`.
    pub async fn manual_pull(&self, entity_type: &str, limit: Option<usize>) -> usize {
        let Some(session) = self.session(entity_type) else {
            let e = ReplicationError::NoSession(entity_type.to_string());
            warn!(error = %e, "Manual pull skipped");
            return 0;
        };
        let timeout = self.config.settings.pull.manual_pull_timeout_duration();
        session.manual_pull(limit, timeout).await
    }

    pub fn on_total_count_update<F>(&self, entity_type: &str, callback: F) -> TotalCountSubscription
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.metadata.on_total_count_update(entity_type, callback)
    }

    pub async fn get_total_count(&self, entity_type: &str) -> u64 {
        self.metadata.get_total_count(entity_type).await
    }

    /// Reconcile the whole remote table into the local collection, ignoring
    /// checkpoints, then re-baseline the checkpoint and refresh the count.
    pub async fn force_full_sync(&self, db: &dyn LocalDatabase, entity_type: &str) -> bool {
        let started = Instant::now();
        match self.try_full_sync(db, entity_type).await {
            Ok(written) => {
                info!(entity_type = %entity_type, written, elapsed = ?started.elapsed(), "Full sync complete");
                metrics::record_full_sync(entity_type, true, written, started.elapsed());
                true
            }
            Err(e) => {
                error!(entity_type = %entity_type, error = %e, "Full sync failed");
                metrics::record_full_sync(entity_type, false, 0, started.elapsed());
                false
            }
        }
    }

    async fn try_full_sync(&self, db: &dyn LocalDatabase, entity_type: &str) -> Result<usize> {
        let collection = db
            .collection(entity_type)
            .ok_or_else(|| ReplicationError::MissingCollection(entity_type.to_string()))?;

        let (handler, page_size) = match self.session(entity_type) {
            Some(session) => (
                session.options().conflict_handler.handler(),
                session.options().batch_size,
            ),
            None => {
                let defaults = ReplicationOptions::default();
                (defaults.conflict_handler.handler(), defaults.batch_size)
            }
        };

        let snapshot = self.fetch_snapshot(entity_type, page_size).await?;
        let newest = snapshot.iter().filter_map(RemoteRow::updated_at).max();
        let winners = self
            .select_winners(collection.as_ref(), handler.as_ref(), entity_type, &snapshot)
            .await?;

        let written = if winners.is_empty() {
            0
        } else {
            collection.bulk_upsert(winners).await?
        };

        let checkpoint = Checkpoint::default().advance(newest, self.clock.now());
        self.metadata.set_checkpoint(entity_type, checkpoint).await?;

        let count = match self.remote.count(entity_type).await {
            Ok(count) => count,
            Err(e) => {
                warn!(entity_type = %entity_type, error = %e, "Count query failed, using snapshot size");
                snapshot.len() as u64
            }
        };
        metrics::set_total_count(entity_type, count);
        self.metadata.set_total_count(entity_type, count).await?;

        Ok(written)
    }

    async fn fetch_snapshot(&self, entity_type: &str, page_size: usize) -> Result<Vec<RemoteRow>> {
        let page_size = page_size.max(1);
        let mut rows = Vec::new();
        loop {
            let page = self
                .remote
                .fetch_page(entity_type, rows.len(), page_size)
                .await
                .map_err(|e| ReplicationError::remote("fetch_page", entity_type, e))?;
            let last_page = page.len() < page_size;
            rows.extend(page);
            if last_page {
                break;
            }
        }
        debug!(entity_type = %entity_type, rows = rows.len(), "Fetched full snapshot");
        Ok(rows)
    }

    async fn select_winners(
        &self,
        collection: &dyn LocalCollection,
        handler: &dyn ConflictHandler,
        entity_type: &str,
        snapshot: &[RemoteRow],
    ) -> Result<Vec<LocalDoc>> {
        let schema = collection.schema();
        let mut winners = Vec::new();
        for row in snapshot {
            let doc = match mapper::to_local(entity_type, row, schema.as_ref()) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(entity_type = %entity_type, error = %e, "Skipping unmappable row in full sync");
                    continue;
                }
            };
            let id = doc.id().unwrap_or_default().to_string();
            let existing = collection.find_by_id(&id).await?;
            let decision = handler.decide(existing.as_ref(), &doc);
            metrics::record_merge_decision(entity_type, "full_sync", decision.as_str());
            if decision != MergeDecision::Skip {
                winners.push(doc);
            }
        }
        Ok(winners)
    }
}

impl<R: RemoteStore> std::fmt::Debug for SessionRegistry<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.active_entity_types())
            .field("metadata", &self.metadata)
            .finish()
    }
}
