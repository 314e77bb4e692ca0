// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One replication session per entity type.
//!
//! A session owns the pull and push pipelines, the realtime subscription and
//! the handle of the replication primitive it configured. It is the
//! [`ReplicationHandler`] the primitive calls back into.
//!
//! ```text
//! primitive ──pull()──→ Session ──→ PullPipeline ──→ remote.fetch_since
//!     │                    │
//!     └──push()──────────→ └──────→ PushPipeline ──→ remote.upsert
//!
//! remote change feed ──→ RealtimeSubscriber ──→ merge rule ──→ local collection
//! ```

use crate::clock::Clock;
use crate::config::{PullConfig, ReplicationOptions};
use crate::document::LocalDoc;
use crate::error::{ReplicationError, Result};
use crate::local::{LocalCollection, PrimitiveSettings, PullBatch, PushRow, ReplicationHandle, ReplicationHandler};
use crate::metadata::{Checkpoint, MetadataStore};
use crate::pull::{PullPhase, PullPipeline};
use crate::push::PushPipeline;
use crate::realtime::{RealtimeHandle, RealtimeSubscriber};
use crate::remote::RemoteStore;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Active replication for one entity type.
pub struct Session<R: RemoteStore> {
    entity_type: String,
    options: ReplicationOptions,
    remote: Arc<R>,
    collection: Arc<dyn LocalCollection>,
    metadata: Arc<MetadataStore>,
    clock: Arc<dyn Clock>,
    pull: PullPipeline<R>,
    push: PushPipeline<R>,
    primitive: Mutex<Option<Box<dyn ReplicationHandle>>>,
    realtime: Mutex<Option<RealtimeHandle>>,
    /// Document count of every pull that reached the remote
    received_tx: broadcast::Sender<usize>,
    started_at: DateTime<Utc>,
}

impl<R: RemoteStore> Session<R> {
    pub fn new(
        entity_type: &str,
        remote: Arc<R>,
        collection: Arc<dyn LocalCollection>,
        metadata: Arc<MetadataStore>,
        clock: Arc<dyn Clock>,
        pull_config: &PullConfig,
        options: ReplicationOptions,
    ) -> Self {
        let handler = options.conflict_handler.handler();
        let pull = PullPipeline::new(
            entity_type,
            Arc::clone(&remote),
            Arc::clone(&collection),
            Arc::clone(&metadata),
            Arc::clone(&clock),
            pull_config,
        )
        .with_conflict_handler(handler);
        let push = PushPipeline::new(entity_type, Arc::clone(&remote), Arc::clone(&clock));
        let (received_tx, _) = broadcast::channel(16);
        let started_at = clock.now();

        Self {
            entity_type: entity_type.to_string(),
            options,
            remote,
            collection,
            metadata,
            clock,
            pull,
            push,
            primitive: Mutex::new(None),
            realtime: Mutex::new(None),
            received_tx,
            started_at,
        }
    }

    /// Wire the replication primitive, then the realtime feed.
    ///
    /// A failing primitive fails the session. A failing change-feed
    /// subscription is logged and the session continues on polling alone.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let settings = PrimitiveSettings {
            replication_id: format!("remote-{}", self.entity_type),
            batch_size: self.options.batch_size,
            pull_interval: self.options.pull_interval_duration(),
            live: true,
        };

        let handler: Arc<dyn ReplicationHandler> = Arc::clone(self) as Arc<dyn ReplicationHandler>;
        let primitive = self.collection.replicate(handler, settings)?;
        *self.primitive.lock().unwrap_or_else(|e| e.into_inner()) = Some(primitive);

        if self.options.enable_realtime {
            let subscriber = RealtimeSubscriber::new(
                &self.entity_type,
                Arc::clone(&self.remote),
                Arc::clone(&self.collection),
                self.options.conflict_handler.handler(),
                Arc::clone(&self.clock),
            );
            match subscriber.start().await {
                Ok(handle) => {
                    *self.realtime.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
                }
                Err(e) => {
                    warn!(entity_type = %self.entity_type, error = %e, "Realtime subscription failed, continuing with polling only");
                }
            }
        }

        info!(
            entity_type = %self.entity_type,
            batch_size = self.options.batch_size,
            realtime = self.has_realtime(),
            conflict_handler = self.options.conflict_handler.name(),
            "Replication session started"
        );
        Ok(())
    }

    /// Cancel the primitive and close the realtime feed. In-flight pulls
    /// finish but their results are discarded.
    pub async fn stop(&self) {
        self.pull.stop();

        let primitive = self.primitive.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(primitive) = primitive {
            primitive.cancel().await;
        }

        let realtime = self.realtime.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(realtime) = realtime {
            realtime.close().await;
        }

        info!(entity_type = %self.entity_type, "Replication session stopped");
    }

    /// Run a pull cycle now, bypassing the debounce window, and wait up to
    /// `timeout` for it to report. Returns 0 on timeout.
    pub async fn manual_pull(&self, limit: Option<usize>, timeout: Duration) -> usize {
        let mut received = self.received_tx.subscribe();

        self.pull.bypass_debounce_once();
        self.pull.limit_next_batch(limit);

        {
            let primitive = self.primitive.lock().unwrap_or_else(|e| e.into_inner());
            match primitive.as_ref() {
                Some(p) if !p.is_stopped() => p.re_sync(),
                _ => {
                    debug!(entity_type = %self.entity_type, error = %ReplicationError::Shutdown, "Manual pull skipped");
                    return 0;
                }
            }
        }

        match tokio::time::timeout(timeout, received.recv()).await {
            Ok(Ok(count)) => {
                crate::metrics::record_manual_pull(&self.entity_type, count, false);
                count
            }
            Ok(Err(e)) => {
                warn!(entity_type = %self.entity_type, error = %e, "Manual pull lost its result");
                0
            }
            Err(_) => {
                warn!(entity_type = %self.entity_type, ?timeout, "Manual pull timed out");
                crate::metrics::record_manual_pull(&self.entity_type, 0, true);
                0
            }
        }
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn options(&self) -> &ReplicationOptions {
        &self.options
    }

    pub fn pull_phase(&self) -> PullPhase {
        self.pull.phase()
    }

    pub fn in_flight(&self) -> usize {
        self.pull.in_flight()
    }

    pub fn has_realtime(&self) -> bool {
        self.realtime
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(RealtimeHandle::is_open)
    }

    /// Whether the primitive is wired and still running.
    pub fn is_active(&self) -> bool {
        !self.pull.is_stopped()
            && self
                .primitive
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .as_ref()
                .is_some_and(|p| !p.is_stopped())
    }

    pub async fn checkpoint(&self) -> Option<Checkpoint> {
        self.metadata.get_checkpoint(&self.entity_type).await
    }

    pub async fn total_count(&self) -> u64 {
        self.metadata.get_total_count(&self.entity_type).await
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

impl<R: RemoteStore> ReplicationHandler for Session<R> {
    fn pull(&self, checkpoint: Option<Checkpoint>, batch_size: usize) -> BoxFuture<'_, PullBatch> {
        Box::pin(async move {
            let outcome = self.pull.pull(checkpoint, batch_size).await;
            if !outcome.debounced {
                // Nobody waiting is fine
                let _ = self.received_tx.send(outcome.documents.len());
            }
            PullBatch {
                documents: outcome.documents,
                checkpoint: Some(outcome.checkpoint),
            }
        })
    }

    fn push(&self, rows: Vec<PushRow>) -> BoxFuture<'_, Vec<LocalDoc>> {
        Box::pin(async move { self.push.push(rows).await })
    }
}

impl<R: RemoteStore> std::fmt::Debug for Session<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("entity_type", &self.entity_type)
            .field("options", &self.options)
            .field("pull_phase", &self.pull_phase())
            .field("started_at", &self.started_at)
            .finish()
    }
}
