// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Realtime subscriber: applies the remote change feed to the local store.
//!
//! | Event | Local doc | Action |
//! |-------|-----------|--------|
//! | insert/update | any | map, then the shared merge rule |
//! | delete | present | patch `_deleted = true`, `updated_at = now` |
//! | delete | absent | nothing |
//!
//! A failing event is logged and skipped; the subscription stays open.
//! Reconnection is the transport's business: when the feed ends the task
//! exits and logs it.

use crate::clock::Clock;
use crate::document::{format_watermark, Fields, LOCAL_DELETED, UPDATED_AT};
use crate::error::{ReplicationError, Result};
use crate::local::LocalCollection;
use crate::mapper::{self, FieldSchema};
use crate::merge::{apply_incoming, ConflictHandler, MergeDecision};
use crate::metrics;
use crate::remote::{ChangeEvent, ChangeKind, RemoteStore};
use futures::StreamExt;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

/// What applying one change event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeOutcome {
    Merged(MergeDecision),
    SoftDeleted,
    /// Delete for a document we never had, or an event for another table.
    Ignored,
}

impl RealtimeOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            RealtimeOutcome::Merged(d) => d.as_str(),
            RealtimeOutcome::SoftDeleted => "soft_deleted",
            RealtimeOutcome::Ignored => "ignored",
        }
    }
}

/// Applies change events for one entity type.
pub struct RealtimeSubscriber<R: RemoteStore> {
    entity_type: String,
    remote: Arc<R>,
    collection: Arc<dyn LocalCollection>,
    handler: Arc<dyn ConflictHandler>,
    clock: Arc<dyn Clock>,
    schema: Option<FieldSchema>,
}

impl<R: RemoteStore> RealtimeSubscriber<R> {
    pub fn new(
        entity_type: &str,
        remote: Arc<R>,
        collection: Arc<dyn LocalCollection>,
        handler: Arc<dyn ConflictHandler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let schema = collection.schema();
        Self {
            entity_type: entity_type.to_string(),
            remote,
            collection,
            handler,
            clock,
            schema,
        }
    }

    /// Open the change feed and spawn the apply loop.
    pub async fn start(self) -> Result<RealtimeHandle> {
        let mut feed = self
            .remote
            .subscribe(&self.entity_type)
            .await
            .map_err(|e| ReplicationError::remote("subscribe", &self.entity_type, e))?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let entity_type = self.entity_type.clone();
        let span = info_span!("realtime", entity_type = %entity_type);

        let task = tokio::spawn(
            async move {
                info!("Realtime subscription open");
                metrics::set_realtime_subscribed(&self.entity_type, true);

                loop {
                    tokio::select! {
                        biased;

                        _ = shutdown_rx.changed() => {
                            debug!("Realtime shutdown signaled");
                            break;
                        }

                        event = feed.next() => {
                            let Some(event) = event else {
                                warn!("Change feed ended");
                                break;
                            };
                            let kind = event.kind.as_str();
                            match self.apply(event).await {
                                Ok(outcome) => {
                                    metrics::record_realtime_event(&self.entity_type, kind, outcome.as_str());
                                }
                                Err(e) => {
                                    warn!(kind, error = %e, "Failed to apply change event");
                                    metrics::record_realtime_event(&self.entity_type, kind, "error");
                                }
                            }
                        }
                    }
                }

                metrics::set_realtime_subscribed(&self.entity_type, false);
                info!("Realtime subscription closed");
            }
            .instrument(span),
        );

        Ok(RealtimeHandle {
            entity_type,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }

    /// Apply one change event.
    pub async fn apply(&self, event: ChangeEvent) -> Result<RealtimeOutcome> {
        if event.table != self.entity_type {
            return Ok(RealtimeOutcome::Ignored);
        }

        match event.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                let row = event.new.ok_or_else(|| {
                    ReplicationError::Mapping(format!("{} event without new row", event.kind.as_str()))
                })?;
                let doc = mapper::to_local(&self.entity_type, &row, self.schema.as_ref())?;
                let decision = apply_incoming(self.collection.as_ref(), self.handler.as_ref(), doc).await?;
                metrics::record_merge_decision(&self.entity_type, "realtime", decision.as_str());
                Ok(RealtimeOutcome::Merged(decision))
            }
            ChangeKind::Delete => {
                let id = event
                    .row_id()
                    .ok_or_else(|| ReplicationError::Mapping("delete event without id".to_string()))?
                    .to_string();

                if self.collection.find_by_id(&id).await?.is_none() {
                    debug!(id = %id, "Delete for unknown document, ignoring");
                    return Ok(RealtimeOutcome::Ignored);
                }

                let mut patch = Fields::new();
                patch.insert(LOCAL_DELETED.to_string(), Value::Bool(true));
                patch.insert(UPDATED_AT.to_string(), format_watermark(self.clock.now()));
                self.collection.patch(&id, patch).await?;

                debug!(id = %id, "Soft-deleted from change feed");
                Ok(RealtimeOutcome::SoftDeleted)
            }
        }
    }
}

/// Running subscription. Closing is idempotent.
pub struct RealtimeHandle {
    entity_type: String,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeHandle {
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn is_open(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Signal the loop to stop and wait for it.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(entity_type = %self.entity_type, error = %e, "Realtime task ended abnormally");
            }
        }
    }
}

impl std::fmt::Debug for RealtimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeHandle")
            .field("entity_type", &self.entity_type)
            .field("open", &self.is_open())
            .finish()
    }
}
