// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local store integration traits.
//!
//! Defines what the engine needs from the embedded, local-first database:
//!
//! - [`LocalDatabase`]: resolves the collection for an entity type
//! - [`LocalCollection`]: find-by-id, insert, partial patch, bulk upsert and an
//!   optional field schema
//! - the replication primitive extension point ([`LocalCollection::replicate`]):
//!   the collection drives its own retry/liveness schedule and calls back into
//!   a [`ReplicationHandler`] for pull and push
//!
//! The engine configures the primitive; it does not reimplement it. See
//! [`crate::memory`] for an in-process implementation.

use crate::document::{Fields, LocalDoc};
use crate::mapper::FieldSchema;
use crate::metadata::Checkpoint;
use futures::future::BoxFuture;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Result type for local store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Boxed future returned by local store operations.
pub type LocalFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Simplified error for local store operations.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct StoreError(pub String);

/// A per-entity-type local collection.
pub trait LocalCollection: Send + Sync + 'static {
    /// Collection name (for logging).
    fn name(&self) -> &str;

    /// Declarative field allow-list, if the collection has one.
    fn schema(&self) -> Option<FieldSchema> {
        None
    }

    fn find_by_id(&self, id: &str) -> LocalFuture<'_, Option<LocalDoc>>;

    fn insert(&self, doc: LocalDoc) -> LocalFuture<'_, ()>;

    /// Merge `patch` into the existing document with this id.
    fn patch(&self, id: &str, patch: Fields) -> LocalFuture<'_, ()>;

    /// Insert or replace each document by id. Returns how many were written.
    fn bulk_upsert(&self, docs: Vec<LocalDoc>) -> LocalFuture<'_, usize>;

    /// Start the collection's replication primitive against an external source.
    ///
    /// The primitive owns scheduling (periodic pulls, pushing local writes,
    /// retries) and calls `handler` for each cycle.
    fn replicate(
        &self,
        handler: Arc<dyn ReplicationHandler>,
        settings: PrimitiveSettings,
    ) -> StoreResult<Box<dyn ReplicationHandle>>;
}

/// The local database: one collection per entity type.
pub trait LocalDatabase: Send + Sync {
    fn collection(&self, entity_type: &str) -> Option<Arc<dyn LocalCollection>>;
}

/// Settings handed to the replication primitive.
#[derive(Debug, Clone)]
pub struct PrimitiveSettings {
    /// Stable identifier for this replication (e.g. `"remote-breed"`).
    pub replication_id: String,
    pub batch_size: usize,
    /// Retry / polling cadence.
    pub pull_interval: Duration,
    /// Keep running after the initial sync.
    pub live: bool,
}

/// Result of one pull cycle handed back to the primitive.
#[derive(Debug, Clone, Default)]
pub struct PullBatch {
    pub documents: Vec<LocalDoc>,
    pub checkpoint: Option<Checkpoint>,
}

/// A local mutation offered for push.
#[derive(Debug, Clone)]
pub struct PushRow {
    pub new_document: LocalDoc,
    /// What the caller believed the remote state was before this write.
    pub assumed_master_state: Option<LocalDoc>,
}

impl PushRow {
    pub fn new(new_document: LocalDoc) -> Self {
        Self {
            new_document,
            assumed_master_state: None,
        }
    }
}

/// Pull/push callbacks the primitive invokes. Neither ever fails: errors are
/// absorbed into an empty batch or a conflict list.
pub trait ReplicationHandler: Send + Sync + 'static {
    fn pull(&self, checkpoint: Option<Checkpoint>, batch_size: usize) -> BoxFuture<'_, PullBatch>;

    /// Returns the conflicts (original local documents whose push failed).
    fn push(&self, rows: Vec<PushRow>) -> BoxFuture<'_, Vec<LocalDoc>>;
}

/// Control handle for a running replication primitive.
pub trait ReplicationHandle: Send + Sync {
    /// Ask the primitive to run a pull cycle now.
    fn re_sync(&self);

    /// Stop the primitive. In-flight handler calls are not aborted.
    fn cancel(&self) -> BoxFuture<'_, ()>;

    fn is_stopped(&self) -> bool;
}
