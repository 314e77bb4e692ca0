// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process remote store, local database and replication primitive.
//!
//! Used by the test suite and for embedding the engine without a network:
//!
//! - [`MemoryRemote`]: tables of rows, a broadcast change feed, call counters
//!   and failure injection
//! - [`MemoryDatabase`] / [`MemoryCollection`]: local collections with an
//!   optional schema and a queue of local writes awaiting push
//! - [`PollingReplication`]: a minimal replication primitive that pushes
//!   queued writes and pulls on an interval, on local writes and on `re_sync`

use crate::document::{Fields, LocalDoc, RemoteRow, ID};
use crate::local::{
    LocalCollection, LocalDatabase, LocalFuture, PrimitiveSettings, PushRow, ReplicationHandle,
    ReplicationHandler, StoreError, StoreResult,
};
use crate::mapper::FieldSchema;
use crate::metadata::Checkpoint;
use crate::remote::{ChangeEvent, ChangeFeed, RemoteError, RemoteFuture, RemoteStore};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CHANGE_FEED_CAPACITY: usize = 1024;

// ═══════════════════════════════════════════════════════════════════════════════
// MemoryRemote
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct Faults {
    fetch: bool,
    count: bool,
    subscribe: bool,
    upsert_ids: HashSet<String>,
}

/// In-memory remote backend.
pub struct MemoryRemote {
    tables: Mutex<HashMap<String, BTreeMap<String, RemoteRow>>>,
    changes: broadcast::Sender<ChangeEvent>,
    faults: Mutex<Faults>,
    fetch_calls: AtomicUsize,
    count_calls: AtomicUsize,
    upsert_calls: AtomicUsize,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            tables: Mutex::new(HashMap::new()),
            changes,
            faults: Mutex::new(Faults::default()),
            fetch_calls: AtomicUsize::new(0),
            count_calls: AtomicUsize::new(0),
            upsert_calls: AtomicUsize::new(0),
        }
    }

    /// Insert rows without emitting change events.
    pub fn seed(&self, table: &str, rows: Vec<RemoteRow>) {
        let mut tables = self.lock_tables();
        let t = tables.entry(table.to_string()).or_default();
        for row in rows {
            // Rows without an id are kept under a synthetic key so fetches still return them
            let key = row
                .id()
                .map(str::to_string)
                .unwrap_or_else(|| format!("__anonymous_{}", t.len()));
            t.insert(key, row);
        }
    }

    /// Write a row as another client would: upsert and emit an event.
    pub fn write(&self, table: &str, row: RemoteRow) {
        let event = self.store_row(table, row);
        self.emit(event);
    }

    /// Physically remove a row and emit a delete event with the key-only
    /// before image.
    pub fn remove(&self, table: &str, id: &str) -> Option<RemoteRow> {
        let removed = self.lock_tables().get_mut(table).and_then(|t| t.remove(id));
        let mut old = Fields::new();
        old.insert(ID.to_string(), Value::String(id.to_string()));
        self.emit(ChangeEvent::delete(table, RemoteRow::new(old)));
        removed
    }

    /// Send a raw event to subscribers.
    pub fn emit(&self, event: ChangeEvent) {
        // No subscribers is fine
        let _ = self.changes.send(event);
    }

    pub fn get(&self, table: &str, id: &str) -> Option<RemoteRow> {
        self.lock_tables().get(table).and_then(|t| t.get(id).cloned())
    }

    pub fn len(&self, table: &str) -> usize {
        self.lock_tables().get(table).map(BTreeMap::len).unwrap_or(0)
    }

    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.lock_faults().fetch = fail;
    }

    pub fn fail_count(&self, fail: bool) {
        self.lock_faults().count = fail;
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.lock_faults().subscribe = fail;
    }

    /// Make upserts of this id fail.
    pub fn fail_upserts_for(&self, id: &str) {
        self.lock_faults().upsert_ids.insert(id.to_string());
    }

    pub fn clear_faults(&self) {
        *self.lock_faults() = Faults::default();
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn count_calls(&self) -> usize {
        self.count_calls.load(Ordering::SeqCst)
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.changes.receiver_count()
    }

    fn store_row(&self, table: &str, row: RemoteRow) -> ChangeEvent {
        let Some(id) = row.id().map(str::to_string) else {
            return ChangeEvent::insert(table, row);
        };
        let mut tables = self.lock_tables();
        let t = tables.entry(table.to_string()).or_default();
        match t.get_mut(&id) {
            Some(existing) => {
                let old = existing.clone();
                for (k, v) in row.into_fields() {
                    existing.set(k, v);
                }
                ChangeEvent::update(table, Some(old), existing.clone())
            }
            None => {
                t.insert(id, row.clone());
                ChangeEvent::insert(table, row)
            }
        }
    }

    fn sorted_rows(&self, table: &str) -> Vec<RemoteRow> {
        let mut rows: Vec<RemoteRow> = self
            .lock_tables()
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default();
        rows.sort_by(|a, b| {
            a.updated_at()
                .cmp(&b.updated_at())
                .then_with(|| a.id().cmp(&b.id()))
        });
        rows
    }

    fn lock_tables(&self) -> std::sync::MutexGuard<'_, HashMap<String, BTreeMap<String, RemoteRow>>> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl RemoteStore for MemoryRemote {
    fn fetch_since(&self, table: &str, after: DateTime<Utc>, limit: usize) -> RemoteFuture<'_, Vec<RemoteRow>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let result = if self.lock_faults().fetch {
            Err(RemoteError("injected fetch failure".to_string()))
        } else {
            Ok(self
                .sorted_rows(table)
                .into_iter()
                .filter(|row| row.updated_at().is_some_and(|ts| ts > after))
                .take(limit)
                .collect())
        };
        Box::pin(async move { result })
    }

    fn fetch_page(&self, table: &str, offset: usize, limit: usize) -> RemoteFuture<'_, Vec<RemoteRow>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let result = if self.lock_faults().fetch {
            Err(RemoteError("injected fetch failure".to_string()))
        } else {
            Ok(self.sorted_rows(table).into_iter().skip(offset).take(limit).collect())
        };
        Box::pin(async move { result })
    }

    fn count(&self, table: &str) -> RemoteFuture<'_, u64> {
        self.count_calls.fetch_add(1, Ordering::SeqCst);
        let result = if self.lock_faults().count {
            Err(RemoteError("injected count failure".to_string()))
        } else {
            Ok(self.len(table) as u64)
        };
        Box::pin(async move { result })
    }

    fn upsert(&self, table: &str, row: RemoteRow) -> RemoteFuture<'_, ()> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        let id = row.id().map(str::to_string);
        let fail = id
            .as_ref()
            .is_some_and(|id| self.lock_faults().upsert_ids.contains(id));
        let table = table.to_string();
        Box::pin(async move {
            if fail {
                return Err(RemoteError(format!("injected upsert failure for {:?}", id)));
            }
            if id.is_none() {
                return Err(RemoteError("row has no id".to_string()));
            }
            let event = self.store_row(&table, row);
            self.emit(event);
            Ok(())
        })
    }

    fn subscribe(&self, table: &str) -> RemoteFuture<'_, ChangeFeed> {
        let result = if self.lock_faults().subscribe {
            Err(RemoteError("injected subscribe failure".to_string()))
        } else {
            let rx = self.changes.subscribe();
            let table = table.to_string();
            let feed = futures::stream::unfold((rx, table), |(mut rx, table)| async move {
                loop {
                    match rx.recv().await {
                        Ok(event) if event.table == table => return Some((event, (rx, table))),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(table = %table, skipped, "Change feed lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            });
            Ok(Box::pin(feed) as ChangeFeed)
        };
        Box::pin(async move { result })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MemoryDatabase / MemoryCollection
// ═══════════════════════════════════════════════════════════════════════════════

/// In-memory local database.
#[derive(Default)]
pub struct MemoryDatabase {
    collections: Mutex<HashMap<String, Arc<MemoryCollection>>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collection under its name.
    pub fn add(&self, collection: Arc<MemoryCollection>) -> Arc<MemoryCollection> {
        self.collections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(collection.name.clone(), Arc::clone(&collection));
        collection
    }

    /// Create and register an empty collection.
    pub fn create(&self, name: &str) -> Arc<MemoryCollection> {
        self.add(Arc::new(MemoryCollection::new(name)))
    }

    pub fn get(&self, name: &str) -> Option<Arc<MemoryCollection>> {
        self.collections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }
}

impl LocalDatabase for MemoryDatabase {
    fn collection(&self, entity_type: &str) -> Option<Arc<dyn LocalCollection>> {
        self.get(entity_type).map(|c| c as Arc<dyn LocalCollection>)
    }
}

/// In-memory local collection.
pub struct MemoryCollection {
    name: String,
    schema: Option<FieldSchema>,
    inner: Arc<CollectionState>,
}

/// State shared with a running [`PollingReplication`].
#[derive(Default)]
struct CollectionState {
    docs: RwLock<BTreeMap<String, LocalDoc>>,
    /// Local writes not yet pushed
    pending: Mutex<Vec<PushRow>>,
    local_write: Notify,
}

impl CollectionState {
    fn take_pending(&self) -> Vec<PushRow> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Put failed rows back ahead of anything written since.
    fn requeue(&self, rows: Vec<PushRow>) {
        if rows.is_empty() {
            return;
        }
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let newer = std::mem::take(&mut *pending);
        *pending = rows;
        pending.extend(newer);
    }
}

impl MemoryCollection {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            schema: None,
            inner: Arc::new(CollectionState::default()),
        }
    }

    pub fn with_schema(mut self, schema: FieldSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub async fn get(&self, id: &str) -> Option<LocalDoc> {
        self.inner.docs.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.docs.read().await.is_empty()
    }

    pub async fn all(&self) -> Vec<LocalDoc> {
        self.inner.docs.read().await.values().cloned().collect()
    }

    /// An application write: store it and queue it for push.
    pub async fn write(&self, doc: LocalDoc) -> StoreResult<()> {
        let id = doc
            .id()
            .ok_or_else(|| StoreError("document has no id".to_string()))?
            .to_string();
        let previous = self.inner.docs.write().await.insert(id, doc.clone());
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(PushRow {
                new_document: doc,
                assumed_master_state: previous,
            });
        self.inner.local_write.notify_one();
        Ok(())
    }

    /// Number of local writes awaiting push.
    pub fn pending_push(&self) -> usize {
        self.inner.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl LocalCollection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> Option<FieldSchema> {
        self.schema.clone()
    }

    fn find_by_id(&self, id: &str) -> LocalFuture<'_, Option<LocalDoc>> {
        let id = id.to_string();
        Box::pin(async move { Ok(self.inner.docs.read().await.get(&id).cloned()) })
    }

    fn insert(&self, doc: LocalDoc) -> LocalFuture<'_, ()> {
        Box::pin(async move {
            let id = doc
                .id()
                .ok_or_else(|| StoreError("document has no id".to_string()))?
                .to_string();
            let mut docs = self.inner.docs.write().await;
            if docs.contains_key(&id) {
                return Err(StoreError(format!("document {} already exists", id)));
            }
            docs.insert(id, doc);
            Ok(())
        })
    }

    fn patch(&self, id: &str, patch: Fields) -> LocalFuture<'_, ()> {
        let id = id.to_string();
        Box::pin(async move {
            let mut docs = self.inner.docs.write().await;
            let doc = docs
                .get_mut(&id)
                .ok_or_else(|| StoreError(format!("document {} not found", id)))?;
            for (k, v) in patch {
                doc.set(k, v);
            }
            Ok(())
        })
    }

    fn bulk_upsert(&self, docs: Vec<LocalDoc>) -> LocalFuture<'_, usize> {
        Box::pin(async move {
            let mut stored = self.inner.docs.write().await;
            let mut written = 0;
            for doc in docs {
                if let Some(id) = doc.id().map(str::to_string) {
                    stored.insert(id, doc);
                    written += 1;
                }
            }
            Ok(written)
        })
    }

    fn replicate(
        &self,
        handler: Arc<dyn ReplicationHandler>,
        settings: PrimitiveSettings,
    ) -> StoreResult<Box<dyn ReplicationHandle>> {
        Ok(Box::new(PollingReplication::spawn(
            Arc::clone(&self.inner),
            handler,
            settings,
        )))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PollingReplication
// ═══════════════════════════════════════════════════════════════════════════════

/// Minimal replication primitive.
///
/// Each cycle pushes queued local writes (conflicts are re-queued) and then
/// pulls once. Cycles run on `pull_interval`, on local writes and on
/// [`re_sync`](ReplicationHandle::re_sync). With `live = false` it runs one
/// cycle and stops.
pub struct PollingReplication {
    replication_id: String,
    resync: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    stopped: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingReplication {
    fn spawn(
        collection: Arc<CollectionState>,
        handler: Arc<dyn ReplicationHandler>,
        settings: PrimitiveSettings,
    ) -> Self {
        let resync = Arc::new(Notify::new());
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let stopped = Arc::new(AtomicBool::new(false));

        let task_resync = Arc::clone(&resync);
        let task_stopped = Arc::clone(&stopped);
        let replication_id = settings.replication_id.clone();

        let task = tokio::spawn(async move {
            info!(replication_id = %settings.replication_id, "Polling replication started");
            let mut checkpoint: Option<Checkpoint> = None;
            let mut interval = tokio::time::interval(settings.pull_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = task_resync.notified() => {}
                    _ = collection.local_write.notified() => {}
                    _ = interval.tick() => {}
                }

                let cycle = async {
                    let rows = collection.take_pending();
                    if !rows.is_empty() {
                        let originals: HashMap<String, PushRow> = rows
                            .iter()
                            .filter_map(|r| r.new_document.id().map(|id| (id.to_string(), r.clone())))
                            .collect();
                        let conflicts = handler.push(rows).await;
                        let retry: Vec<PushRow> = conflicts
                            .iter()
                            .filter_map(|doc| doc.id().and_then(|id| originals.get(id).cloned()))
                            .collect();
                        if !retry.is_empty() {
                            debug!(conflicts = retry.len(), "Re-queueing push conflicts");
                        }
                        collection.requeue(retry);
                    }
                    handler.pull(checkpoint, settings.batch_size).await
                };

                // A cycle stuck on the remote must not block cancel()
                let batch = tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    batch = cycle => batch,
                };
                if batch.checkpoint.is_some() {
                    checkpoint = batch.checkpoint;
                }

                if !settings.live {
                    break;
                }
            }

            task_stopped.store(true, Ordering::SeqCst);
            info!(replication_id = %settings.replication_id, "Polling replication stopped");
        });

        Self {
            replication_id,
            resync,
            shutdown_tx,
            stopped,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn replication_id(&self) -> &str {
        &self.replication_id
    }
}

impl ReplicationHandle for PollingReplication {
    fn re_sync(&self) {
        self.resync.notify_one();
    }

    fn cancel(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let _ = self.shutdown_tx.send(true);
            let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(task) = task {
                if let Err(e) = task.await {
                    warn!(replication_id = %self.replication_id, error = %e, "Replication task ended abnormally");
                }
            }
            self.stopped.store(true, Ordering::SeqCst);
        })
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
