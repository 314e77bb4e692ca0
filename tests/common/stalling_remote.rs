//! Remote wrapper that can stall or hold fetches.
//!
//! Delegates everything to a [`MemoryRemote`]. While stalled, `fetch_since`
//! never completes, which is how tests reach timeout paths. A held fetch
//! reads its rows immediately but does not return them until
//! [`StallingRemote::release`], which is how tests interleave two pulls.

use chrono::{DateTime, Utc};
use entity_replication::memory::MemoryRemote;
use entity_replication::remote::{ChangeFeed, RemoteFuture, RemoteStore};
use entity_replication::RemoteRow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

pub struct StallingRemote {
    pub inner: Arc<MemoryRemote>,
    stalled: AtomicBool,
    hold_next: AtomicBool,
    holding: Arc<AtomicBool>,
    gate: Arc<Notify>,
}

impl StallingRemote {
    pub fn new(inner: Arc<MemoryRemote>) -> Self {
        Self {
            inner,
            stalled: AtomicBool::new(false),
            hold_next: AtomicBool::new(false),
            holding: Arc::new(AtomicBool::new(false)),
            gate: Arc::new(Notify::new()),
        }
    }

    pub fn stall(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Hold the next `fetch_since` after it has read its rows.
    pub fn hold_next_fetch(&self) {
        self.hold_next.store(true, Ordering::SeqCst);
    }

    /// A held fetch has read its rows and is waiting for `release`.
    pub fn is_holding(&self) -> bool {
        self.holding.load(Ordering::SeqCst)
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }
}

impl RemoteStore for StallingRemote {
    fn fetch_since(&self, table: &str, after: DateTime<Utc>, limit: usize) -> RemoteFuture<'_, Vec<RemoteRow>> {
        if self.stalled.load(Ordering::SeqCst) {
            return Box::pin(futures::future::pending());
        }
        let fetch = self.inner.fetch_since(table, after, limit);
        if !self.hold_next.swap(false, Ordering::SeqCst) {
            return fetch;
        }
        let holding = Arc::clone(&self.holding);
        let gate = Arc::clone(&self.gate);
        Box::pin(async move {
            let rows = fetch.await;
            holding.store(true, Ordering::SeqCst);
            gate.notified().await;
            holding.store(false, Ordering::SeqCst);
            rows
        })
    }

    fn fetch_page(&self, table: &str, offset: usize, limit: usize) -> RemoteFuture<'_, Vec<RemoteRow>> {
        self.inner.fetch_page(table, offset, limit)
    }

    fn count(&self, table: &str) -> RemoteFuture<'_, u64> {
        self.inner.count(table)
    }

    fn upsert(&self, table: &str, row: RemoteRow) -> RemoteFuture<'_, ()> {
        self.inner.upsert(table, row)
    }

    fn subscribe(&self, table: &str) -> RemoteFuture<'_, ChangeFeed> {
        self.inner.subscribe(table)
    }
}
