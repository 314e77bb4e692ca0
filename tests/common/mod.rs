// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Row and document builders with fixed timestamps
//! - A registry wired to the in-memory backend
//! - A stalling remote for timeout paths

#![allow(dead_code)]

pub mod stalling_remote;

pub use stalling_remote::*;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use entity_replication::document::format_watermark;
use entity_replication::memory::{MemoryDatabase, MemoryRemote};
use entity_replication::{EngineConfig, LocalDoc, RemoteRow, ReplicationOptions, SessionRegistry};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const ENTITY: &str = "breed";

/// Fixed base instant all test timestamps are offset from.
pub fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap()
}

/// `base() + secs`.
pub fn ts(secs: i64) -> DateTime<Utc> {
    base() + ChronoDuration::seconds(secs)
}

/// A live remote row updated at `base() + secs`.
pub fn remote_row(id: &str, name: &str, secs: i64) -> RemoteRow {
    RemoteRow::from_value(json!({
        "id": id,
        "name": name,
        "deleted": false,
        "created_at": format_watermark(ts(0)),
        "updated_at": format_watermark(ts(secs)),
    }))
    .unwrap()
}

/// A local document updated at `base() + secs`.
pub fn local_doc(id: &str, name: &str, secs: i64) -> LocalDoc {
    LocalDoc::from_value(json!({
        "id": id,
        "name": name,
        "_deleted": false,
        "created_at": format_watermark(ts(0)),
        "updated_at": format_watermark(ts(secs)),
    }))
    .unwrap()
}

pub fn name_of(doc: &LocalDoc) -> Option<&Value> {
    doc.get("name")
}

/// Polling-only options with a long interval, so cycles only run when the
/// test triggers them.
pub fn polling_options() -> ReplicationOptions {
    ReplicationOptions {
        enable_realtime: false,
        pull_interval: "1h".to_string(),
        ..ReplicationOptions::default()
    }
}

pub fn realtime_options() -> ReplicationOptions {
    ReplicationOptions {
        enable_realtime: true,
        ..polling_options()
    }
}

pub struct Harness {
    pub remote: Arc<MemoryRemote>,
    pub db: MemoryDatabase,
    pub registry: SessionRegistry<MemoryRemote>,
}

impl Harness {
    /// In-memory metadata store, empty remote, one empty `breed` collection.
    pub async fn new() -> Self {
        Self::with_config(EngineConfig::for_testing()).await
    }

    pub async fn with_config(config: EngineConfig) -> Self {
        let remote = Arc::new(MemoryRemote::new());
        let registry = SessionRegistry::open(Arc::clone(&remote), config)
            .await
            .expect("Failed to open registry");
        let db = MemoryDatabase::new();
        db.create(ENTITY);
        Self { remote, db, registry }
    }

    /// Set up replication and wait for the initial pull to persist a
    /// checkpoint.
    pub async fn start(&self, options: ReplicationOptions) {
        assert!(self.registry.setup_replication(&self.db, ENTITY, options).await);
        let metadata = Arc::clone(self.registry.metadata());
        eventually("initial pull", || {
            let metadata = Arc::clone(&metadata);
            async move { metadata.get_checkpoint(ENTITY).await.is_some() }
        })
        .await;
        // Let the cycle finish reporting before the test drives the next one
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    pub async fn local_len(&self) -> usize {
        self.db.get(ENTITY).unwrap().len().await
    }

    pub async fn local(&self, id: &str) -> Option<LocalDoc> {
        self.db.get(ENTITY).unwrap().get(id).await
    }
}

/// Poll `condition` until it holds, panicking after five seconds.
pub async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if condition().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("Timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
