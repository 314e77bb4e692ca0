// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration Tests for Entity Replication
//!
//! Everything runs against the in-memory remote and local database; no
//! external services are required.
//!
//! # Running Tests
//! ```bash
//! cargo test --test integration
//!
//! # Run one group
//! cargo test --test integration registry_
//! ```
//!
//! # Test Organization
//! - `pull_*` - pull pipeline driven directly with a manual clock
//! - `registry_*` - session lifecycle through the public control surface
//! - `push_*` - local writes reaching the remote
//! - `realtime_*` - change feed applied to the local store
//! - `full_sync_*` - forced reconciliation
//! - `restart_*` - durable checkpoint and count across processes

mod common;

use common::*;
use entity_replication::config::{EngineConfig, PullConfig, StoreConfig};
use entity_replication::local::LocalCollection;
use entity_replication::memory::{MemoryCollection, MemoryRemote};
use entity_replication::pull::{PullPhase, PullPipeline};
use entity_replication::{ManualClock, MetadataStore, ReplicationOptions, SessionRegistry};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;

// =============================================================================
// Pull Pipeline Tests
// =============================================================================

struct PullRig {
    remote: Arc<MemoryRemote>,
    collection: Arc<MemoryCollection>,
    metadata: Arc<MetadataStore>,
    clock: ManualClock,
    pipeline: PullPipeline<MemoryRemote>,
}

async fn pull_rig() -> PullRig {
    pull_rig_with(PullConfig::default()).await
}

async fn pull_rig_with(config: PullConfig) -> PullRig {
    let remote = Arc::new(MemoryRemote::new());
    let collection = Arc::new(MemoryCollection::new(ENTITY));
    let metadata = Arc::new(
        MetadataStore::open(&StoreConfig::in_memory())
            .await
            .expect("Failed to open metadata store"),
    );
    let clock = ManualClock::new(ts(3600));
    let pipeline = PullPipeline::new(
        ENTITY,
        Arc::clone(&remote),
        Arc::clone(&collection) as Arc<dyn LocalCollection>,
        Arc::clone(&metadata),
        Arc::new(clock.clone()),
        &config,
    );
    PullRig {
        remote,
        collection,
        metadata,
        clock,
        pipeline,
    }
}

#[tokio::test]
async fn pull_batches_advance_watermark_with_skew_overlap() {
    let rig = pull_rig().await;
    rig.remote.seed(
        ENTITY,
        vec![
            remote_row("a", "Akita", 10),
            remote_row("b", "Beagle", 20),
            remote_row("c", "Corgi", 30),
        ],
    );

    let first = rig.pipeline.pull(None, 2).await;
    assert_eq!(first.documents.len(), 2);
    assert_eq!(first.checkpoint.updated_at, Some(ts(20)));
    assert!(first.checkpoint.pulled);

    // The next query starts 5s before the watermark, so "b" comes back too
    rig.clock.advance(Duration::from_secs(6));
    let second = rig.pipeline.pull(Some(first.checkpoint), 2).await;
    let ids: Vec<_> = second.documents.iter().filter_map(|d| d.id()).collect();
    assert_eq!(ids, vec!["b", "c"]);
    assert_eq!(second.checkpoint.updated_at, Some(ts(30)));

    rig.clock.advance(Duration::from_secs(6));
    let third = rig.pipeline.pull(Some(second.checkpoint), 2).await;
    assert_eq!(third.documents.len(), 1);
    assert_eq!(third.checkpoint.updated_at, Some(ts(30)));

    assert_eq!(rig.collection.len().await, 3);
    assert_eq!(rig.metadata.get_checkpoint(ENTITY).await, Some(third.checkpoint));
}

#[tokio::test]
async fn pull_batches_without_skew_return_only_new_rows() {
    let rig = pull_rig_with(PullConfig {
        watermark_skew: "0s".to_string(),
        ..PullConfig::default()
    })
    .await;
    rig.remote.seed(
        ENTITY,
        vec![
            remote_row("a", "Akita", 10),
            remote_row("b", "Beagle", 20),
            remote_row("c", "Corgi", 30),
        ],
    );

    let first = rig.pipeline.pull(None, 2).await;
    assert_eq!(first.documents.len(), 2);
    assert_eq!(first.checkpoint.updated_at, Some(ts(20)));
    assert_eq!(rig.collection.len().await, 2);

    rig.clock.advance(Duration::from_secs(6));
    let second = rig.pipeline.pull(Some(first.checkpoint), 2).await;
    let ids: Vec<_> = second.documents.iter().filter_map(|d| d.id()).collect();
    assert_eq!(ids, vec!["c"]);
    assert_eq!(second.checkpoint.updated_at, Some(ts(30)));
    assert_eq!(rig.collection.len().await, 3);
}

#[tokio::test]
async fn pull_picks_up_rows_written_after_last_pull() {
    let rig = pull_rig().await;
    rig.remote.seed(ENTITY, vec![remote_row("a", "Akita", 10)]);

    let first = rig.pipeline.pull(None, 100).await;
    assert_eq!(first.checkpoint.updated_at, Some(ts(10)));

    rig.remote.seed(ENTITY, vec![remote_row("b", "Beagle", 40)]);
    rig.clock.advance(Duration::from_secs(10));

    let second = rig.pipeline.pull(Some(first.checkpoint), 100).await;
    assert_eq!(second.documents.len(), 1);
    assert_eq!(second.documents[0].id(), Some("b"));
    assert_eq!(second.checkpoint.updated_at, Some(ts(40)));
    assert!(rig.collection.get("b").await.is_some());
}

#[tokio::test]
async fn pull_empty_remote_marks_pulled_without_watermark() {
    let rig = pull_rig().await;

    let outcome = rig.pipeline.pull(None, 100).await;
    assert!(outcome.documents.is_empty());
    assert!(!outcome.debounced);
    assert!(outcome.checkpoint.pulled);
    assert_eq!(outcome.checkpoint.updated_at, None);
    assert_eq!(outcome.checkpoint.last_pull_at, Some(ts(3600)));
}

#[tokio::test]
async fn pull_is_idempotent() {
    let rig = pull_rig().await;
    rig.remote.seed(ENTITY, vec![remote_row("a", "Akita", 10), remote_row("b", "Beagle", 20)]);

    let first = rig.pipeline.pull(None, 100).await;
    let before = rig.collection.all().await;

    rig.clock.advance(Duration::from_secs(30));
    rig.pipeline.pull(Some(first.checkpoint), 100).await;
    rig.clock.advance(Duration::from_secs(30));
    rig.pipeline.pull(None, 100).await;

    assert_eq!(rig.collection.all().await, before);
}

#[tokio::test]
async fn pull_keeps_newer_local_document() {
    let rig = pull_rig().await;
    rig.collection
        .insert(local_doc("a", "edited locally", 50))
        .await
        .unwrap();
    rig.remote.seed(ENTITY, vec![remote_row("a", "Akita", 10)]);

    let outcome = rig.pipeline.pull(None, 100).await;
    assert_eq!(outcome.documents.len(), 1);

    let local = rig.collection.get("a").await.unwrap();
    assert_eq!(name_of(&local), Some(&json!("edited locally")));
}

#[tokio::test]
async fn pull_debounce_window() {
    let rig = pull_rig().await;
    rig.remote.seed(ENTITY, vec![remote_row("a", "Akita", 10)]);

    let first = rig.pipeline.pull(None, 100).await;
    assert_eq!(rig.remote.fetch_calls(), 1);

    rig.clock.advance(Duration::from_secs(4));
    let skipped = rig.pipeline.pull(Some(first.checkpoint), 100).await;
    assert!(skipped.debounced);
    assert!(skipped.documents.is_empty());
    assert_eq!(skipped.checkpoint, first.checkpoint);
    assert_eq!(rig.remote.fetch_calls(), 1);
    assert_eq!(rig.pipeline.phase(), PullPhase::Debounced);

    rig.clock.advance(Duration::from_secs(1));
    let fetched = rig.pipeline.pull(Some(first.checkpoint), 100).await;
    assert!(!fetched.debounced);
    assert_eq!(rig.remote.fetch_calls(), 2);
    assert_eq!(rig.pipeline.phase(), PullPhase::Idle);
}

#[tokio::test]
async fn pull_debounce_bypass_and_limit_are_one_shot() {
    let rig = pull_rig().await;
    rig.remote.seed(
        ENTITY,
        vec![
            remote_row("a", "Akita", 10),
            remote_row("b", "Beagle", 20),
            remote_row("c", "Corgi", 30),
        ],
    );

    let first = rig.pipeline.pull(None, 1).await;
    assert_eq!(first.documents.len(), 1);

    rig.pipeline.bypass_debounce_once();
    rig.pipeline.limit_next_batch(Some(2));
    let forced = rig.pipeline.pull(Some(first.checkpoint), 100).await;
    assert!(!forced.debounced);
    assert_eq!(forced.documents.len(), 2);

    let again = rig.pipeline.pull(Some(forced.checkpoint), 100).await;
    assert!(again.debounced);
}

#[tokio::test]
async fn pull_fetch_failure_keeps_checkpoint() {
    let rig = pull_rig().await;
    rig.remote.seed(ENTITY, vec![remote_row("a", "Akita", 10)]);
    rig.remote.fail_fetches(true);

    let outcome = rig.pipeline.pull(None, 100).await;
    assert!(outcome.documents.is_empty());
    assert!(!outcome.checkpoint.pulled);
    assert_eq!(rig.metadata.get_checkpoint(ENTITY).await, None);

    // Count is still issued alongside the failed fetch
    assert_eq!(rig.remote.count_calls(), 1);
    assert_eq!(rig.metadata.get_total_count(ENTITY).await, 1);
}

#[tokio::test]
async fn pull_count_fetched_once_and_listener_fires_once() {
    let rig = pull_rig().await;
    rig.remote.seed(ENTITY, vec![remote_row("a", "Akita", 10), remote_row("b", "Beagle", 20)]);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _sub = rig
        .metadata
        .on_total_count_update(ENTITY, move |count| sink.lock().unwrap().push(count));

    let mut checkpoint = None;
    for _ in 0..3 {
        let outcome = rig.pipeline.pull(checkpoint, 100).await;
        checkpoint = Some(outcome.checkpoint);
        rig.clock.advance(Duration::from_secs(10));
    }

    assert_eq!(rig.remote.count_calls(), 1);
    assert_eq!(*seen.lock().unwrap(), vec![2]);
}

#[tokio::test]
async fn pull_failed_count_is_retried_next_cycle() {
    let rig = pull_rig().await;
    rig.remote.seed(ENTITY, vec![remote_row("a", "Akita", 10)]);
    rig.remote.fail_count(true);

    let first = rig.pipeline.pull(None, 100).await;
    assert_eq!(rig.metadata.cached_total_count(ENTITY).await, None);

    rig.remote.clear_faults();
    rig.clock.advance(Duration::from_secs(10));
    rig.pipeline.pull(Some(first.checkpoint), 100).await;

    assert_eq!(rig.remote.count_calls(), 2);
    assert_eq!(rig.metadata.get_total_count(ENTITY).await, 1);
}

#[tokio::test]
async fn pull_after_stop_is_discarded() {
    let rig = pull_rig().await;
    rig.remote.seed(ENTITY, vec![remote_row("a", "Akita", 10)]);

    rig.pipeline.stop();
    let outcome = rig.pipeline.pull(None, 100).await;

    assert!(outcome.documents.is_empty());
    assert!(rig.collection.is_empty().await);
    assert_eq!(rig.metadata.get_checkpoint(ENTITY).await, None);
}

struct HeldPullRig {
    remote: Arc<StallingRemote>,
    collection: Arc<MemoryCollection>,
    metadata: Arc<MetadataStore>,
    clock: ManualClock,
    pipeline: PullPipeline<StallingRemote>,
}

/// Pull rig whose remote can hold a fetch open while another pull runs.
async fn held_pull_rig() -> HeldPullRig {
    let remote = Arc::new(StallingRemote::new(Arc::new(MemoryRemote::new())));
    let collection = Arc::new(MemoryCollection::new(ENTITY));
    let metadata = Arc::new(
        MetadataStore::open(&StoreConfig::in_memory())
            .await
            .expect("Failed to open metadata store"),
    );
    let clock = ManualClock::new(ts(3600));
    let pipeline = PullPipeline::new(
        ENTITY,
        Arc::clone(&remote),
        Arc::clone(&collection) as Arc<dyn LocalCollection>,
        Arc::clone(&metadata),
        Arc::new(clock.clone()),
        &PullConfig::default(),
    );
    HeldPullRig {
        remote,
        collection,
        metadata,
        clock,
        pipeline,
    }
}

#[tokio::test]
async fn pull_slow_overlapping_pull_does_not_rewind_checkpoint() {
    let rig = held_pull_rig().await;
    rig.remote.inner.seed(ENTITY, vec![remote_row("a", "Akita", 10)]);
    rig.remote.hold_next_fetch();

    let remote = &*rig.remote;
    let pipeline = &rig.pipeline;
    let (slow, fast) = tokio::join!(pipeline.pull(None, 100), async {
        eventually("slow pull reads its rows", || async move { remote.is_holding() }).await;
        remote.inner.seed(ENTITY, vec![remote_row("b", "Beagle", 40)]);
        let fast = pipeline.pull(None, 100).await;
        remote.release();
        fast
    });

    assert_eq!(fast.checkpoint.updated_at, Some(ts(40)));
    // The slow pull only saw "a" but reports the stored watermark
    assert_eq!(slow.documents.len(), 1);
    assert_eq!(slow.checkpoint.updated_at, Some(ts(40)));

    let stored = rig.metadata.get_checkpoint(ENTITY).await.unwrap();
    assert_eq!(stored.updated_at, Some(ts(40)));
    assert_eq!(rig.collection.len().await, 2);
}

#[tokio::test]
async fn pull_stopped_mid_fetch_rests_idle() {
    let rig = held_pull_rig().await;
    rig.remote.inner.seed(ENTITY, vec![remote_row("a", "Akita", 10)]);

    let first = rig.pipeline.pull(None, 100).await;
    rig.clock.advance(Duration::from_secs(1));
    assert!(rig.pipeline.pull(Some(first.checkpoint), 100).await.debounced);
    assert_eq!(rig.pipeline.phase(), PullPhase::Debounced);

    rig.pipeline.bypass_debounce_once();
    rig.remote.hold_next_fetch();

    let remote = &*rig.remote;
    let pipeline = &rig.pipeline;
    let (outcome, ()) = tokio::join!(pipeline.pull(Some(first.checkpoint), 100), async {
        eventually("pull reaches the remote", || async move { remote.is_holding() }).await;
        assert_eq!(pipeline.phase(), PullPhase::Fetching);
        pipeline.stop();
        remote.release();
    });

    assert!(outcome.documents.is_empty());
    assert_eq!(rig.pipeline.phase(), PullPhase::Idle);
    assert_eq!(rig.metadata.get_checkpoint(ENTITY).await, Some(first.checkpoint));
}

#[tokio::test]
async fn pull_ignores_last_pull_stamped_in_the_future() {
    let rig = pull_rig().await;
    rig.remote.seed(ENTITY, vec![remote_row("a", "Akita", 10)]);

    // Written by a process whose clock ran an hour ahead
    let skewed = entity_replication::Checkpoint::default().advance(None, ts(7200));
    rig.metadata.set_checkpoint(ENTITY, skewed).await.unwrap();

    let outcome = rig.pipeline.pull(None, 100).await;
    assert!(!outcome.debounced);
    assert_eq!(rig.remote.fetch_calls(), 1);
    assert_eq!(outcome.checkpoint.last_pull_at, Some(ts(3600)));
    assert_eq!(rig.collection.len().await, 1);
}

// =============================================================================
// Registry Tests
// =============================================================================

#[tokio::test]
async fn registry_initial_pull_populates_collection() {
    let h = Harness::new().await;
    h.remote.seed(
        ENTITY,
        vec![
            remote_row("a", "Akita", 10),
            remote_row("b", "Beagle", 20),
            remote_row("c", "Corgi", 30),
        ],
    );

    h.start(polling_options()).await;

    assert!(h.registry.is_replication_active(ENTITY));
    assert_eq!(h.local_len().await, 3);
    assert_eq!(h.registry.get_total_count(ENTITY).await, 3);

    let checkpoint = h.registry.metadata().get_checkpoint(ENTITY).await.unwrap();
    assert_eq!(checkpoint.updated_at, Some(ts(30)));

    let deleted = h.local("a").await.unwrap();
    assert_eq!(deleted.get("_deleted"), Some(&json!(false)));

    h.registry.shutdown().await;
}

#[tokio::test]
async fn registry_rejects_missing_collection_and_bad_options() {
    let h = Harness::new().await;

    assert!(!h.registry.setup_replication(&h.db, "dog", polling_options()).await);

    let zero_batch = ReplicationOptions {
        batch_size: 0,
        ..polling_options()
    };
    assert!(!h.registry.setup_replication(&h.db, ENTITY, zero_batch).await);

    assert!(h.registry.active_entity_types().is_empty());
    assert!(!h.registry.is_replication_active(ENTITY));
}

#[tokio::test]
async fn registry_setup_replaces_existing_session() {
    let h = Harness::new().await;
    h.start(realtime_options()).await;
    let first = h.registry.session(ENTITY).unwrap();

    assert!(h.registry.setup_replication(&h.db, ENTITY, realtime_options()).await);
    let second = h.registry.session(ENTITY).unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert!(!first.is_active());
    assert!(second.is_active());
    assert_eq!(h.registry.active_entity_types(), vec![ENTITY.to_string()]);

    let remote = Arc::clone(&h.remote);
    eventually("old feed closed", || {
        let remote = Arc::clone(&remote);
        async move { remote.subscriber_count() == 1 }
    })
    .await;

    h.registry.shutdown().await;
}

#[tokio::test]
async fn registry_stop_replication() {
    let h = Harness::new().await;
    h.start(realtime_options()).await;
    assert!(h.registry.session(ENTITY).unwrap().has_realtime());

    h.registry.stop_replication(ENTITY).await;

    assert!(!h.registry.is_replication_active(ENTITY));
    assert!(h.registry.session(ENTITY).is_none());
    assert_eq!(h.remote.subscriber_count(), 0);

    // Stopping again is a no-op
    h.registry.stop_replication(ENTITY).await;
}

#[tokio::test]
async fn registry_stop_all() {
    let h = Harness::new().await;
    h.db.create("dog");
    h.start(polling_options()).await;
    assert!(h.registry.setup_replication(&h.db, "dog", polling_options()).await);
    assert_eq!(h.registry.active_entity_types(), vec![ENTITY.to_string(), "dog".to_string()]);

    h.registry.stop_all().await;

    assert!(h.registry.active_entity_types().is_empty());
}

#[tokio::test]
async fn registry_realtime_failure_falls_back_to_polling() {
    let h = Harness::new().await;
    h.remote.fail_subscribe(true);

    h.start(realtime_options()).await;

    let session = h.registry.session(ENTITY).unwrap();
    assert!(session.is_active());
    assert!(!session.has_realtime());

    h.registry.shutdown().await;
}

#[tokio::test]
async fn registry_manual_pull_reports_documents() {
    let h = Harness::new().await;
    h.start(polling_options()).await;
    assert_eq!(h.local_len().await, 0);

    h.remote.seed(ENTITY, vec![remote_row("a", "Akita", 10), remote_row("b", "Beagle", 20)]);
    assert_eq!(h.registry.manual_pull(ENTITY, None).await, 2);
    assert_eq!(h.local_len().await, 2);

    h.remote.seed(
        ENTITY,
        vec![remote_row("c", "Corgi", 100), remote_row("d", "Dingo", 110)],
    );
    // Limited to one row: the watermark row re-read inside the skew window
    assert_eq!(h.registry.manual_pull(ENTITY, Some(1)).await, 1);

    h.registry.shutdown().await;
}

#[tokio::test]
async fn registry_manual_pull_without_session_returns_zero() {
    let h = Harness::new().await;
    assert_eq!(h.registry.manual_pull(ENTITY, None).await, 0);
}

#[tokio::test]
async fn registry_manual_pull_times_out() {
    let mut config = EngineConfig::for_testing();
    config.settings.pull.manual_pull_timeout = "200ms".to_string();

    let inner = Arc::new(MemoryRemote::new());
    let remote = Arc::new(StallingRemote::new(Arc::clone(&inner)));
    let registry = SessionRegistry::open(Arc::clone(&remote), config).await.unwrap();
    let db = entity_replication::memory::MemoryDatabase::new();
    db.create(ENTITY);

    assert!(registry.setup_replication(&db, ENTITY, polling_options()).await);
    let metadata = Arc::clone(registry.metadata());
    eventually("initial pull", || {
        let metadata = Arc::clone(&metadata);
        async move { metadata.get_checkpoint(ENTITY).await.is_some() }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    remote.stall(true);
    assert_eq!(registry.manual_pull(ENTITY, None).await, 0);
}

#[tokio::test]
async fn registry_total_count_listener_and_unsubscribe() {
    let h = Harness::new().await;
    h.remote.seed(ENTITY, vec![remote_row("a", "Akita", 10)]);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let sub = h.registry.on_total_count_update(ENTITY, move |count| {
        assert_eq!(count, 1);
        counter.fetch_add(1, Ordering::SeqCst);
    });

    h.start(polling_options()).await;
    h.registry.manual_pull(ENTITY, None).await;
    h.registry.manual_pull(ENTITY, None).await;

    assert_eq!(h.remote.count_calls(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    sub.unsubscribe();
    sub.unsubscribe();
    assert_eq!(h.registry.metadata().listener_count(ENTITY), 0);

    h.registry.shutdown().await;
}

// =============================================================================
// Push Tests
// =============================================================================

#[tokio::test]
async fn push_local_write_reaches_remote() {
    let h = Harness::new().await;
    h.start(polling_options()).await;

    let collection = h.db.get(ENTITY).unwrap();
    collection
        .write(local_doc("x", "Xoloitzcuintli", 5))
        .await
        .unwrap();

    let remote = Arc::clone(&h.remote);
    eventually("push", || {
        let remote = Arc::clone(&remote);
        async move { remote.get(ENTITY, "x").is_some() }
    })
    .await;

    let row = h.remote.get(ENTITY, "x").unwrap();
    assert_eq!(row.get("name"), Some(&json!("Xoloitzcuintli")));
    assert_eq!(row.get("deleted"), Some(&json!(false)));
    assert!(row.get("_deleted").is_none());
    // Stamped at push time, not the local value
    assert!(row.updated_at().unwrap() > ts(5));

    h.registry.shutdown().await;
}

#[tokio::test]
async fn push_local_delete_is_soft() {
    let h = Harness::new().await;
    h.remote.seed(ENTITY, vec![remote_row("a", "Akita", 10)]);
    h.start(polling_options()).await;

    let collection = h.db.get(ENTITY).unwrap();
    let mut doc = collection.get("a").await.unwrap();
    doc.set("_deleted", json!(true));
    collection.write(doc).await.unwrap();

    let remote = Arc::clone(&h.remote);
    eventually("soft delete pushed", || {
        let remote = Arc::clone(&remote);
        async move { remote.get(ENTITY, "a").is_some_and(|row| row.is_deleted()) }
    })
    .await;
    assert_eq!(h.remote.len(ENTITY), 1);

    h.registry.shutdown().await;
}

#[tokio::test]
async fn push_partial_failure_is_isolated() {
    let h = Harness::new().await;
    h.start(polling_options()).await;
    h.remote.fail_upserts_for("b");

    let collection = h.db.get(ENTITY).unwrap();
    collection.write(local_doc("a", "Akita", 1)).await.unwrap();
    collection.write(local_doc("b", "Beagle", 1)).await.unwrap();

    let remote = Arc::clone(&h.remote);
    let watched = Arc::clone(&collection);
    eventually("a pushed, b re-queued", || {
        let remote = Arc::clone(&remote);
        let watched = Arc::clone(&watched);
        async move { remote.get(ENTITY, "a").is_some() && watched.pending_push() == 1 }
    })
    .await;
    assert!(h.remote.get(ENTITY, "b").is_none());

    h.remote.clear_faults();
    h.registry.manual_pull(ENTITY, None).await;

    let remote = Arc::clone(&h.remote);
    eventually("b pushed after recovery", || {
        let remote = Arc::clone(&remote);
        async move { remote.get(ENTITY, "b").is_some() }
    })
    .await;

    h.registry.shutdown().await;
}

// =============================================================================
// Realtime Tests
// =============================================================================

#[tokio::test]
async fn realtime_insert_and_update_applied() {
    let h = Harness::new().await;
    h.start(realtime_options()).await;

    h.remote.write(ENTITY, remote_row("a", "Akita", 10));
    let db = &h.db;
    eventually("realtime insert", || async move {
        db.get(ENTITY).unwrap().get("a").await.is_some()
    })
    .await;

    h.remote.write(ENTITY, remote_row("a", "Akita Inu", 20));
    eventually("realtime update", || async move {
        db.get(ENTITY)
            .unwrap()
            .get("a")
            .await
            .is_some_and(|doc| doc.get("name") == Some(&json!("Akita Inu")))
    })
    .await;

    h.registry.shutdown().await;
}

#[tokio::test]
async fn realtime_delete_soft_deletes_local() {
    let h = Harness::new().await;
    h.remote.seed(ENTITY, vec![remote_row("a", "Akita", 10)]);
    h.start(realtime_options()).await;
    assert!(h.local("a").await.is_some());

    h.remote.remove(ENTITY, "a");
    // Unknown ids are ignored
    h.remote.remove(ENTITY, "ghost");

    let db = &h.db;
    eventually("realtime delete", || async move {
        db.get(ENTITY)
            .unwrap()
            .get("a")
            .await
            .is_some_and(|doc| doc.is_deleted())
    })
    .await;

    let doc = h.local("a").await.unwrap();
    assert!(doc.updated_at().unwrap() > ts(10));
    assert!(h.local("ghost").await.is_none());

    h.registry.shutdown().await;
}

#[tokio::test]
async fn realtime_replay_of_pulled_row_is_noop() {
    let h = Harness::new().await;
    h.remote.seed(ENTITY, vec![remote_row("a", "Akita", 10)]);
    h.start(realtime_options()).await;

    let collection = h.db.get(ENTITY).unwrap();
    let before = collection.all().await;
    assert_eq!(before.len(), 1);

    // Same row, same watermark, now arriving over the change feed
    h.remote.write(ENTITY, remote_row("a", "Akita", 10));
    // Events apply in order; once "b" lands the replay has been handled
    h.remote.write(ENTITY, remote_row("b", "Beagle", 20));

    let db = &h.db;
    eventually("later row applied", || async move {
        db.get(ENTITY).unwrap().get("b").await.is_some()
    })
    .await;

    let after = collection.all().await;
    assert_eq!(after.len(), 2);
    assert_eq!(after.iter().find(|d| d.id() == Some("a")), before.first());

    h.registry.shutdown().await;
}

// =============================================================================
// Full Sync Tests
// =============================================================================

#[tokio::test]
async fn full_sync_reconciles_and_rebaselines() {
    let h = Harness::new().await;
    h.remote.seed(
        ENTITY,
        vec![
            remote_row("a", "Akita", 10),
            remote_row("b", "Beagle", 20),
            remote_row("c", "Corgi", 30),
        ],
    );
    let collection = h.db.get(ENTITY).unwrap();
    collection.insert(local_doc("a", "stale", 5)).await.unwrap();
    collection.insert(local_doc("b", "edited locally", 50)).await.unwrap();

    let counts = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&counts);
    let _sub = h
        .registry
        .on_total_count_update(ENTITY, move |count| sink.lock().unwrap().push(count));

    assert!(h.registry.force_full_sync(&h.db, ENTITY).await);

    assert_eq!(name_of(&h.local("a").await.unwrap()), Some(&json!("Akita")));
    assert_eq!(name_of(&h.local("b").await.unwrap()), Some(&json!("edited locally")));
    assert_eq!(name_of(&h.local("c").await.unwrap()), Some(&json!("Corgi")));

    let checkpoint = h.registry.metadata().get_checkpoint(ENTITY).await.unwrap();
    assert_eq!(checkpoint.updated_at, Some(ts(30)));
    assert!(checkpoint.pulled);
    assert_eq!(*counts.lock().unwrap(), vec![3]);
}

#[tokio::test]
async fn full_sync_pages_through_remote() {
    let h = Harness::new().await;
    let rows = (0..7)
        .map(|i| remote_row(&format!("r{}", i), "row", 10 * (i + 1)))
        .collect();
    h.remote.seed(ENTITY, rows);

    let options = ReplicationOptions {
        batch_size: 2,
        ..polling_options()
    };
    h.start(options).await;
    assert_eq!(h.local_len().await, 2);

    assert!(h.registry.force_full_sync(&h.db, ENTITY).await);
    assert_eq!(h.local_len().await, 7);

    h.registry.shutdown().await;
}

#[tokio::test]
async fn full_sync_count_falls_back_to_snapshot_size() {
    let h = Harness::new().await;
    h.remote.seed(ENTITY, vec![remote_row("a", "Akita", 10), remote_row("b", "Beagle", 20)]);
    h.remote.fail_count(true);

    assert!(h.registry.force_full_sync(&h.db, ENTITY).await);
    assert_eq!(h.registry.get_total_count(ENTITY).await, 2);
}

#[tokio::test]
async fn full_sync_failures_report_false() {
    let h = Harness::new().await;
    assert!(!h.registry.force_full_sync(&h.db, "dog").await);

    h.remote.seed(ENTITY, vec![remote_row("a", "Akita", 10)]);
    h.remote.fail_fetches(true);
    assert!(!h.registry.force_full_sync(&h.db, ENTITY).await);
    assert_eq!(h.registry.metadata().get_checkpoint(ENTITY).await, None);
    assert_eq!(h.local_len().await, 0);
}

// =============================================================================
// Restart Tests
// =============================================================================

#[tokio::test]
async fn restart_resumes_from_durable_checkpoint() {
    let dir = tempdir().unwrap();
    let config = EngineConfig {
        store: StoreConfig {
            sqlite_path: dir.path().join("meta.db").to_string_lossy().into_owned(),
            wal_mode: true,
        },
        ..EngineConfig::default()
    };
    let rows = || {
        vec![
            remote_row("a", "Akita", 10),
            remote_row("b", "Beagle", 20),
            remote_row("c", "Corgi", 30),
        ]
    };

    let checkpoint = {
        let h = Harness::with_config(config.clone()).await;
        h.remote.seed(ENTITY, rows());
        h.start(polling_options()).await;
        let checkpoint = h.registry.metadata().get_checkpoint(ENTITY).await.unwrap();
        h.registry.shutdown().await;
        checkpoint
    };
    assert_eq!(checkpoint.updated_at, Some(ts(30)));

    let h = Harness::with_config(config).await;
    h.remote.seed(ENTITY, rows());
    assert_eq!(h.registry.metadata().get_checkpoint(ENTITY).await, Some(checkpoint));
    assert_eq!(h.registry.get_total_count(ENTITY).await, 3);

    h.start(polling_options()).await;
    // Cached count survives the restart
    assert_eq!(h.remote.count_calls(), 0);

    // Only the row inside the skew window of the stored watermark comes back
    assert_eq!(h.registry.manual_pull(ENTITY, None).await, 1);

    h.registry.shutdown().await;
}
