// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Entity Replication
//!
//! Bidirectional, checkpointed replication between local-first document
//! collections and a remote relational store, one session per entity type.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                          SessionRegistry                                  │
//! │                                                                           │
//! │  ┌──────────────┐   pull()  ┌──────────────┐   fetch_since  ┌──────────┐  │
//! │  │ Replication  │──────────►│ PullPipeline │───────────────►│  Remote  │  │
//! │  │ primitive    │   push()  │ PushPipeline │───upsert──────►│  Store   │  │
//! │  │ (per entity) │──────────►└──────────────┘                └──────────┘  │
//! │  └──────────────┘                 │                              │        │
//! │         │                         ▼                              │ feed   │
//! │         ▼                 ┌───────────────┐   ┌──────────────────▼─────┐  │
//! │  ┌──────────────┐         │ MetadataStore │   │ RealtimeSubscriber     │  │
//! │  │ Local        │◄────────│ (SQLite)      │   │ (merge into local)     │  │
//! │  │ collection   │◄────────┴───────────────┴───┴────────────────────────┘  │
//! │  └──────────────┘                                                         │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Paths
//!
//! 1. **Pull**: incremental fetch from a skew-adjusted `updated_at` watermark,
//!    debounced, with a soft in-flight cap and a one-shot row count
//! 2. **Push**: per-row concurrent upserts; deletes are soft
//! 3. **Realtime**: remote change events merged with the same conflict rule
//!
//! ## Usage
//!
//! ```rust,no_run
//! use entity_replication::memory::{MemoryDatabase, MemoryRemote};
//! use entity_replication::{EngineConfig, ReplicationOptions, SessionRegistry};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let remote = Arc::new(MemoryRemote::new());
//!     let registry = SessionRegistry::open(remote, EngineConfig::for_testing())
//!         .await
//!         .expect("Failed to open metadata store");
//!
//!     let db = MemoryDatabase::new();
//!     db.create("breed");
//!
//!     registry
//!         .setup_replication(&db, "breed", ReplicationOptions::default())
//!         .await;
//!     let pulled = registry.manual_pull("breed", None).await;
//!     println!("pulled {pulled} documents");
//!
//!     registry.shutdown().await;
//! }
//! ```

pub mod clock;
pub mod concurrency;
pub mod config;
pub mod document;
pub mod error;
pub mod local;
pub mod mapper;
pub mod memory;
pub mod merge;
pub mod metadata;
pub mod metrics;
pub mod pull;
pub mod push;
pub mod realtime;
pub mod registry;
pub mod remote;
pub mod store;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConflictPolicy, EngineConfig, PullConfig, ReplicationOptions, ReplicationSettings, StoreConfig};
pub use document::{LocalDoc, RemoteRow};
pub use error::{ReplicationError, Result};
pub use local::{LocalCollection, LocalDatabase, ReplicationHandle, ReplicationHandler};
pub use merge::{decide_merge, ConflictHandler, LastWriteWins, MergeDecision};
pub use metadata::{Checkpoint, MetadataStore, TotalCountSubscription};
pub use pull::PullPhase;
pub use registry::{Session, SessionRegistry};
pub use remote::{ChangeEvent, ChangeKind, RemoteStore};
