// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote store integration trait.
//!
//! One remote table per entity type, with the columns `id`, `created_at`,
//! `updated_at` and `deleted`. The engine needs:
//!
//! - incremental reads: `updated_at > after`, ascending, limited
//! - an exact row count
//! - upsert-by-id (conflict target `id`)
//! - a change feed per table carrying before/after row images
//!
//! # Example
//!
//! ```rust,no_run
//! use entity_replication::remote::{ChangeEvent, ChangeFeed, RemoteFuture, RemoteStore};
//! use entity_replication::document::RemoteRow;
//! use chrono::{DateTime, Utc};
//!
//! struct MyBackend { /* ... */ }
//!
//! impl RemoteStore for MyBackend {
//!     fn fetch_since(&self, _table: &str, _after: DateTime<Utc>, _limit: usize) -> RemoteFuture<'_, Vec<RemoteRow>> {
//!         Box::pin(async move { Ok(vec![]) })
//!     }
//!     fn fetch_page(&self, _table: &str, _offset: usize, _limit: usize) -> RemoteFuture<'_, Vec<RemoteRow>> {
//!         Box::pin(async move { Ok(vec![]) })
//!     }
//!     fn count(&self, _table: &str) -> RemoteFuture<'_, u64> {
//!         Box::pin(async move { Ok(0) })
//!     }
//!     fn upsert(&self, _table: &str, _row: RemoteRow) -> RemoteFuture<'_, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//!     fn subscribe(&self, _table: &str) -> RemoteFuture<'_, ChangeFeed> {
//!         Box::pin(async move { Ok(Box::pin(futures::stream::empty::<ChangeEvent>()) as ChangeFeed) })
//!     }
//! }
//! ```

use crate::document::RemoteRow;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::future::Future;
use std::pin::Pin;

/// Result type for remote store operations.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Boxed future returned by remote store operations.
pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = RemoteResult<T>> + Send + 'a>>;

/// Change feed for one table. Ends when the transport gives up.
pub type ChangeFeed = BoxStream<'static, ChangeEvent>;

/// Simplified error for remote store operations.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct RemoteError(pub String);

/// Change feed operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    /// Parse the wire name (`INSERT`, `UPDATE`, `DELETE`, any case).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "INSERT" => Some(ChangeKind::Insert),
            "UPDATE" => Some(ChangeKind::Update),
            "DELETE" | "DEL" => Some(ChangeKind::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

/// A row-level change from the remote change feed.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    /// After image (insert/update).
    pub new: Option<RemoteRow>,
    /// Before image (update/delete). May carry only the primary key.
    pub old: Option<RemoteRow>,
}

impl ChangeEvent {
    pub fn insert(table: impl Into<String>, row: RemoteRow) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Insert,
            new: Some(row),
            old: None,
        }
    }

    pub fn update(table: impl Into<String>, old: Option<RemoteRow>, new: RemoteRow) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Update,
            new: Some(new),
            old,
        }
    }

    pub fn delete(table: impl Into<String>, old: RemoteRow) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Delete,
            new: None,
            old: Some(old),
        }
    }

    /// Id of the affected row, from whichever image carries it.
    pub fn row_id(&self) -> Option<&str> {
        self.new
            .as_ref()
            .and_then(RemoteRow::id)
            .or_else(|| self.old.as_ref().and_then(RemoteRow::id))
    }
}

/// Trait defining what we need from the remote backend.
///
/// Implementations wrap the actual client (REST, Postgres, ...). The engine
/// never deletes remote rows; deletions are upserts with `deleted = true`.
pub trait RemoteStore: Send + Sync + 'static {
    /// Rows with `updated_at > after`, ascending by `updated_at`, at most `limit`.
    fn fetch_since(
        &self,
        table: &str,
        after: DateTime<Utc>,
        limit: usize,
    ) -> RemoteFuture<'_, Vec<RemoteRow>>;

    /// A page of the full table, ascending by `updated_at` then `id`.
    fn fetch_page(&self, table: &str, offset: usize, limit: usize) -> RemoteFuture<'_, Vec<RemoteRow>>;

    /// Exact row count.
    fn count(&self, table: &str) -> RemoteFuture<'_, u64>;

    /// Insert or update by `id`.
    fn upsert(&self, table: &str, row: RemoteRow) -> RemoteFuture<'_, ()>;

    /// Open a change feed for the table.
    fn subscribe(&self, table: &str) -> RemoteFuture<'_, ChangeFeed>;
}
