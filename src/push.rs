// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Push pipeline: drains local mutations to the remote store.
//!
//! Every row is upserted by id independently and concurrently. Deletions are
//! upserts with `deleted = true`; the engine never issues a destructive
//! remote delete. A failed row contributes its original local document to
//! the returned conflict list and does not affect the other rows. Retry and
//! backoff of conflicts belong to the replication primitive.

use crate::clock::Clock;
use crate::document::{LocalDoc, REMOTE_DELETED};
use crate::error::{ReplicationError, Result};
use crate::local::PushRow;
use crate::mapper;
use crate::metrics;
use crate::remote::RemoteStore;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Push for one entity type.
pub struct PushPipeline<R: RemoteStore> {
    entity_type: String,
    remote: Arc<R>,
    clock: Arc<dyn Clock>,
}

impl<R: RemoteStore> PushPipeline<R> {
    pub fn new(entity_type: &str, remote: Arc<R>, clock: Arc<dyn Clock>) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            remote,
            clock,
        }
    }

    /// Push a batch. Returns the conflicts (original local documents of the
    /// rows that failed), in input order.
    pub async fn push(&self, rows: Vec<PushRow>) -> Vec<LocalDoc> {
        if rows.is_empty() {
            return Vec::new();
        }

        let total = rows.len();
        let now = self.clock.now();

        let results = join_all(rows.into_iter().map(|row| async move {
            let original = row.new_document.clone();
            match self.push_one(row, now).await {
                Ok(()) => None,
                Err(e) => {
                    warn!(
                        entity_type = %self.entity_type,
                        id = original.id().unwrap_or_default(),
                        error = %e,
                        "Push failed, returning row as conflict"
                    );
                    Some(original)
                }
            }
        }))
        .await;

        let conflicts: Vec<LocalDoc> = results.into_iter().flatten().collect();

        debug!(
            entity_type = %self.entity_type,
            rows = total,
            conflicts = conflicts.len(),
            "Push complete"
        );
        metrics::record_push(&self.entity_type, total, conflicts.len());

        conflicts
    }

    async fn push_one(&self, row: PushRow, now: DateTime<Utc>) -> Result<()> {
        let deleted = row.new_document.is_deleted()
            || row
                .assumed_master_state
                .as_ref()
                .is_some_and(LocalDoc::is_deleted);

        let mut remote_row = mapper::to_remote(&self.entity_type, &row.new_document, now)?;
        if deleted {
            remote_row.set(REMOTE_DELETED, Value::Bool(true));
        }

        self.remote
            .upsert(&self.entity_type, remote_row)
            .await
            .map_err(|e| ReplicationError::remote("upsert", &self.entity_type, e))
    }
}
