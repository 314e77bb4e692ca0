// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The shared merge rule.
//!
//! Pull and realtime both land remote data in the same local collection with
//! no locking between them. Convergence rests entirely on this rule being
//! idempotent and order-insensitive:
//!
//! | Local document | Incoming watermark | Decision |
//! |----------------|--------------------|----------|
//! | absent | any | `Insert` |
//! | present | strictly newer | `Update` |
//! | present | equal or older | `Skip` |
//!
//! A local document without a parseable `updated_at` loses to any incoming
//! document that has one. When an insert loses a race with the other path,
//! the rule is applied again against the document that won.

use crate::document::LocalDoc;
use crate::error::{ReplicationError, Result};
use crate::local::LocalCollection;

/// Outcome of comparing an incoming document with the local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    Insert,
    Update,
    Skip,
}

impl MergeDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeDecision::Insert => "insert",
            MergeDecision::Update => "update",
            MergeDecision::Skip => "skip",
        }
    }

    /// Whether the decision writes to the local collection.
    pub fn is_write(&self) -> bool {
        !matches!(self, MergeDecision::Skip)
    }
}

/// Last-write-wins by `updated_at`.
pub fn decide_merge(existing: Option<&LocalDoc>, incoming: &LocalDoc) -> MergeDecision {
    let Some(existing) = existing else {
        return MergeDecision::Insert;
    };
    match (incoming.updated_at(), existing.updated_at()) {
        (Some(theirs), Some(ours)) if theirs > ours => MergeDecision::Update,
        (Some(_), None) => MergeDecision::Update,
        _ => MergeDecision::Skip,
    }
}

/// Pluggable merge policy.
///
/// Implementations must be deterministic: the same pair always yields the same
/// decision, or pull and realtime can disagree.
pub trait ConflictHandler: Send + Sync + std::fmt::Debug + 'static {
    fn decide(&self, existing: Option<&LocalDoc>, incoming: &LocalDoc) -> MergeDecision;
}

/// The default policy, [`decide_merge`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWins;

impl ConflictHandler for LastWriteWins {
    fn decide(&self, existing: Option<&LocalDoc>, incoming: &LocalDoc) -> MergeDecision {
        decide_merge(existing, incoming)
    }
}

/// Look up the local document and apply `handler`'s decision.
pub async fn apply_incoming(
    collection: &dyn LocalCollection,
    handler: &dyn ConflictHandler,
    incoming: LocalDoc,
) -> Result<MergeDecision> {
    let id = incoming
        .id()
        .ok_or_else(|| ReplicationError::Mapping("incoming document has no id".to_string()))?
        .to_string();

    let existing = collection.find_by_id(&id).await?;
    let decision = handler.decide(existing.as_ref(), &incoming);

    match decision {
        MergeDecision::Insert => {
            if let Err(e) = collection.insert(incoming.clone()).await {
                return decide_after_lost_insert(collection, handler, &id, incoming, e).await;
            }
        }
        MergeDecision::Update => collection.patch(&id, incoming.into_fields()).await?,
        MergeDecision::Skip => {}
    }

    Ok(decision)
}

/// The insert failed, most likely because the other path inserted the same id
/// after our lookup. Decide again against what is stored now.
async fn decide_after_lost_insert(
    collection: &dyn LocalCollection,
    handler: &dyn ConflictHandler,
    id: &str,
    incoming: LocalDoc,
    insert_error: crate::local::StoreError,
) -> Result<MergeDecision> {
    let Some(current) = collection.find_by_id(id).await? else {
        return Err(insert_error.into());
    };
    match handler.decide(Some(&current), &incoming) {
        MergeDecision::Update => {
            collection.patch(id, incoming.into_fields()).await?;
            Ok(MergeDecision::Update)
        }
        MergeDecision::Skip => Ok(MergeDecision::Skip),
        MergeDecision::Insert => Err(insert_error.into()),
    }
}
