// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Field mapping between local documents and remote rows.
//!
//! ```text
//! remote row                          local doc
//! ──────────                          ─────────
//! id, created_at, updated_at   ◀──▶   id, created_at, updated_at
//! deleted: bool                ◀──▶   _deleted: bool
//! (never carries _ fields)     ◀───   _rev, _meta, _attachments (stripped)
//! ```
//!
//! Both directions are pure. [`to_remote`] takes the push timestamp as an
//! argument rather than reading a clock.

use crate::document::{
    format_watermark, Fields, LocalDoc, RemoteRow, CREATED_AT, ID, LOCAL_DELETED, REMOTE_DELETED,
    UPDATED_AT,
};
use crate::error::{ReplicationError, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeSet;

/// Keys owned by the local store that must never be copied from a remote row.
pub const RESERVED_LOCAL_KEYS: &[&str] = &["_rev", "_meta", "_attachments", LOCAL_DELETED];

/// Prefix marking store-internal fields on the local side.
pub const INTERNAL_PREFIX: char = '_';

/// Declarative allow-list of fields a local collection accepts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSchema {
    properties: BTreeSet<String>,
}

impl FieldSchema {
    pub fn new<I, S>(properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            properties: properties.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allows(&self, field: &str) -> bool {
        self.properties.contains(field)
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

/// Translate a remote row into a local document.
///
/// With a schema only allow-listed fields are copied; without one every field
/// except the reserved local keys is copied. The deletion flag is always
/// remapped and `id`, `created_at`, `updated_at` are always populated
/// (`created_at` defaults to `updated_at`).
pub fn to_local(entity_type: &str, row: &RemoteRow, schema: Option<&FieldSchema>) -> Result<LocalDoc> {
    let id = row.id().ok_or_else(|| {
        ReplicationError::Mapping(format!("{} row has no string id", entity_type))
    })?;

    let mut fields = Fields::new();
    for (key, value) in row.fields() {
        if key == REMOTE_DELETED || key == ID {
            continue;
        }
        let keep = match schema {
            Some(schema) => schema.allows(key) && !RESERVED_LOCAL_KEYS.contains(&key.as_str()),
            None => !RESERVED_LOCAL_KEYS.contains(&key.as_str()),
        };
        if keep {
            fields.insert(key.clone(), value.clone());
        }
    }

    fields.insert(ID.to_string(), Value::String(id.to_string()));
    fields.insert(LOCAL_DELETED.to_string(), Value::Bool(row.is_deleted()));

    let updated_at = row
        .get(UPDATED_AT)
        .or_else(|| row.get(CREATED_AT))
        .cloned()
        .unwrap_or_else(|| format_watermark(DateTime::<Utc>::UNIX_EPOCH));
    let created_at = row.get(CREATED_AT).cloned().unwrap_or_else(|| updated_at.clone());
    fields.insert(UPDATED_AT.to_string(), updated_at);
    fields.insert(CREATED_AT.to_string(), created_at);

    Ok(LocalDoc::new(fields))
}

/// Translate a local document into a remote row for push.
///
/// Strips every `_`-prefixed field, remaps the deletion flag and stamps
/// `updated_at` with `now` (`created_at` defaults to `now` when missing).
pub fn to_remote(entity_type: &str, doc: &LocalDoc, now: DateTime<Utc>) -> Result<RemoteRow> {
    if doc.id().is_none() {
        return Err(ReplicationError::Mapping(format!(
            "{} document has no string id",
            entity_type
        )));
    }

    let mut fields: Fields = doc
        .fields()
        .iter()
        .filter(|(key, _)| !key.starts_with(INTERNAL_PREFIX))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    fields.insert(REMOTE_DELETED.to_string(), Value::Bool(doc.is_deleted()));
    fields.insert(UPDATED_AT.to_string(), format_watermark(now));
    if !fields.contains_key(CREATED_AT) {
        fields.insert(CREATED_AT.to_string(), format_watermark(now));
    }

    Ok(RemoteRow::new(fields))
}
