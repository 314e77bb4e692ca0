// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local documents and remote rows.
//!
//! Both are JSON objects with the same logical content. They differ in the
//! name of the soft-delete flag (`_deleted` locally, `deleted` remotely) and in
//! the store-internal `_`-prefixed fields that only exist on the local side.
//! Keeping them as distinct newtypes means a row can only cross between the
//! two shapes through [`crate::mapper`].
//!
//! Watermarks (`updated_at`, `created_at`) are RFC 3339 strings on the wire.
//! Integer values are accepted as epoch milliseconds.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// JSON object fields.
pub type Fields = Map<String, Value>;

pub const ID: &str = "id";
pub const CREATED_AT: &str = "created_at";
pub const UPDATED_AT: &str = "updated_at";
/// Soft-delete flag on the local side.
pub const LOCAL_DELETED: &str = "_deleted";
/// Soft-delete flag on the remote side.
pub const REMOTE_DELETED: &str = "deleted";

/// Parse a watermark value.
pub fn parse_watermark(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// Render a watermark the way it is stored on both sides.
pub fn format_watermark(ts: DateTime<Utc>) -> Value {
    Value::String(ts.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// A document as stored in the local collection.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalDoc(Fields);

/// A row as stored in the remote table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteRow(Fields);

macro_rules! json_record {
    ($ty:ident, $deleted:expr) => {
        impl $ty {
            pub fn new(fields: Fields) -> Self {
                Self(fields)
            }

            /// Build from a JSON value; `None` unless it is an object.
            pub fn from_value(value: Value) -> Option<Self> {
                match value {
                    Value::Object(fields) => Some(Self(fields)),
                    _ => None,
                }
            }

            pub fn id(&self) -> Option<&str> {
                self.0.get(ID).and_then(Value::as_str)
            }

            /// The record's watermark, if present and parseable.
            pub fn updated_at(&self) -> Option<DateTime<Utc>> {
                self.0.get(UPDATED_AT).and_then(parse_watermark)
            }

            pub fn created_at(&self) -> Option<DateTime<Utc>> {
                self.0.get(CREATED_AT).and_then(parse_watermark)
            }

            pub fn is_deleted(&self) -> bool {
                self.0.get($deleted).and_then(Value::as_bool).unwrap_or(false)
            }

            pub fn get(&self, key: &str) -> Option<&Value> {
                self.0.get(key)
            }

            pub fn set(&mut self, key: impl Into<String>, value: Value) {
                self.0.insert(key.into(), value);
            }

            pub fn fields(&self) -> &Fields {
                &self.0
            }

            pub fn into_fields(self) -> Fields {
                self.0
            }

            pub fn into_value(self) -> Value {
                Value::Object(self.0)
            }
        }

        impl From<Fields> for $ty {
            fn from(fields: Fields) -> Self {
                Self(fields)
            }
        }
    };
}

json_record!(LocalDoc, LOCAL_DELETED);
json_record!(RemoteRow, REMOTE_DELETED);
