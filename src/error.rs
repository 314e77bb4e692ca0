// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication engine.
//!
//! Errors are categorized by their source (remote store, local collection,
//! durable metadata cache, configuration) and carry the entity type they
//! occurred on where that is known.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Remote` | Yes | Network errors, timeouts, rejected queries |
//! | `LocalStore` | Yes | Local collection temporarily unavailable |
//! | `Durable` | No | Local SQLite errors (needs operator attention) |
//! | `Config` | No | Options or configuration invalid |
//! | `MissingCollection` | No | Local database has no collection for the entity type |
//! | `Mapping` | No | Malformed row (e.g. missing `id`) |
//! | `NoSession` | No | Operation on an entity type without an active session |
//! | `Shutdown` | No | Session is stopping |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Propagation
//!
//! None of these cross into the external replication primitive. The pull and
//! push handlers convert every failure into a structured "nothing happened"
//! result and log the error; the public control surface reports booleans.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Remote store query, upsert or subscription failure.
    ///
    /// Transient by nature (outage, timeout); the replication primitive's
    /// own retry cadence drives recovery.
    #[error("Remote error ({operation} on {entity_type}): {message}")]
    Remote {
        operation: String,
        entity_type: String,
        message: String,
    },

    /// Local collection read or write failure.
    #[error("Local store error: {0}")]
    LocalStore(String),

    /// SQLite error in the durable metadata cache.
    ///
    /// Not retryable - indicates local database issues that need attention.
    #[error("Durable store error: {0}")]
    Durable(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The local database has no collection for this entity type.
    #[error("No local collection for entity type '{0}'")]
    MissingCollection(String),

    /// A row could not be translated between local and remote shape.
    #[error("Mapping error: {0}")]
    Mapping(String),

    /// No active session for this entity type.
    #[error("No active replication session for '{0}'")]
    NoSession(String),

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a remote error for an operation on an entity type.
    pub fn remote(
        operation: impl Into<String>,
        entity_type: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        Self::Remote {
            operation: operation.into(),
            entity_type: entity_type.into(),
            message: message.to_string(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Remote { .. } => true,
            Self::LocalStore(_) => true,
            Self::Durable(_) => false,
            Self::Config(_) => false,
            Self::MissingCollection(_) => false,
            Self::Mapping(_) => false,
            Self::NoSession(_) => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<crate::local::StoreError> for ReplicationError {
    fn from(e: crate::local::StoreError) -> Self {
        Self::LocalStore(e.0)
    }
}
