// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the origin store and replication engine.
//!
//! Errors fall into three groups: author-facing write conflicts, replication
//! anomalies that need an operator, and transient infrastructure failures.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `AlreadyExists` | No | Natural key collision on create |
//! | `StaleWrite` | No | Optimistic check failed; caller must re-fetch |
//! | `VersionCollisionExhausted` | No | `(origin, modified)` retry budget spent |
//! | `DuplicateVersion` | No | Replicated write hit a foreign `(origin, modified)` row |
//! | `NotFound` | No | Update/delete target missing |
//! | `Validation` | No | Payload rejected by the validation hook |
//! | `MissingVersion` | No | Trusted write carried no `modified` |
//! | `Store` | Busy only | SQLite error |
//! | `Tunnel` | Yes | SSH setup/auth/forwarding failure |
//! | `Http` | Yes | Network failure talking to a remote origin |
//! | `Remote` | 5xx only | Remote origin answered with an error status |
//! | `Parse` | No | Remote payload could not be decoded |
//! | `CircuitOpen` | Yes | Remote origin circuit breaker is open |
//! | `BulkheadFull` | Yes | Too many replication cycles in flight |
//! | `CycleInProgress` | Yes | Same origin+direction already running |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! [`ReplicationError::is_retryable()`] tells the scheduler whether the next
//! cycle can be expected to succeed without intervention.
//! [`ReplicationError::is_conflict()`] singles out the errors an author has
//! to react to (show a conflict, re-fetch and retry).

use crate::model::{EntityKind, Version};
use thiserror::Error;

/// Result type alias for store and replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur while writing entities or replicating them.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// A row with the same natural key already exists for this origin.
    ///
    /// Never retried. Also raised when a delete-intent is written for a key
    /// whose delete is already confirmed.
    #[error("{kind} already exists: {key} (origin {origin:?})")]
    AlreadyExists {
        kind: EntityKind,
        key: String,
        origin: String,
    },

    /// `(origin, modified)` collisions persisted past the retry budget.
    ///
    /// Points at clock granularity problems or a very hot origin.
    #[error("{kind} {key} (origin {origin:?}): version collision retry budget exhausted after {attempts} attempts")]
    VersionCollisionExhausted {
        kind: EntityKind,
        key: String,
        origin: String,
        attempts: u32,
    },

    /// The optimistic-concurrency check failed.
    ///
    /// The caller read an outdated copy and must re-fetch before retrying.
    #[error("{kind} {key} (origin {origin:?}) was modified since {expected}")]
    StaleWrite {
        kind: EntityKind,
        key: String,
        origin: String,
        expected: Version,
    },

    /// A trusted write collided with an unrelated `(origin, modified)` row.
    ///
    /// Usually clock skew between origins. Surfaced for operator inspection.
    #[error("{kind} {key} (origin {origin:?}): version {modified} already used by another row")]
    DuplicateVersion {
        kind: EntityKind,
        key: String,
        origin: String,
        modified: Version,
    },

    /// The target of an update or delete does not exist.
    #[error("{kind} not found: {key} (origin {origin:?})")]
    NotFound {
        kind: EntityKind,
        key: String,
        origin: String,
    },

    /// Payload rejected by the schema validation hook.
    #[error("{kind} {key} failed validation: {message}")]
    Validation {
        kind: EntityKind,
        key: String,
        message: String,
    },

    /// A trusted write arrived without a `modified` value.
    #[error("{kind} {key} (origin {origin:?}) has no modified version")]
    MissingVersion {
        kind: EntityKind,
        key: String,
        origin: String,
    },

    /// SQLite error.
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// SSH tunnel setup, authentication or forwarding failed.
    ///
    /// The tunnel slot is torn down before this is returned.
    #[error("Tunnel error ({target}): {message}")]
    Tunnel {
        target: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Network failure while talking to a remote origin.
    #[error("HTTP error ({origin}): {source}")]
    Http {
        origin: String,
        #[source]
        source: reqwest::Error,
    },

    /// Remote origin answered with a non-success status.
    #[error("Remote {origin} returned {status} for {url}")]
    Remote {
        origin: String,
        url: String,
        status: u16,
    },

    /// Remote payload could not be decoded.
    #[error("Parse error ({origin}): {message}")]
    Parse { origin: String, message: String },

    /// The remote origin's circuit breaker is open.
    #[error("Circuit open for origin {0}")]
    CircuitOpen(String),

    /// The replication bulkhead has no free slot.
    #[error(transparent)]
    BulkheadFull(#[from] crate::resilience::BulkheadFull),

    /// A cycle for the same origin and direction is already running.
    #[error("{direction} cycle already running for origin {origin}")]
    CycleInProgress { origin: String, direction: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Engine state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a tunnel error with an underlying cause.
    pub fn tunnel(
        target: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Tunnel {
            target: target.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a tunnel error without source.
    pub fn tunnel_msg(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tunnel {
            target: target.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create an HTTP error for a remote origin.
    pub fn http(origin: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Http {
            origin: origin.into(),
            source,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Tunnel { .. } => true,
            Self::Http { .. } => true,
            Self::Remote { status, .. } => *status >= 500 || *status == 429,
            Self::CircuitOpen(_) => true,
            Self::BulkheadFull(_) => true,
            Self::CycleInProgress { .. } => true,
            Self::Store(e) => crate::store::is_sqlite_busy_error(e),
            Self::AlreadyExists { .. } => false,
            Self::VersionCollisionExhausted { .. } => false,
            Self::StaleWrite { .. } => false,
            Self::DuplicateVersion { .. } => false,
            Self::NotFound { .. } => false,
            Self::Validation { .. } => false,
            Self::MissingVersion { .. } => false,
            Self::Parse { .. } => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this is a write conflict the author has to react to.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::StaleWrite { .. } | Self::AlreadyExists { .. })
    }

    /// Short label used for metrics and logs.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::AlreadyExists { .. } => "already_exists",
            Self::VersionCollisionExhausted { .. } => "version_collision_exhausted",
            Self::StaleWrite { .. } => "stale_write",
            Self::DuplicateVersion { .. } => "duplicate_version",
            Self::NotFound { .. } => "not_found",
            Self::Validation { .. } => "validation",
            Self::MissingVersion { .. } => "missing_version",
            Self::Store(_) => "store",
            Self::Tunnel { .. } => "tunnel",
            Self::Http { .. } => "http",
            Self::Remote { .. } => "remote",
            Self::Parse { .. } => "parse",
            Self::CircuitOpen(_) => "circuit_open",
            Self::BulkheadFull(_) => "bulkhead_full",
            Self::CycleInProgress { .. } => "cycle_in_progress",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}
