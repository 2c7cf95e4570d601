// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Collaborator seams invoked by the sequencer.
//!
//! - [`Validator`]: schema check before author writes (replicated writes skip it)
//! - [`MetadataHook`]: backlink/response count fix-ups around physical deletes
//!   and before tombstone commits; runs inside the write transaction
//! - [`ChangePublisher`]: fan-out of every committed write
//!
//! # Example
//!
//! ```rust,no_run
//! use origin_replication::store::hooks::{ChangeEvent, ChangePublisher, Hooks};
//! use std::sync::Arc;
//!
//! struct LogPublisher;
//!
//! impl ChangePublisher for LogPublisher {
//!     fn publish(&self, event: ChangeEvent) {
//!         println!("{} {} @ {}", event.kind, event.key, event.modified);
//!     }
//! }
//!
//! let hooks = Hooks::default().with_publisher(Arc::new(LogPublisher));
//! ```

use crate::model::{EntityKind, Version};
use crate::tag::TaggedKey;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Result type for hook calls.
pub type HookResult<T> = std::result::Result<T, HookError>;

/// Boxed future returned by async hooks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = HookResult<T>> + Send + 'a>>;

/// Error raised by a hook. The message is surfaced to the caller.
#[derive(Debug, Clone)]
pub struct HookError(pub String);

impl std::fmt::Display for HookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for HookError {}

/// Schema validation for author-originated writes.
pub trait Validator: Send + Sync + 'static {
    fn validate(&self, kind: EntityKind, key: &str, body: &serde_json::Value) -> HookResult<()>;
}

/// Metadata fix-ups for deletes. Every call happens before the surrounding
/// transaction commits; an error aborts the delete.
pub trait MetadataHook: Send + Sync + 'static {
    /// A row is about to be physically removed.
    fn before_delete(&self, kind: EntityKind, key: &str, origin: &str) -> BoxFuture<'_, ()>;

    /// A row was removed (transaction still open).
    fn after_delete(&self, kind: EntityKind, key: &str, origin: &str) -> BoxFuture<'_, ()>;

    /// A delete-intent or delete-confirmed row is about to be written.
    fn before_tombstone(&self, kind: EntityKind, tag: &TaggedKey, origin: &str) -> BoxFuture<'_, ()>;
}

/// What produced a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Created,
    Updated,
    Replicated,
    Deleted,
}

/// A committed write.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    pub kind: EntityKind,
    pub key: String,
    pub origin: String,
    pub modified: Version,
    /// Wire representation; `Null` for physical deletes.
    pub body: serde_json::Value,
}

/// Receives every committed write. Must not block.
pub trait ChangePublisher: Send + Sync + 'static {
    fn publish(&self, event: ChangeEvent);
}

/// Accepts everything, does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpHooks;

impl Validator for NoOpHooks {
    fn validate(&self, _kind: EntityKind, _key: &str, _body: &serde_json::Value) -> HookResult<()> {
        Ok(())
    }
}

impl MetadataHook for NoOpHooks {
    fn before_delete(&self, kind: EntityKind, key: &str, origin: &str) -> BoxFuture<'_, ()> {
        tracing::trace!(%kind, key, origin, "NoOp: before delete");
        Box::pin(async { Ok(()) })
    }

    fn after_delete(&self, _kind: EntityKind, _key: &str, _origin: &str) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn before_tombstone(&self, kind: EntityKind, tag: &TaggedKey, origin: &str) -> BoxFuture<'_, ()> {
        tracing::trace!(%kind, tag = %tag, origin, "NoOp: before tombstone");
        Box::pin(async { Ok(()) })
    }
}

impl ChangePublisher for NoOpHooks {
    fn publish(&self, event: ChangeEvent) {
        tracing::trace!(kind = %event.kind, key = %event.key, origin = %event.origin, "NoOp: would publish change");
    }
}

/// The set of hooks a sequencer calls.
#[derive(Clone)]
pub struct Hooks {
    pub validator: Arc<dyn Validator>,
    pub metadata: Arc<dyn MetadataHook>,
    pub publisher: Arc<dyn ChangePublisher>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            validator: Arc::new(NoOpHooks),
            metadata: Arc::new(NoOpHooks),
            publisher: Arc::new(NoOpHooks),
        }
    }
}

impl Hooks {
    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_metadata(mut self, metadata: Arc<dyn MetadataHook>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn ChangePublisher>) -> Self {
        self.publisher = publisher;
        self
    }
}
