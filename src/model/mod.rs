// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity model shared by the store, the sequencer and the replication engine.
//!
//! Every entity is addressed by a natural key (`url` for resources, `tag` for
//! everything else) plus an `origin`. Its `modified` [`Version`] doubles as
//! the optimistic-lock token and as the replication cursor value.

mod entities;
mod origin;
mod version;

pub use entities::{Extension, Plugin, Resource, Template, User};
pub use origin::{Origin, TunnelTarget};
pub use version::{Clock, ManualClock, SystemClock, Version, VersionParseError};

use crate::tag::TaggedKey;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The five replicated entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Resource,
    Extension,
    User,
    Plugin,
    Template,
}

impl EntityKind {
    /// All kinds, in the order a replication cycle visits them.
    ///
    /// Schema descriptors come first so dependent records land after them.
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Plugin,
        EntityKind::Template,
        EntityKind::Extension,
        EntityKind::User,
        EntityKind::Resource,
    ];

    /// SQLite table holding this kind.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Resource => "resource",
            EntityKind::Extension => "extension",
            EntityKind::User => "users",
            EntityKind::Plugin => "plugin",
            EntityKind::Template => "template",
        }
    }

    /// Path segment of the replication endpoints.
    pub fn path(&self) -> &'static str {
        match self {
            EntityKind::Resource => "ref",
            EntityKind::Extension => "ext",
            EntityKind::User => "user",
            EntityKind::Plugin => "plugin",
            EntityKind::Template => "template",
        }
    }

    /// Whether deletes of this kind go through tombstone tags.
    ///
    /// Resources have no schema dependents and are deleted physically.
    pub fn supports_tombstones(&self) -> bool {
        !matches!(self, EntityKind::Resource)
    }

    /// Inverse of [`as_str`](Self::as_str).
    pub fn from_name(name: &str) -> Option<Self> {
        EntityKind::ALL.into_iter().find(|k| k.as_str() == name)
    }

    /// Stable lowercase name (metrics labels, cursor records).
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Resource => "resource",
            EntityKind::Extension => "extension",
            EntityKind::User => "user",
            EntityKind::Plugin => "plugin",
            EntityKind::Template => "template",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A replicated entity.
///
/// Implementors are plain serde structs; the wire representation is their
/// JSON form and is also what the store keeps in the `body` column.
pub trait Entity:
    Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + Unpin + 'static
{
    const KIND: EntityKind;

    /// Natural key (`url` or `tag`) in wire form.
    fn key(&self) -> &str;
    fn set_key(&mut self, key: String);

    fn origin(&self) -> &str;
    fn set_origin(&mut self, origin: String);

    fn modified(&self) -> Option<Version>;
    fn set_modified(&mut self, modified: Version);

    /// Natural key split into tombstone state and base key.
    ///
    /// Kinds without tombstones always report [`TagState::Live`](crate::tag::TagState::Live).
    fn tagged_key(&self) -> TaggedKey {
        if Self::KIND.supports_tombstones() {
            TaggedKey::parse(self.key())
        } else {
            TaggedKey::live(self.key())
        }
    }
}
