// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tombstone tag convention.
//!
//! Deletes of tag-keyed entities travel as ordinary writes. The state is
//! carried in the key string itself:
//!
//! | State | Wire form |
//! |-------|-----------|
//! | live | `+ext/foo` |
//! | delete-intent | `del/+ext/foo` |
//! | delete-confirmed | `deleted/+ext/foo` |
//!
//! Inside the crate the state is an explicit [`TagState`] next to the base key.

use std::fmt;

pub const DELETE_INTENT_PREFIX: &str = "del/";
pub const DELETE_CONFIRMED_PREFIX: &str = "deleted/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagState {
    Live,
    DeleteIntent,
    DeleteConfirmed,
}

impl TagState {
    /// The tombstone state a write in this state evicts, if any.
    pub fn counterpart(&self) -> Option<TagState> {
        match self {
            TagState::Live => None,
            TagState::DeleteIntent => Some(TagState::DeleteConfirmed),
            TagState::DeleteConfirmed => Some(TagState::DeleteIntent),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        !matches!(self, TagState::Live)
    }

    fn prefix(&self) -> &'static str {
        match self {
            TagState::Live => "",
            TagState::DeleteIntent => DELETE_INTENT_PREFIX,
            TagState::DeleteConfirmed => DELETE_CONFIRMED_PREFIX,
        }
    }
}

/// A natural key split into tombstone state and base key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaggedKey {
    pub state: TagState,
    pub key: String,
}

impl TaggedKey {
    /// Parse a wire key. Only one prefix is stripped.
    pub fn parse(wire: &str) -> Self {
        if let Some(rest) = wire.strip_prefix(DELETE_CONFIRMED_PREFIX) {
            Self {
                state: TagState::DeleteConfirmed,
                key: rest.to_string(),
            }
        } else if let Some(rest) = wire.strip_prefix(DELETE_INTENT_PREFIX) {
            Self {
                state: TagState::DeleteIntent,
                key: rest.to_string(),
            }
        } else {
            Self::live(wire)
        }
    }

    pub fn live(key: impl Into<String>) -> Self {
        Self {
            state: TagState::Live,
            key: key.into(),
        }
    }

    pub fn with_state(&self, state: TagState) -> Self {
        Self {
            state,
            key: self.key.clone(),
        }
    }

    pub fn to_wire(&self) -> String {
        format!("{}{}", self.state.prefix(), self.key)
    }
}

impl fmt::Display for TaggedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.state.prefix(), self.key)
    }
}

pub fn is_delete_intent(tag: &str) -> bool {
    TaggedKey::parse(tag).state == TagState::DeleteIntent
}

pub fn is_delete_confirmed(tag: &str) -> bool {
    TaggedKey::parse(tag).state == TagState::DeleteConfirmed
}

/// Delete-intent form of `tag`, whatever state it is in now.
pub fn to_delete_intent(tag: &str) -> String {
    TaggedKey::parse(tag).with_state(TagState::DeleteIntent).to_wire()
}

/// Delete-confirmed form of `tag`, whatever state it is in now.
pub fn to_delete_confirmed(tag: &str) -> String {
    TaggedKey::parse(tag).with_state(TagState::DeleteConfirmed).to_wire()
}

/// Base key with any tombstone prefix removed.
pub fn base_key(tag: &str) -> String {
    TaggedKey::parse(tag).key
}
