// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire shapes of the five replicated entity types.

use super::{Entity, EntityKind, Version};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A generic resource, keyed by URL.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub url: String,
    #[serde(default)]
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternate_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<Version>,
}

impl Resource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

impl Entity for Resource {
    const KIND: EntityKind = EntityKind::Resource;

    fn key(&self) -> &str {
        &self.url
    }

    fn set_key(&mut self, key: String) {
        self.url = key;
    }

    fn origin(&self) -> &str {
        &self.origin
    }

    fn set_origin(&mut self, origin: String) {
        self.origin = origin;
    }

    fn modified(&self) -> Option<Version> {
        self.modified
    }

    fn set_modified(&mut self, modified: Version) {
        self.modified = Some(modified);
    }
}

/// Extension record: per-tag configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extension {
    pub tag: String,
    #[serde(default)]
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<Version>,
}

/// A user and its access lists.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub tag: String,
    #[serde(default)]
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub read_access: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub write_access: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag_read_access: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag_write_access: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pub_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<Version>,
}

/// Plugin descriptor: schema for a tag's metadata.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plugin {
    pub tag: String,
    #[serde(default)]
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<Value>,
    #[serde(default)]
    pub generate_metadata: bool,
    #[serde(default)]
    pub user_url: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<Version>,
}

/// Template descriptor: schema for extensions under a tag prefix.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub tag: String,
    #[serde(default)]
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<Version>,
}

macro_rules! tag_entity {
    ($ty:ident, $kind:expr) => {
        impl $ty {
            pub fn new(tag: impl Into<String>) -> Self {
                Self {
                    tag: tag.into(),
                    ..Default::default()
                }
            }

            pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
                self.origin = origin.into();
                self
            }

            pub fn with_name(mut self, name: impl Into<String>) -> Self {
                self.name = Some(name.into());
                self
            }
        }

        impl Entity for $ty {
            const KIND: EntityKind = $kind;

            fn key(&self) -> &str {
                &self.tag
            }

            fn set_key(&mut self, key: String) {
                self.tag = key;
            }

            fn origin(&self) -> &str {
                &self.origin
            }

            fn set_origin(&mut self, origin: String) {
                self.origin = origin;
            }

            fn modified(&self) -> Option<Version> {
                self.modified
            }

            fn set_modified(&mut self, modified: Version) {
                self.modified = Some(modified);
            }
        }
    };
}

tag_entity!(Extension, EntityKind::Extension);
tag_entity!(User, EntityKind::User);
tag_entity!(Plugin, EntityKind::Plugin);
tag_entity!(Template, EntityKind::Template);
