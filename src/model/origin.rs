// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote origin configuration records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SSH endpoint an origin is reached through.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelTarget {
    pub user: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
}

fn default_ssh_port() -> u16 {
    22
}

impl fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// A replication partner.
///
/// `local` is the origin tag pulled rows are stored under here; `remote` is
/// the origin tag on the partner side: pulls read rows carrying it and
/// pushes deliver rows under it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Origin {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<TunnelTarget>,
    #[serde(default)]
    pub local: String,
    #[serde(default)]
    pub remote: String,
    #[serde(default = "default_true")]
    pub pull: bool,
    #[serde(default)]
    pub push: bool,
    #[serde(default = "default_true")]
    pub replicate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub burst: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_pull: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_push: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl Origin {
    pub fn new(name: impl Into<String>, url: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            proxy: None,
            tunnel: None,
            local: local.into(),
            remote: String::new(),
            pull: true,
            push: false,
            replicate: true,
            batch_size: None,
            burst: false,
            last_pull: None,
            last_push: None,
        }
    }

    /// Base URL requests go to when no tunnel is configured.
    pub fn base_url(&self) -> &str {
        self.proxy
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(&self.url)
            .trim_end_matches('/')
    }

    pub fn pulls(&self) -> bool {
        self.replicate && self.pull
    }

    pub fn pushes(&self) -> bool {
        self.replicate && self.push
    }

    pub fn batch_size_or(&self, default: usize) -> usize {
        self.batch_size.filter(|n| *n > 0).unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_overrides_url() {
        let mut origin = Origin::new("remote", "https://remote.example/", "@remote");
        assert_eq!(origin.base_url(), "https://remote.example");
        origin.proxy = Some("http://proxy.local:8080/".to_string());
        assert_eq!(origin.base_url(), "http://proxy.local:8080");
        origin.proxy = Some(String::new());
        assert_eq!(origin.base_url(), "https://remote.example");
    }

    #[test]
    fn test_replicate_flag_gates_both_directions() {
        let mut origin = Origin::new("r", "http://r", "@r");
        origin.push = true;
        assert!(origin.pulls());
        assert!(origin.pushes());
        origin.replicate = false;
        assert!(!origin.pulls());
        assert!(!origin.pushes());
    }

    #[test]
    fn test_deserialize_defaults() {
        let origin: Origin = serde_json::from_str(
            r#"{"name":"r","url":"http://r","local":"@r","tunnel":{"user":"sync","host":"r.example"}}"#,
        )
        .unwrap();
        assert!(origin.pull);
        assert!(!origin.push);
        assert!(origin.replicate);
        assert_eq!(origin.tunnel.as_ref().map(|t| t.port), Some(22));
        assert_eq!(origin.tunnel.unwrap().to_string(), "sync@r.example:22");
    }

    #[test]
    fn test_batch_size_fallback() {
        let mut origin = Origin::new("r", "http://r", "@r");
        assert_eq!(origin.batch_size_or(500), 500);
        origin.batch_size = Some(0);
        assert_eq!(origin.batch_size_or(500), 500);
        origin.batch_size = Some(25);
        assert_eq!(origin.batch_size_or(500), 25);
    }
}
