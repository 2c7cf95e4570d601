// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the origin store and replication engine.
//!
//! Configuration is passed to [`ReplicationEngine::new()`](crate::ReplicationEngine::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use origin_replication::config::ReplicationConfig;
//! use origin_replication::model::Origin;
//!
//! let mut config = ReplicationConfig::for_testing("");
//! config.origins.push(Origin::new("remote", "https://remote.example", "@remote"));
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── local_origin: String          # Tenant this instance serves ("" = default)
//! ├── store: StoreConfig            # SQLite location and pool
//! ├── settings: ReplicationSettings
//! │   ├── sequencer: SequencerConfig  # Version collision retry budget
//! │   ├── schedule: ScheduleConfig    # Pull/push intervals, burst, bulkhead
//! │   ├── http: HttpConfig            # Per-tenant pools and timeouts
//! │   ├── tunnel: TunnelConfig        # SSH tunnel pool
//! │   └── circuit: CircuitSettings    # Per-origin breaker
//! └── origins: Vec<Origin>          # Seed origins upserted at start
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! local_origin: ""
//!
//! store:
//!   sqlite_path: "/var/lib/app/origins.db"
//!
//! settings:
//!   schedule:
//!     pull_interval: "1m"
//!     max_concurrent_cycles: 4
//!   tunnel:
//!     identity_file: "/etc/app/id_ed25519"
//!
//! origins:
//!   - name: "remote"
//!     url: "https://remote.example"
//!     local: "@remote"
//! ```

use crate::circuit_breaker::CircuitConfig;
use crate::model::Origin;
use crate::resilience::RateLimitConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

fn default_true() -> bool {
    true
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Tenant this instance serves. Author writes land under this origin.
    #[serde(default)]
    pub local_origin: String,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub settings: ReplicationSettings,

    /// Origins upserted into the origin table when the engine starts.
    /// Existing records with the same name are replaced, bookkeeping kept.
    #[serde(default)]
    pub origins: Vec<Origin>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            local_origin: String::new(),
            store: StoreConfig::default(),
            settings: ReplicationSettings::default(),
            origins: Vec::new(),
        }
    }
}

impl ReplicationConfig {
    /// Create a minimal config for testing: in-memory store, no scheduler.
    pub fn for_testing(local_origin: &str) -> Self {
        let mut settings = ReplicationSettings::default();
        settings.schedule.enabled = false;
        settings.http.housekeeping_interval = "100ms".to_string();
        settings.tunnel.release_grace = "50ms".to_string();
        settings.tunnel.health_interval = "100ms".to_string();
        Self {
            local_origin: local_origin.to_string(),
            store: StoreConfig::in_memory(),
            settings,
            origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationSettings {
    #[serde(default)]
    pub sequencer: SequencerConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub circuit: CircuitSettings,
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database, or `:memory:`.
    pub sqlite_path: String,

    #[serde(default = "default_true")]
    pub wal_mode: bool,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long SQLite itself waits on a lock before returning BUSY.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout: String,
}

fn default_max_connections() -> u32 {
    8
}

fn default_busy_timeout() -> String {
    "5s".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "origins.db".to_string(),
            wal_mode: true,
            max_connections: 8,
            busy_timeout: "5s".to_string(),
        }
    }
}

impl StoreConfig {
    /// In-memory database on a single connection (each connection would
    /// otherwise see its own empty database).
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
            max_connections: 1,
            busy_timeout: "5s".to_string(),
        }
    }

    pub fn at_path(path: impl Into<String>) -> Self {
        Self {
            sqlite_path: path.into(),
            ..Default::default()
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }

    pub fn busy_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.busy_timeout, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SequencerConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencerConfig {
    /// Attempts at a collision-free `(origin, modified)` before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    10
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self { max_attempts: 10 }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ScheduleConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Background replication schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Whether `start()` spawns the pull/push loops.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_pull_interval")]
    pub pull_interval: String,

    #[serde(default = "default_push_interval")]
    pub push_interval: String,

    /// Page size for origins without their own `batchSize`.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Upper bound on back-to-back cycles for a burst origin whose
    /// batches keep coming back full.
    #[serde(default = "default_max_burst_cycles")]
    pub max_burst_cycles: u32,

    /// Bulkhead size: replication cycles in flight across all origins.
    #[serde(default = "default_max_concurrent_cycles")]
    pub max_concurrent_cycles: usize,

    /// How long a cycle waits for a bulkhead slot before it is skipped.
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout: String,

    /// Throttle ingestion of pulled records.
    #[serde(default)]
    pub rate_limit_enabled: bool,

    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_pull_interval() -> String {
    "1m".to_string()
}

fn default_push_interval() -> String {
    "1m".to_string()
}

fn default_batch_size() -> usize {
    500
}

fn default_max_burst_cycles() -> u32 {
    20
}

fn default_max_concurrent_cycles() -> usize {
    4
}

fn default_queue_timeout() -> String {
    "30s".to_string()
}

fn default_rate_limit_per_sec() -> u32 {
    5_000
}

fn default_rate_limit_burst() -> u32 {
    500
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pull_interval: default_pull_interval(),
            push_interval: default_push_interval(),
            batch_size: default_batch_size(),
            max_burst_cycles: default_max_burst_cycles(),
            max_concurrent_cycles: default_max_concurrent_cycles(),
            queue_timeout: default_queue_timeout(),
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }
}

impl ScheduleConfig {
    pub fn pull_interval_duration(&self) -> Duration {
        parse_duration_or(&self.pull_interval, Duration::from_secs(60))
    }

    pub fn push_interval_duration(&self) -> Duration {
        parse_duration_or(&self.push_interval, Duration::from_secs(60))
    }

    pub fn queue_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.queue_timeout, Duration::from_secs(30))
    }

    /// Default page size, never below one record.
    pub fn page_size(&self) -> usize {
        self.batch_size.max(1)
    }

    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HttpConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-tenant HTTP pools.
///
/// Timeouts are generous on purpose: a replication page can be large.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Concurrent requests per parallel pool. Serial pools always allow one.
    #[serde(default = "default_max_per_route")]
    pub max_connections_per_route: usize,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,

    /// Whole-request timeout (connect, send, read body).
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,

    /// A pool unused for this long has its connections closed.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: String,

    #[serde(default = "default_housekeeping_interval")]
    pub housekeeping_interval: String,

    /// How often pool utilisation is logged.
    #[serde(default = "default_stats_interval")]
    pub stats_interval: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_max_per_route() -> usize {
    4
}

fn default_connect_timeout() -> String {
    "2m".to_string()
}

fn default_request_timeout() -> String {
    "10m".to_string()
}

fn default_idle_timeout() -> String {
    "5m".to_string()
}

fn default_housekeeping_interval() -> String {
    "30s".to_string()
}

fn default_stats_interval() -> String {
    "5m".to_string()
}

fn default_user_agent() -> String {
    concat!("origin-replication/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_connections_per_route: default_max_per_route(),
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            idle_timeout: default_idle_timeout(),
            housekeeping_interval: default_housekeeping_interval(),
            stats_interval: default_stats_interval(),
            user_agent: default_user_agent(),
        }
    }
}

impl HttpConfig {
    pub fn connect_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.connect_timeout, Duration::from_secs(120))
    }

    pub fn request_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.request_timeout, Duration::from_secs(600))
    }

    pub fn idle_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.idle_timeout, Duration::from_secs(300))
    }

    pub fn housekeeping_interval_duration(&self) -> Duration {
        parse_duration_or(&self.housekeeping_interval, Duration::from_secs(30))
    }

    pub fn stats_interval_duration(&self) -> Duration {
        parse_duration_or(&self.stats_interval, Duration::from_secs(300))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TunnelConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// How often live sessions are probed.
    #[serde(default = "default_health_interval")]
    pub health_interval: String,

    /// Delay between the last release and closing the session.
    #[serde(default = "default_release_grace")]
    pub release_grace: String,

    #[serde(default = "default_tunnel_connect_timeout")]
    pub connect_timeout: String,

    /// Private key used for every tunnel. Falls back to the SSH agent.
    #[serde(default)]
    pub identity_file: Option<String>,

    /// Command run on the remote host that reports the HTTP port to forward to.
    #[serde(default = "default_banner_command")]
    pub banner_command: String,

    /// Remote HTTP port used when the banner does not name one.
    #[serde(default = "default_remote_port")]
    pub default_remote_port: u16,

    /// Refuse hosts missing from or changed in `known_hosts`.
    #[serde(default)]
    pub strict_host_keys: bool,
}

fn default_health_interval() -> String {
    "30s".to_string()
}

fn default_release_grace() -> String {
    "10s".to_string()
}

fn default_tunnel_connect_timeout() -> String {
    "30s".to_string()
}

fn default_banner_command() -> String {
    "tunnel-info".to_string()
}

fn default_remote_port() -> u16 {
    8081
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            health_interval: default_health_interval(),
            release_grace: default_release_grace(),
            connect_timeout: default_tunnel_connect_timeout(),
            identity_file: None,
            banner_command: default_banner_command(),
            default_remote_port: default_remote_port(),
            strict_host_keys: false,
        }
    }
}

impl TunnelConfig {
    pub fn health_interval_duration(&self) -> Duration {
        parse_duration_or(&self.health_interval, Duration::from_secs(30))
    }

    pub fn release_grace_duration(&self) -> Duration {
        parse_duration_or(&self.release_grace, Duration::from_secs(10))
    }

    pub fn connect_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.connect_timeout, Duration::from_secs(30))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CircuitSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// Breaker settings applied to every remote origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout: String,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_recovery_timeout() -> String {
    "30s".to_string()
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: default_recovery_timeout(),
        }
    }
}

impl CircuitSettings {
    pub fn to_circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            recovery_timeout: parse_duration_or(&self.recovery_timeout, Duration::from_secs(30)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
