//! Shared test utilities for the integration, replication and chaos suites.
//!
//! This module provides:
//! - Version helpers around a fixed base time
//! - A wiremock "remote origin" with catch-all replication endpoints
//! - Engine builders (in-memory or on-disk store)
//! - A fake tunnel connector that forwards to a local port
//! - A recording change publisher

#![allow(dead_code)]

use futures::future::BoxFuture;
use origin_replication::pool::{TunnelConnector, TunnelSession};
use origin_replication::store::{ChangeEvent, ChangePublisher};
use origin_replication::{
    ConnectionPools, Entity, Origin, ReplicationConfig, ReplicationEngine, Result, StoreConfig, TunnelTarget,
    Version,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// 2023-11-14T22:13:20Z in microseconds.
pub const T0_MICROS: i64 = 1_700_000_000_000_000;

pub fn t0() -> Version {
    Version::from_micros(T0_MICROS)
}

/// `t0 + offset` microseconds.
pub fn t(offset: i64) -> Version {
    Version::from_micros(T0_MICROS + offset)
}

/// Give an entity a version, as a remote would have stamped it.
pub fn stamped<E: Entity>(mut entity: E, version: Version) -> E {
    entity.set_modified(version);
    entity
}

pub fn repl_path(kind_path: &str) -> String {
    format!("/pub/api/v1/repl/{}", kind_path)
}

/// A remote whose endpoints answer "nothing new" unless a test mounts a
/// more specific mock.
pub async fn empty_remote() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/pub/api/v1/repl/[a-z]+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .with_priority(10)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/pub/api/v1/repl/[a-z]+/cursor$"))
        .respond_with(ResponseTemplate::new(200).set_body_string("null"))
        .with_priority(10)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/pub/api/v1/repl/[a-z]+$"))
        .respond_with(ResponseTemplate::new(200))
        .with_priority(10)
        .mount(&server)
        .await;
    server
}

/// Config with the scheduler off and one origin per `(name, url, local)`.
pub fn config_with(origins: Vec<Origin>) -> ReplicationConfig {
    let mut config = ReplicationConfig::for_testing("");
    config.origins = origins;
    config
}

pub async fn started(config: ReplicationConfig) -> ReplicationEngine {
    let mut engine = ReplicationEngine::new(config);
    engine.start().await.expect("engine start");
    engine
}

/// Engine over an on-disk database with a multi-connection pool.
pub async fn started_on_disk(mut config: ReplicationConfig) -> (TempDir, ReplicationEngine) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("origins.db");
    config.store = StoreConfig::at_path(path.to_string_lossy().to_string());
    (dir, started(config).await)
}

pub fn pull_origin(name: &str, url: &str, local: &str) -> Origin {
    Origin::new(name, url, local)
}

pub fn push_origin(name: &str, url: &str, remote: &str) -> Origin {
    let mut origin = Origin::new(name, url, format!("@{}", name));
    origin.pull = false;
    origin.push = true;
    origin.remote = remote.to_string();
    origin
}

pub fn target(host: &str) -> TunnelTarget {
    TunnelTarget {
        user: "repl".to_string(),
        host: host.to_string(),
        port: 22,
    }
}

// =============================================================================
// Fake tunnel
// =============================================================================

/// "Forwards" to a fixed local port, typically a wiremock server's.
pub struct LoopbackConnector {
    pub port: u16,
    pub connects: AtomicUsize,
    pub fail: AtomicBool,
}

impl LoopbackConnector {
    pub fn new(port: u16) -> Arc<Self> {
        Arc::new(Self {
            port,
            connects: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        })
    }
}

impl TunnelConnector for LoopbackConnector {
    fn connect<'a>(&'a self, target: &'a TunnelTarget) -> BoxFuture<'a, Result<Arc<dyn TunnelSession>>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(origin_replication::ReplicationError::tunnel_msg(
                    target.to_string(),
                    "handshake refused",
                ));
            }
            let session: Arc<dyn TunnelSession> = Arc::new(LoopbackSession {
                port: self.port,
                closed: AtomicBool::new(false),
            });
            Ok(session)
        })
    }
}

pub struct LoopbackSession {
    port: u16,
    closed: AtomicBool,
}

impl TunnelSession for LoopbackSession {
    fn local_port(&self) -> u16 {
        self.port
    }

    fn check(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub fn loopback_pools(config: &ReplicationConfig, connector: Arc<LoopbackConnector>) -> ConnectionPools {
    ConnectionPools::with_connector(config.settings.http.clone(), connector, Duration::from_millis(50))
}

// =============================================================================
// Recording publisher
// =============================================================================

#[derive(Default)]
pub struct RecordingPublisher {
    pub events: Mutex<Vec<ChangeEvent>>,
}

impl RecordingPublisher {
    pub fn keys(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().map(|e| e.key.clone()).collect()
    }
}

impl ChangePublisher for RecordingPublisher {
    fn publish(&self, event: ChangeEvent) {
        self.events.lock().unwrap().push(event);
    }
}
