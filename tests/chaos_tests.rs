// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the engine handles broken remotes without panics,
//! deadlocks, or lost cursor progress.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::*;
use origin_replication::{EntityKind, Plugin, ReplicationEngine, ReplicationError};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{any, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn failing_remote(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;
    server
}

// =============================================================================
// Broken Payloads
// =============================================================================

/// Test: A malformed page fails its kind only
#[tokio::test]
async fn malformed_page_fails_only_its_kind() {
    let server = empty_remote().await;
    Mock::given(method("GET"))
        .and(path(repl_path("ext")))
        .respond_with(ResponseTemplate::new(200).set_body_string("[{\"tag\": \"+ext/a\", \"modif"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(repl_path("plugin")))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![stamped(Plugin::new("plugin/x"), t(4))]))
        .mount(&server)
        .await;

    let engine = started(config_with(vec![pull_origin("remote", &server.uri(), "@remote")])).await;
    let ctx = engine.context().await.unwrap();
    ctx.cursors().advance("@remote", EntityKind::Extension, t0()).await.unwrap();

    let report = engine.pull("remote").await.unwrap();
    assert_eq!(report.outcome(), "partial");
    let ext = report.kind(EntityKind::Extension).unwrap();
    assert!(ext.error.as_deref().unwrap().contains("Parse error"));
    assert_eq!(ext.applied, 0);

    assert_eq!(ctx.cursors().get("@remote", EntityKind::Extension).await.unwrap(), Some(t0()));
    assert_eq!(ctx.cursors().get("@remote", EntityKind::Plugin).await.unwrap(), Some(t(4)));
    let origin = ctx.origins().get("remote").await.unwrap().unwrap();
    assert!(origin.last_pull.is_none());
}

/// Test: A 500 on one kind leaves its cursor where it was
#[tokio::test]
async fn server_error_keeps_cursor() {
    let server = empty_remote().await;
    Mock::given(method("GET"))
        .and(path(repl_path("user")))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let engine = started(config_with(vec![pull_origin("remote", &server.uri(), "@remote")])).await;
    let ctx = engine.context().await.unwrap();
    ctx.cursors().advance("@remote", EntityKind::User, t(1)).await.unwrap();

    let report = engine.pull("remote").await.unwrap();
    let user = report.kind(EntityKind::User).unwrap();
    assert!(user.error.as_deref().unwrap().contains("500"));
    assert_eq!(report.failed_kinds(), 1);
    assert_eq!(ctx.cursors().get("@remote", EntityKind::User).await.unwrap(), Some(t(1)));
}

// =============================================================================
// Unreachable and Failing Remotes
// =============================================================================

/// Test: An unreachable origin aborts its own cycle and nothing else
#[tokio::test]
async fn unreachable_origin_isolated() {
    let healthy = empty_remote().await;
    let engine = started(config_with(vec![
        pull_origin("dead", "http://127.0.0.1:1", "@dead"),
        pull_origin("alive", &healthy.uri(), "@alive"),
    ]))
    .await;

    let err = engine.pull("dead").await.unwrap_err();
    assert!(matches!(err, ReplicationError::Http { .. }), "got {:?}", err);
    assert!(err.is_retryable());

    let report = engine.pull("alive").await.unwrap();
    assert!(report.is_complete());

    let ctx = engine.context().await.unwrap();
    assert!(ctx.origins().get("dead").await.unwrap().unwrap().last_pull.is_none());
    assert!(ctx.origins().get("alive").await.unwrap().unwrap().last_pull.is_some());
}

/// Test: Repeated failures open the origin's circuit
#[tokio::test]
async fn repeated_failures_open_circuit() {
    let server = failing_remote(503).await;
    let engine = started(config_with(vec![pull_origin("flaky", &server.uri(), "@flaky")])).await;

    let mut opened = false;
    for _ in 0..5 {
        match engine.pull("flaky").await {
            Err(ReplicationError::CircuitOpen(origin)) => {
                assert_eq!(origin, "flaky");
                opened = true;
                break;
            }
            Ok(report) => assert_eq!(report.outcome(), "failed"),
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }
    assert!(opened, "circuit never opened");

    let health = engine.health_check();
    assert_eq!(health.origins_circuit_open, 1);
    assert!(!health.healthy);
    assert!(health.ready);
}

/// Test: An open circuit on one origin does not reject another
#[tokio::test]
async fn open_circuit_is_per_origin() {
    let flaky = failing_remote(503).await;
    let healthy = empty_remote().await;
    let engine = started(config_with(vec![
        pull_origin("flaky", &flaky.uri(), "@flaky"),
        pull_origin("alive", &healthy.uri(), "@alive"),
    ]))
    .await;

    for _ in 0..5 {
        let _ = engine.pull("flaky").await;
    }
    let report = engine.pull("alive").await.unwrap();
    assert!(report.is_complete());
}

/// Test: A rejected push batch does not poison the next push
#[tokio::test]
async fn push_recovers_after_remote_error() {
    let server = empty_remote().await;
    let engine = started(config_with(vec![push_origin("partner", &server.uri(), "@home")])).await;
    let ctx = engine.context().await.unwrap();
    ctx.sequencer().create(Plugin::new("plugin/p")).await.unwrap();

    Mock::given(method("POST"))
        .and(path(repl_path("plugin")))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    let report = engine.push("partner").await.unwrap();
    assert!(report.kind(EntityKind::Plugin).unwrap().error.is_some());

    let report = engine.push("partner").await.unwrap();
    assert!(report.is_complete());
    assert_eq!(report.kind(EntityKind::Plugin).unwrap().applied, 1);
}

// =============================================================================
// Concurrency Limits
// =============================================================================

async fn slow_remote(delay: Duration) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!([]))
                .set_delay(delay),
        )
        .mount(&server)
        .await;
    server
}

/// Test: The same origin and direction never run twice at once
#[tokio::test]
async fn concurrent_same_origin_pull_rejected() {
    let server = slow_remote(Duration::from_millis(300)).await;
    let engine = Arc::new(started(config_with(vec![pull_origin("slow", &server.uri(), "@slow")])).await);

    let first = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.pull("slow").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = engine.pull("slow").await.unwrap_err();
    assert!(matches!(err, ReplicationError::CycleInProgress { .. }), "got {:?}", err);
    assert_eq!(engine.health_check().cycles_in_flight, 1);

    assert!(first.await.unwrap().is_ok());
    assert_eq!(engine.health_check().cycles_in_flight, 0);
    // The guard is released: a new cycle may start.
    assert!(engine.pull("slow").await.is_ok());
}

/// Test: A full bulkhead skips cycles after the queue timeout
#[tokio::test]
async fn bulkhead_full_rejects_after_queue_timeout() {
    let slow = slow_remote(Duration::from_millis(400)).await;
    let fast = empty_remote().await;
    let mut config = config_with(vec![
        pull_origin("slow", &slow.uri(), "@slow"),
        pull_origin("fast", &fast.uri(), "@fast"),
    ]);
    config.settings.schedule.max_concurrent_cycles = 1;
    config.settings.schedule.queue_timeout = "50ms".to_string();
    let engine: Arc<ReplicationEngine> = Arc::new(started(config).await);

    let first = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.pull("slow").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.health_check().bulkhead_available, 0);

    let err = engine.pull("fast").await.unwrap_err();
    assert!(matches!(err, ReplicationError::BulkheadFull(_)), "got {:?}", err);

    assert!(first.await.unwrap().is_ok());
    assert_eq!(engine.health_check().bulkhead_available, 1);
    assert!(engine.pull("fast").await.is_ok());
}
