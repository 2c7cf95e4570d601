// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pull/push replication against a wiremock remote origin.
//!
//! # Test Organization
//! - `pull_*` - cursor resume, ordering, re-tagging, partial failure
//! - `push_*` - remote watermark, re-tagging, batching
//! - `tunnel_*` - replication through the tunnel pool

mod common;

use common::*;
use origin_replication::store::OriginStore;
use origin_replication::{Direction, EntityKind, Extension, Plugin, ReplicationEngine, ReplicationError, Template};
use std::sync::atomic::Ordering;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

fn ext(tag: &str, offset: i64) -> Extension {
    stamped(Extension::new(tag), t(offset))
}

// =============================================================================
// Pull
// =============================================================================

#[tokio::test]
async fn pull_resumes_from_cursor_and_advances_to_last_record() {
    let server = empty_remote().await;
    Mock::given(method("GET"))
        .and(path(repl_path("ext")))
        .and(query_param("modifiedAfter", t0().to_string()))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(vec![ext("+ext/a", 1), ext("+ext/b", 2), ext("+ext/c", 3)]),
        )
        .expect(1)
        .mount(&server)
        .await;

    let engine = started(config_with(vec![pull_origin("remote", &server.uri(), "@remote")])).await;
    let ctx = engine.context().await.unwrap();
    ctx.cursors().advance("@remote", EntityKind::Extension, t0()).await.unwrap();

    let report = engine.pull("remote").await.unwrap();
    assert_eq!(report.direction, Direction::Pull);
    assert!(report.is_complete());
    assert_eq!(report.kind(EntityKind::Extension).unwrap().applied, 3);

    assert_eq!(
        ctx.cursors().get("@remote", EntityKind::Extension).await.unwrap(),
        Some(t(3))
    );
    for tag in ["+ext/a", "+ext/b", "+ext/c"] {
        let row: Extension = ctx.store().get(tag, "@remote").await.unwrap().unwrap();
        assert_eq!(row.origin, "@remote");
    }
    assert_eq!(ctx.store().count(EntityKind::Extension, "").await.unwrap(), 0);

    let origin = ctx.origins().get("remote").await.unwrap().unwrap();
    assert!(origin.last_pull.is_some());
}

#[tokio::test]
async fn pull_without_cursor_starts_from_newest_local_row() {
    let server = empty_remote().await;
    Mock::given(method("GET"))
        .and(path(repl_path("plugin")))
        .and(query_param("modifiedAfter", t(5).to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![stamped(Plugin::new("plugin/x"), t(6))]))
        .expect(1)
        .mount(&server)
        .await;

    let engine = started(config_with(vec![pull_origin("remote", &server.uri(), "@remote")])).await;
    let ctx = engine.context().await.unwrap();
    ctx.sequencer()
        .push(stamped(Plugin::new("plugin/old").with_origin("@remote"), t(5)))
        .await
        .unwrap();

    engine.pull("remote").await.unwrap();
    assert_eq!(ctx.cursors().get("@remote", EntityKind::Plugin).await.unwrap(), Some(t(6)));
}

#[tokio::test]
async fn pull_sorts_out_of_order_page() {
    let server = empty_remote().await;
    Mock::given(method("GET"))
        .and(path(repl_path("ext")))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(vec![ext("+ext/c", 3), ext("+ext/a", 1), ext("+ext/b", 2)]),
        )
        .mount(&server)
        .await;

    let engine = started(config_with(vec![pull_origin("remote", &server.uri(), "@remote")])).await;
    engine.pull("remote").await.unwrap();

    let ctx = engine.context().await.unwrap();
    assert_eq!(ctx.cursors().get("@remote", EntityKind::Extension).await.unwrap(), Some(t(3)));
}

#[tokio::test]
async fn pull_partial_failure_leaves_cursor_at_last_written() {
    let server = empty_remote().await;
    Mock::given(method("GET"))
        .and(path(repl_path("ext")))
        .and(query_param("modifiedAfter", t0().to_string()))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(vec![ext("+ext/a", 1), ext("+ext/b", 2), ext("+ext/c", 3)]),
        )
        .expect(1)
        .mount(&server)
        .await;
    // The retry must resume strictly after the last written record.
    Mock::given(method("GET"))
        .and(path(repl_path("ext")))
        .and(query_param("modifiedAfter", t(2).to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![ext("+ext/c", 3)]))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(repl_path("template")))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![stamped(Template::new("_template/t"), t(9))]))
        .mount(&server)
        .await;

    let engine = started(config_with(vec![pull_origin("remote", &server.uri(), "@remote")])).await;
    let ctx = engine.context().await.unwrap();
    ctx.cursors().advance("@remote", EntityKind::Extension, t0()).await.unwrap();

    // A foreign row already holds (@remote, t0+3): the third record collides.
    ctx.sequencer()
        .push(stamped(Extension::new("+ext/squatter").with_origin("@remote"), t(3)))
        .await
        .unwrap();

    let report = engine.pull("remote").await.unwrap();
    assert_eq!(report.outcome(), "partial");
    let ext_report = report.kind(EntityKind::Extension).unwrap();
    assert_eq!(ext_report.applied, 2);
    assert!(ext_report.error.as_deref().unwrap().contains("already used by another row"));
    assert_eq!(ctx.cursors().get("@remote", EntityKind::Extension).await.unwrap(), Some(t(2)));

    // Sibling kinds still ran.
    assert_eq!(report.kind(EntityKind::Template).unwrap().applied, 1);
    // Bookkeeping only moves on complete cycles.
    assert!(ctx.origins().get("remote").await.unwrap().unwrap().last_pull.is_none());

    let retry = engine.pull("remote").await.unwrap();
    assert_eq!(retry.kind(EntityKind::Extension).unwrap().applied, 0);
    assert_eq!(ctx.cursors().get("@remote", EntityKind::Extension).await.unwrap(), Some(t(2)));
}

#[tokio::test]
async fn pull_repeat_is_idempotent() {
    let server = empty_remote().await;
    Mock::given(method("GET"))
        .and(path(repl_path("ext")))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![ext("+ext/a", 1), ext("+ext/b", 2)]))
        .mount(&server)
        .await;

    let engine = started(config_with(vec![pull_origin("remote", &server.uri(), "@remote")])).await;
    let first = engine.pull("remote").await.unwrap();
    assert_eq!(first.kind(EntityKind::Extension).unwrap().applied, 2);

    // The remote ignores the cursor and resends the same page.
    let second = engine.pull("remote").await.unwrap();
    let kind = second.kind(EntityKind::Extension).unwrap();
    assert_eq!(kind.applied, 0);
    assert_eq!(kind.unchanged, 2);
    assert!(second.is_complete());
}

#[tokio::test]
async fn pull_full_page_reports_more() {
    let server = empty_remote().await;
    Mock::given(method("GET"))
        .and(path(repl_path("ext")))
        .and(query_param("size", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![ext("+ext/a", 1), ext("+ext/b", 2)]))
        .mount(&server)
        .await;

    let mut origin = pull_origin("remote", &server.uri(), "@remote");
    origin.batch_size = Some(2);
    let engine = started(config_with(vec![origin])).await;

    let report = engine.pull("remote").await.unwrap();
    assert!(report.has_more());
    assert!(report.kind(EntityKind::Extension).unwrap().full);
}

#[tokio::test]
async fn pull_zero_batch_size_requests_one_record_pages() {
    let server = empty_remote().await;
    Mock::given(method("GET"))
        .and(path(repl_path("ext")))
        .and(query_param("size", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(Vec::<Extension>::new()))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = config_with(vec![pull_origin("remote", &server.uri(), "@remote")]);
    config.settings.schedule.batch_size = 0;
    let engine = started(config).await;

    let report = engine.pull("remote").await.unwrap();
    assert!(report.is_complete());
    assert!(!report.has_more(), "an empty page must not look full");
    server.verify().await;
}

#[tokio::test]
async fn pull_refuses_origin_tagged_as_local_tenant() {
    let server = empty_remote().await;
    let engine = started(config_with(vec![])).await;
    let ctx = engine.context().await.unwrap();
    ctx.sequencer().create(Extension::new("+ext/mine")).await.unwrap();

    let untagged = pull_origin("untagged", &server.uri(), "");
    assert!(matches!(engine.upsert_origin(&untagged).await, Err(ReplicationError::Config(_))));

    // Written around the engine's guard, the cycle still refuses it.
    OriginStore::new(ctx.store()).upsert(&untagged).await.unwrap();
    assert!(matches!(engine.pull("untagged").await, Err(ReplicationError::Config(_))));
    assert!(server.received_requests().await.unwrap().is_empty());
    assert!(ctx.store().get::<Extension>("+ext/mine", "").await.unwrap().is_some());
}

// =============================================================================
// Push
// =============================================================================

#[tokio::test]
async fn push_sends_local_rows_after_remote_cursor() {
    let server = empty_remote().await;
    Mock::given(method("GET"))
        .and(path(format!("{}/cursor", repl_path("ext"))))
        .and(query_param("origin", "@home"))
        .respond_with(ResponseTemplate::new(200).set_body_json(t(1)))
        .mount(&server)
        .await;

    let engine = started(config_with(vec![push_origin("remote", &server.uri(), "@home")])).await;
    let ctx = engine.context().await.unwrap();
    for (tag, offset) in [("+ext/old", 1), ("+ext/new1", 2), ("+ext/new2", 3)] {
        ctx.sequencer().push(ext(tag, offset)).await.unwrap();
    }
    // Rows of other tenants never leave this instance.
    ctx.sequencer()
        .push(stamped(Extension::new("+ext/foreign").with_origin("@elsewhere"), t(4)))
        .await
        .unwrap();

    let report = engine.push("remote").await.unwrap();
    assert_eq!(report.direction, Direction::Push);
    assert_eq!(report.kind(EntityKind::Extension).unwrap().applied, 2);
    assert_eq!(report.kind(EntityKind::Extension).unwrap().cursor, Some(t(3)));

    let posts: Vec<_> = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.method.to_string() == "POST")
        .collect();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].url.path(), repl_path("ext"));
    let sent: Vec<Extension> = serde_json::from_slice(&posts[0].body).unwrap();
    let tags: Vec<_> = sent.iter().map(|e| e.tag.as_str()).collect();
    assert_eq!(tags, vec!["+ext/new1", "+ext/new2"]);
    assert!(sent.iter().all(|e| e.origin == "@home"));

    assert!(ctx.origins().get("remote").await.unwrap().unwrap().last_push.is_some());
}

#[tokio::test]
async fn push_rejected_batch_is_reported() {
    let server = empty_remote().await;
    Mock::given(method("POST"))
        .and(path(repl_path("ext")))
        .respond_with(ResponseTemplate::new(409))
        .mount(&server)
        .await;

    let engine = started(config_with(vec![push_origin("remote", &server.uri(), "@home")])).await;
    let ctx = engine.context().await.unwrap();
    ctx.sequencer().create(Extension::new("+ext/a")).await.unwrap();

    let report = engine.push("remote").await.unwrap();
    assert_eq!(report.outcome(), "partial");
    assert!(report.kind(EntityKind::Extension).unwrap().error.is_some());
    assert!(ctx.origins().get("remote").await.unwrap().unwrap().last_push.is_none());
}

// =============================================================================
// Tunnels
// =============================================================================

#[tokio::test]
async fn tunnel_pull_goes_through_forwarded_port() {
    let server = empty_remote().await;
    Mock::given(method("GET"))
        .and(path(repl_path("ext")))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![ext("+ext/t", 1)]))
        .mount(&server)
        .await;

    let mut origin = pull_origin("tunnelled", "http://unreachable.invalid", "@tunnelled");
    origin.tunnel = Some(target("origin.example"));
    let config = config_with(vec![origin]);

    let connector = LoopbackConnector::new(server.address().port());
    let pools = loopback_pools(&config, connector.clone());
    let mut engine = ReplicationEngine::new(config).with_pools(pools);
    engine.start().await.unwrap();

    engine.pull("tunnelled").await.unwrap();
    engine.pull("tunnelled").await.unwrap();
    // Second cycle reused the session (still inside the grace period).
    assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

    let ctx = engine.context().await.unwrap();
    assert!(ctx.store().get::<Extension>("+ext/t", "@tunnelled").await.unwrap().is_some());
    engine.shutdown().await;
    assert_eq!(engine.pools().tunnels().live_count(), 0);
}

#[tokio::test]
async fn tunnel_setup_failure_aborts_cycle() {
    let server = empty_remote().await;
    let mut origin = pull_origin("tunnelled", "http://unreachable.invalid", "@tunnelled");
    origin.tunnel = Some(target("origin.example"));
    let config = config_with(vec![origin]);

    let connector = LoopbackConnector::new(server.address().port());
    connector.fail.store(true, Ordering::SeqCst);
    let pools = loopback_pools(&config, connector.clone());
    let mut engine = ReplicationEngine::new(config).with_pools(pools);
    engine.start().await.unwrap();

    let err = engine.pull("tunnelled").await.unwrap_err();
    assert!(matches!(err, ReplicationError::Tunnel { .. }));
    assert_eq!(engine.pools().tunnels().live_count(), 0);

    // Nothing broken was cached: the next attempt connects again.
    connector.fail.store(false, Ordering::SeqCst);
    engine.pull("tunnelled").await.unwrap();
    assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn origins_are_upserted_at_runtime() {
    let server = empty_remote().await;
    let engine = started(config_with(vec![])).await;
    assert!(matches!(engine.pull("late").await, Err(ReplicationError::Config(_))));

    engine
        .upsert_origin(&pull_origin("late", &server.uri(), "@late"))
        .await
        .unwrap();
    let report = engine.pull("late").await.unwrap();
    assert!(report.is_complete());

    let ctx = engine.context().await.unwrap();
    let listed = OriginStore::new(ctx.store()).list().await.unwrap();
    assert_eq!(listed.len(), 1);
}
