// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Version sequencer tests against an on-disk SQLite database.
//!
//! These use a real multi-connection pool so concurrent writers actually
//! race on the `UNIQUE(origin, modified)` constraint.
//!
//! # Test Organization
//! - `concurrent_*` - collision resolution and optimistic locking under load
//! - `tombstone_*` - delete-intent / delete-confirmed transitions
//! - `publish_*` - change notifications

mod common;

use common::{t, t0, RecordingPublisher};
use origin_replication::model::ManualClock;
use origin_replication::store::ChangeOp;
use origin_replication::{
    EntityKind, Extension, Hooks, ReplicationError, Resource, Store, StoreConfig, User, VersionSequencer,
};
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::TempDir;

async fn disk_store() -> (TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("seq.db");
    let store = Store::open(&StoreConfig::at_path(path.to_string_lossy().to_string()))
        .await
        .unwrap();
    (dir, store)
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test]
async fn concurrent_creates_with_frozen_clock_get_distinct_versions() {
    let (_dir, store) = disk_store().await;
    let clock = Arc::new(ManualClock::new(t0()));
    let sequencer = VersionSequencer::new(store.clone(), 50).with_clock(clock);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let sequencer = sequencer.clone();
            tokio::spawn(async move {
                sequencer
                    .create(Extension::new(format!("+ext/item{}", i)))
                    .await
            })
        })
        .collect();

    let mut versions = HashSet::new();
    for handle in handles {
        let created = handle.await.unwrap().unwrap();
        let modified = created.modified.unwrap();
        assert!(modified >= t0());
        assert!(versions.insert(modified), "duplicate version {}", modified);
    }
    assert_eq!(versions.len(), 8);
    assert_eq!(store.count(EntityKind::Extension, "").await.unwrap(), 8);
}

#[tokio::test]
async fn concurrent_updates_with_same_cursor_one_wins() {
    let (_dir, store) = disk_store().await;
    let sequencer = VersionSequencer::new(store.clone(), 10);

    let r1 = sequencer.create(Resource::new("https://example.com/r1")).await.unwrap();
    let t1 = r1.modified.unwrap();

    let a = {
        let sequencer = sequencer.clone();
        let edit = r1.clone().with_title("from a");
        tokio::spawn(async move { sequencer.update(edit, t1).await })
    };
    let b = {
        let sequencer = sequencer.clone();
        let edit = r1.clone().with_title("from b");
        tokio::spawn(async move { sequencer.update(edit, t1).await })
    };
    let results = [a.await.unwrap(), b.await.unwrap()];

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    let losers: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
    assert_eq!(winners.len(), 1, "exactly one update may win");
    assert_eq!(losers.len(), 1);
    assert!(matches!(losers[0], ReplicationError::StaleWrite { .. }));
    assert!(losers[0].is_conflict());

    let stored: Resource = store.get("https://example.com/r1", "").await.unwrap().unwrap();
    assert_ne!(stored.modified, Some(t1));
    assert_eq!(stored.modified, winners[0].modified);
    assert_eq!(stored.title, winners[0].title);
}

#[tokio::test]
async fn concurrent_origins_do_not_collide() {
    let (_dir, store) = disk_store().await;
    let clock = Arc::new(ManualClock::new(t0()));
    let sequencer = VersionSequencer::new(store.clone(), 10).with_clock(clock);

    // Same instant, different origins: no collision at all.
    let a = sequencer.create(User::new("+user/alice").with_origin("@a")).await.unwrap();
    let b = sequencer.create(User::new("+user/alice").with_origin("@b")).await.unwrap();
    assert_eq!(a.modified, Some(t0()));
    assert_eq!(b.modified, Some(t0()));
}

#[tokio::test]
async fn collision_budget_exhausted() {
    let (_dir, store) = disk_store().await;
    let clock = Arc::new(ManualClock::new(t0()));
    let sequencer = VersionSequencer::new(store.clone(), 2).with_clock(clock);

    // Occupy t0 and t0+1 via the trusted path.
    for (i, v) in [t0(), t(1)].into_iter().enumerate() {
        let mut e = Extension::new(format!("+ext/seed{}", i));
        e.modified = Some(v);
        sequencer.push(e).await.unwrap();
    }

    let err = sequencer.create(Extension::new("+ext/late")).await.unwrap_err();
    assert!(matches!(err, ReplicationError::VersionCollisionExhausted { attempts: 2, .. }));
    assert!(!err.is_conflict());
}

// =============================================================================
// Tombstones
// =============================================================================

#[tokio::test]
async fn tombstone_confirmed_blocks_new_intent() {
    let (_dir, store) = disk_store().await;
    let sequencer = VersionSequencer::new(store.clone(), 10);

    sequencer.create(Extension::new("+ext/foo")).await.unwrap();
    sequencer.create(Extension::new("del/+ext/foo")).await.unwrap();
    // A second intent collapses into one row.
    sequencer.create(Extension::new("del/+ext/foo")).await.unwrap();
    assert_eq!(store.count(EntityKind::Extension, "").await.unwrap(), 2);

    let confirmed: Extension = sequencer.confirm_delete("+ext/foo", "").await.unwrap();
    assert_eq!(confirmed.tag, "deleted/+ext/foo");
    assert_eq!(store.count(EntityKind::Extension, "").await.unwrap(), 1);
    assert!(store.get::<Extension>("+ext/foo", "").await.unwrap().is_none());
    assert!(store.get::<Extension>("del/+ext/foo", "").await.unwrap().is_none());

    let err = sequencer.create(Extension::new("del/+ext/foo")).await.unwrap_err();
    assert!(matches!(err, ReplicationError::AlreadyExists { .. }));
}

#[tokio::test]
async fn tombstone_replicated_intent_clears_confirmed() {
    let (_dir, store) = disk_store().await;
    let sequencer = VersionSequencer::new(store.clone(), 10);

    let mut confirmed = Extension::new("deleted/+ext/bar").with_origin("@remote");
    confirmed.modified = Some(t(1));
    sequencer.push(confirmed).await.unwrap();

    let mut intent = Extension::new("del/+ext/bar").with_origin("@remote");
    intent.modified = Some(t(2));
    sequencer.push(intent).await.unwrap();

    assert!(store.get::<Extension>("deleted/+ext/bar", "@remote").await.unwrap().is_none());
    assert!(store.get::<Extension>("del/+ext/bar", "@remote").await.unwrap().is_some());
}

#[tokio::test]
async fn tombstone_author_delete_of_resource_is_physical() {
    let (_dir, store) = disk_store().await;
    let sequencer = VersionSequencer::new(store.clone(), 10);

    sequencer.create(Resource::new("https://example.com/gone")).await.unwrap();
    let removed: Resource = sequencer.delete("https://example.com/gone", "").await.unwrap();
    assert_eq!(removed.url, "https://example.com/gone");
    assert_eq!(store.count(EntityKind::Resource, "").await.unwrap(), 0);

    let err = sequencer.delete::<Resource>("https://example.com/gone", "").await.unwrap_err();
    assert!(matches!(err, ReplicationError::NotFound { .. }));
}

// =============================================================================
// Change notifications
// =============================================================================

#[tokio::test]
async fn publish_after_every_successful_write() {
    let (_dir, store) = disk_store().await;
    let publisher = Arc::new(RecordingPublisher::default());
    let sequencer = VersionSequencer::new(store.clone(), 10)
        .with_hooks(Hooks::default().with_publisher(publisher.clone()));

    let created = sequencer.create(Extension::new("+ext/n")).await.unwrap();
    let expected = created.modified.unwrap();
    sequencer.update(created.clone().with_name("renamed"), expected).await.unwrap();

    // A stale update publishes nothing.
    assert!(sequencer.update(created, expected).await.is_err());

    let mut replicated = Extension::new("+ext/n").with_origin("@remote");
    replicated.modified = Some(t(7));
    sequencer.push(replicated.clone()).await.unwrap();
    // Identical re-push is a no-op and publishes nothing.
    sequencer.push(replicated).await.unwrap();

    let events = publisher.events.lock().unwrap();
    let ops: Vec<ChangeOp> = events.iter().map(|e| e.op).collect();
    assert_eq!(ops, vec![ChangeOp::Created, ChangeOp::Updated, ChangeOp::Replicated]);
    assert_eq!(events[2].origin, "@remote");
}
