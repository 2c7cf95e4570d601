// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Version sequencer: collision-free `modified` stamps and optimistic locking.
//!
//! # Write Paths
//!
//! | Path | Stamps | Checks | Retries |
//! |------|--------|--------|---------|
//! | [`create`](VersionSequencer::create) | `now()` | natural key free | version collisions |
//! | [`update`](VersionSequencer::update) | `> expected` | `modified = expected` | version collisions |
//! | [`push`](VersionSequencer::push) | keeps remote value | none | never |
//! | [`replicate`](VersionSequencer::replicate) | keeps remote value | none | never (advances cursor) |
//!
//! A version collision is the store rejecting a write for `(origin, modified)`
//! uniqueness. Author paths re-stamp with `max(now, previous + 1µs)` and try
//! again, up to `max_attempts`. Every other rejection is final:
//!
//! ```text
//! attempt ──► Written ──► publish, return
//!    │
//!    ├──► Collision ──► re-stamp ──► attempt (bounded)
//!    │
//!    └──► Err(AlreadyExists | StaleWrite | NotFound | ...) ──► return
//! ```
//!
//! Each attempt is one SQLite transaction, itself retried on SQLITE_BUSY.

use super::hooks::{ChangeEvent, ChangeOp, HookError, Hooks};
use super::{encode_body, execute_with_retry, rows, tombstone, unique_violation, Store, UniqueViolation};
use crate::cursor;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::model::{Clock, Entity, EntityKind, SystemClock, Version};
use crate::tag::{TagState, TaggedKey};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of one write attempt.
enum Attempt<T> {
    Written(T),
    /// `(origin, modified)` was taken; the transaction was rolled back.
    Collision,
}

/// Result of a trusted write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The row was inserted or overwritten.
    Applied,
    /// An identical row was already stored.
    Unchanged,
}

/// Versioned writer for every entity kind.
#[derive(Clone)]
pub struct VersionSequencer {
    store: Store,
    clock: Arc<dyn Clock>,
    hooks: Hooks,
    max_attempts: u32,
}

impl VersionSequencer {
    pub fn new(store: Store, max_attempts: u32) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            hooks: Hooks::default(),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Next stamp after `previous` collided (or must be superseded).
    fn restamp(&self, previous: Version) -> Version {
        let now = self.clock.now();
        if now > previous {
            now
        } else {
            previous.next()
        }
    }

    async fn sequence<T, F, Fut>(
        &self,
        kind: EntityKind,
        key: &str,
        origin: &str,
        operation: &'static str,
        first: Version,
        mut attempt: F,
    ) -> Result<(T, Version)>
    where
        F: FnMut(Version) -> Fut,
        Fut: Future<Output = Result<Attempt<T>>>,
    {
        let mut version = first;
        for n in 1..=self.max_attempts {
            match execute_with_retry(operation, || attempt(version)).await? {
                Attempt::Written(value) => {
                    if n > 1 {
                        debug!(%kind, key, origin, attempts = n, modified = %version, "Resolved version collision");
                    }
                    return Ok((value, version));
                }
                Attempt::Collision => {
                    metrics::record_version_collision(kind);
                    version = self.restamp(version);
                }
            }
        }

        warn!(%kind, key, origin, attempts = self.max_attempts, "Version collision retry budget exhausted");
        metrics::record_collision_exhausted(kind);
        Err(ReplicationError::VersionCollisionExhausted {
            kind,
            key: key.to_string(),
            origin: origin.to_string(),
            attempts: self.max_attempts,
        })
    }

    fn validate<E: Entity>(&self, entity: &E, tagged: &TaggedKey) -> Result<serde_json::Value> {
        let body = serde_json::to_value(entity)
            .map_err(|e| ReplicationError::Internal(format!("cannot encode {}: {}", E::KIND, e)))?;
        if !tagged.state.is_tombstone() {
            self.hooks
                .validator
                .validate(E::KIND, entity.key(), &body)
                .map_err(|HookError(message)| ReplicationError::Validation {
                    kind: E::KIND,
                    key: entity.key().to_string(),
                    message,
                })?;
        }
        Ok(body)
    }

    fn publish<E: Entity>(&self, op: ChangeOp, entity: &E) {
        let Some(modified) = entity.modified() else {
            return;
        };
        let body = serde_json::to_value(entity).unwrap_or(serde_json::Value::Null);
        self.hooks.publisher.publish(ChangeEvent {
            op,
            kind: E::KIND,
            key: entity.key().to_string(),
            origin: entity.origin().to_string(),
            modified,
            body,
        });
    }

    // ───────────────────────────────────────────────────────────────────────
    // create
    // ───────────────────────────────────────────────────────────────────────

    /// Insert a new row stamped with a fresh version.
    ///
    /// Fails immediately with `AlreadyExists` if the natural key is taken
    /// (or, for a delete-intent, if the delete is already confirmed).
    pub async fn create<E: Entity>(&self, entity: E) -> Result<E> {
        let tagged = entity.tagged_key();
        self.validate(&entity, &tagged)?;

        let (e, t) = (&entity, &tagged);
        let ((), version) = self
            .sequence(E::KIND, entity.key(), entity.origin(), "create", self.clock.now(), move |v| {
                self.try_create(e, t, v)
            })
            .await
            .inspect_err(|err| metrics::record_write_error(E::KIND, "create", err))?;

        let mut created = entity;
        created.set_modified(version);
        metrics::record_write(E::KIND, "create");
        self.publish(ChangeOp::Created, &created);
        Ok(created)
    }

    async fn try_create<E: Entity>(&self, entity: &E, tagged: &TaggedKey, version: Version) -> Result<Attempt<()>> {
        let kind = E::KIND;
        let origin = entity.origin();
        let mut stamped = entity.clone();
        stamped.set_modified(version);
        let body = encode_body(&stamped)?;

        let mut tx = self.store.pool().begin().await?;

        if tagged.state == TagState::DeleteIntent {
            tombstone::prepare_intent(&mut tx, kind, tagged, origin).await?;
        }
        if tagged.state.is_tombstone() {
            self.before_tombstone(kind, tagged, origin).await?;
        }

        if let Err(e) = rows::insert(&mut tx, kind.table(), entity.key(), origin, version, &body).await {
            return match unique_violation(&e) {
                Some(UniqueViolation::Version) => Ok(Attempt::Collision),
                Some(UniqueViolation::NaturalKey) => Err(ReplicationError::AlreadyExists {
                    kind,
                    key: entity.key().to_string(),
                    origin: origin.to_string(),
                }),
                None => Err(e.into()),
            };
        }

        tombstone::clear_counterpart(&mut tx, kind, tagged, origin).await?;
        tx.commit().await?;
        Ok(Attempt::Written(()))
    }

    // ───────────────────────────────────────────────────────────────────────
    // update
    // ───────────────────────────────────────────────────────────────────────

    /// Overwrite the row only if it is still at `expected`.
    ///
    /// `StaleWrite` means someone else wrote first; re-fetch and retry at a
    /// higher level. The new version is always greater than `expected`.
    pub async fn update<E: Entity>(&self, entity: E, expected: Version) -> Result<E> {
        let tagged = entity.tagged_key();
        self.validate(&entity, &tagged)?;

        let (e, t) = (&entity, &tagged);
        let first = self.restamp(expected);
        let ((), version) = self
            .sequence(E::KIND, entity.key(), entity.origin(), "update", first, move |v| {
                self.try_update(e, t, expected, v)
            })
            .await
            .inspect_err(|err| metrics::record_write_error(E::KIND, "update", err))?;

        let mut updated = entity;
        updated.set_modified(version);
        metrics::record_write(E::KIND, "update");
        self.publish(ChangeOp::Updated, &updated);
        Ok(updated)
    }

    async fn try_update<E: Entity>(
        &self,
        entity: &E,
        tagged: &TaggedKey,
        expected: Version,
        version: Version,
    ) -> Result<Attempt<()>> {
        let kind = E::KIND;
        let key = entity.key();
        let origin = entity.origin();
        let mut stamped = entity.clone();
        stamped.set_modified(version);
        let body = encode_body(&stamped)?;

        let mut tx = self.store.pool().begin().await?;

        if tagged.state.is_tombstone() {
            self.before_tombstone(kind, tagged, origin).await?;
        }

        let changed =
            match rows::update_if_version(&mut tx, kind.table(), key, origin, expected, version, &body).await {
                Ok(n) => n,
                Err(e) => {
                    return match unique_violation(&e) {
                        Some(UniqueViolation::Version) => Ok(Attempt::Collision),
                        _ => Err(e.into()),
                    }
                }
            };

        if changed == 0 {
            let exists = rows::exists(&mut tx, kind.table(), key, origin).await?;
            return Err(if exists {
                ReplicationError::StaleWrite {
                    kind,
                    key: key.to_string(),
                    origin: origin.to_string(),
                    expected,
                }
            } else {
                ReplicationError::NotFound {
                    kind,
                    key: key.to_string(),
                    origin: origin.to_string(),
                }
            });
        }

        tombstone::clear_counterpart(&mut tx, kind, tagged, origin).await?;
        tx.commit().await?;
        Ok(Attempt::Written(()))
    }

    // ───────────────────────────────────────────────────────────────────────
    // push / replicate (trusted)
    // ───────────────────────────────────────────────────────────────────────

    /// Store a replicated copy exactly as received.
    ///
    /// No validation and no optimistic check. A clash with another row's
    /// `(origin, modified)` is reported as `DuplicateVersion`, never retried.
    pub async fn push<E: Entity>(&self, entity: E) -> Result<PushOutcome> {
        self.write_trusted(entity, None).await
    }

    /// [`push`](Self::push) plus advancing the `(cursor_origin, kind)` cursor
    /// to the record's version in the same transaction.
    pub async fn replicate<E: Entity>(&self, entity: E, cursor_origin: &str) -> Result<PushOutcome> {
        self.write_trusted(entity, Some(cursor_origin)).await
    }

    async fn write_trusted<E: Entity>(&self, entity: E, cursor_origin: Option<&str>) -> Result<PushOutcome> {
        let kind = E::KIND;
        let Some(modified) = entity.modified() else {
            return Err(ReplicationError::MissingVersion {
                kind,
                key: entity.key().to_string(),
                origin: entity.origin().to_string(),
            });
        };
        let tagged = entity.tagged_key();
        let body = encode_body(&entity)?;

        let (t, b) = (&tagged, body.as_str());
        let e = &entity;
        let outcome = execute_with_retry("push", move || self.try_push(e, t, modified, b, cursor_origin))
            .await
            .inspect_err(|err| metrics::record_write_error(kind, "push", err))?;

        if outcome == PushOutcome::Applied {
            metrics::record_write(kind, "push");
            self.publish(ChangeOp::Replicated, &entity);
        }
        Ok(outcome)
    }

    async fn try_push<E: Entity>(
        &self,
        entity: &E,
        tagged: &TaggedKey,
        modified: Version,
        body: &str,
        cursor_origin: Option<&str>,
    ) -> Result<PushOutcome> {
        let kind = E::KIND;
        let key = entity.key();
        let origin = entity.origin();

        let mut tx = self.store.pool().begin().await?;

        let current = rows::fetch(&mut tx, kind.table(), key, origin).await?;
        let unchanged = current
            .as_ref()
            .is_some_and(|row| row.modified == modified && row.body == body);

        if !unchanged {
            if tagged.state.is_tombstone() {
                self.before_tombstone(kind, tagged, origin).await?;
            }
            if let Err(e) = rows::upsert(&mut tx, kind.table(), key, origin, modified, body).await {
                return Err(match unique_violation(&e) {
                    Some(UniqueViolation::Version) => {
                        warn!(%kind, key, origin, %modified, "Replicated write collides with another row's version");
                        metrics::record_duplicate_version(kind);
                        ReplicationError::DuplicateVersion {
                            kind,
                            key: key.to_string(),
                            origin: origin.to_string(),
                            modified,
                        }
                    }
                    _ => e.into(),
                });
            }
            tombstone::clear_counterpart(&mut tx, kind, tagged, origin).await?;
        }

        if let Some(cursor_origin) = cursor_origin {
            cursor::advance_in(&mut tx, cursor_origin, kind, modified).await?;
        }

        tx.commit().await?;
        Ok(if unchanged {
            PushOutcome::Unchanged
        } else {
            PushOutcome::Applied
        })
    }

    // ───────────────────────────────────────────────────────────────────────
    // delete / confirm_delete
    // ───────────────────────────────────────────────────────────────────────

    /// Author delete.
    ///
    /// Resources are removed physically (metadata hook before and after,
    /// both inside the transaction) and the removed row is returned.
    /// Tombstone kinds get a delete-intent row built from the live row, which
    /// is returned.
    pub async fn delete<E: Entity>(&self, key: &str, origin: &str) -> Result<E> {
        if E::KIND.supports_tombstones() {
            let tagged = TaggedKey::parse(key);
            let live = self
                .store
                .get::<E>(&tagged.key, origin)
                .await?
                .ok_or_else(|| ReplicationError::NotFound {
                    kind: E::KIND,
                    key: tagged.key.clone(),
                    origin: origin.to_string(),
                })?;
            let mut intent = live;
            intent.set_key(tagged.with_state(TagState::DeleteIntent).to_wire());
            return self.create(intent).await;
        }

        let removed = execute_with_retry("delete", move || self.try_physical_delete::<E>(key, origin))
            .await
            .inspect_err(|err| metrics::record_write_error(E::KIND, "delete", err))?;

        metrics::record_write(E::KIND, "delete");
        if let Some(modified) = removed.modified() {
            self.hooks.publisher.publish(ChangeEvent {
                op: ChangeOp::Deleted,
                kind: E::KIND,
                key: key.to_string(),
                origin: origin.to_string(),
                modified,
                body: serde_json::Value::Null,
            });
        }
        Ok(removed)
    }

    async fn try_physical_delete<E: Entity>(&self, key: &str, origin: &str) -> Result<E> {
        let kind = E::KIND;
        let mut tx = self.store.pool().begin().await?;

        let Some(row) = rows::fetch(&mut tx, kind.table(), key, origin).await? else {
            return Err(ReplicationError::NotFound {
                kind,
                key: key.to_string(),
                origin: origin.to_string(),
            });
        };
        let removed: E = super::decode_row(&row.body, row.modified.as_micros())?;

        self.metadata(self.hooks.metadata.before_delete(kind, key, origin).await)?;
        rows::delete(&mut tx, kind.table(), key, origin).await?;
        self.metadata(self.hooks.metadata.after_delete(kind, key, origin).await)?;

        tx.commit().await?;
        Ok(removed)
    }

    /// Finish a delete: the live row and any delete-intent are replaced by a
    /// single delete-confirmed row, in one transaction.
    ///
    /// `key` may be given in any tag state. Fails with `AlreadyExists` if
    /// the delete is already confirmed, `NotFound` if there is nothing to
    /// delete.
    pub async fn confirm_delete<E: Entity>(&self, key: &str, origin: &str) -> Result<E> {
        if !E::KIND.supports_tombstones() {
            return Err(ReplicationError::Internal(format!(
                "{} has no tombstones; delete it directly",
                E::KIND
            )));
        }
        let tagged = TaggedKey::parse(key).with_state(TagState::DeleteConfirmed);
        let t = &tagged;

        let (confirmed, _) = self
            .sequence(E::KIND, &t.to_wire(), origin, "confirm_delete", self.clock.now(), move |v| {
                self.try_confirm::<E>(t, origin, v)
            })
            .await
            .inspect_err(|err| metrics::record_write_error(E::KIND, "confirm_delete", err))?;

        metrics::record_write(E::KIND, "confirm_delete");
        self.publish(ChangeOp::Created, &confirmed);
        Ok(confirmed)
    }

    async fn try_confirm<E: Entity>(&self, confirmed: &TaggedKey, origin: &str, version: Version) -> Result<Attempt<E>> {
        let kind = E::KIND;
        let table = kind.table();
        let live_key = confirmed.key.as_str();
        let intent_key = confirmed.with_state(TagState::DeleteIntent).to_wire();
        let confirmed_key = confirmed.to_wire();

        let mut tx = self.store.pool().begin().await?;

        if rows::exists(&mut tx, table, &confirmed_key, origin).await? {
            return Err(ReplicationError::AlreadyExists {
                kind,
                key: confirmed_key,
                origin: origin.to_string(),
            });
        }

        let intent = rows::fetch(&mut tx, table, &intent_key, origin).await?;
        let live = rows::fetch(&mut tx, table, live_key, origin).await?;
        let Some(source) = intent.as_ref().or(live.as_ref()) else {
            return Err(ReplicationError::NotFound {
                kind,
                key: live_key.to_string(),
                origin: origin.to_string(),
            });
        };
        let mut entity: E = super::decode_row(&source.body, source.modified.as_micros())?;
        entity.set_key(confirmed_key.clone());
        entity.set_modified(version);
        let body = encode_body(&entity)?;

        self.before_tombstone(kind, confirmed, origin).await?;

        if live.is_some() {
            self.metadata(self.hooks.metadata.before_delete(kind, live_key, origin).await)?;
            rows::delete(&mut tx, table, live_key, origin).await?;
            self.metadata(self.hooks.metadata.after_delete(kind, live_key, origin).await)?;
        }
        rows::delete(&mut tx, table, &intent_key, origin).await?;

        if let Err(e) = rows::insert(&mut tx, table, &confirmed_key, origin, version, &body).await {
            return match unique_violation(&e) {
                Some(UniqueViolation::Version) => Ok(Attempt::Collision),
                Some(UniqueViolation::NaturalKey) => Err(ReplicationError::AlreadyExists {
                    kind,
                    key: confirmed_key,
                    origin: origin.to_string(),
                }),
                None => Err(e.into()),
            };
        }

        tx.commit().await?;
        Ok(Attempt::Written(entity))
    }

    async fn before_tombstone(&self, kind: EntityKind, tagged: &TaggedKey, origin: &str) -> Result<()> {
        self.metadata(self.hooks.metadata.before_tombstone(kind, tagged, origin).await)
    }

    fn metadata(&self, result: std::result::Result<(), HookError>) -> Result<()> {
        result.map_err(|HookError(message)| ReplicationError::Internal(format!("metadata hook failed: {}", message)))
    }
}
