// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tombstone side effects applied inside a write transaction.
//!
//! At most one tombstone row exists per base key: writing one state evicts
//! the other. A delete-intent cannot be created once the delete is
//! confirmed.

use super::rows;
use crate::error::{ReplicationError, Result};
use crate::model::EntityKind;
use crate::tag::{TagState, TaggedKey};
use sqlx::SqliteConnection;
use tracing::debug;

/// Reject a delete-intent for a key whose delete is already confirmed, then
/// collapse any earlier delete-intent for the same key.
pub(super) async fn prepare_intent(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    tagged: &TaggedKey,
    origin: &str,
) -> Result<()> {
    let confirmed = tagged.with_state(TagState::DeleteConfirmed).to_wire();
    if rows::exists(conn, kind.table(), &confirmed, origin).await? {
        return Err(ReplicationError::AlreadyExists {
            kind,
            key: confirmed,
            origin: origin.to_string(),
        });
    }

    let removed = rows::delete(conn, kind.table(), &tagged.to_wire(), origin).await?;
    if removed > 0 {
        debug!(%kind, tag = %tagged, origin, "Collapsed duplicate delete-intent");
    }
    Ok(())
}

/// Remove the opposite tombstone state for the key just written.
pub(super) async fn clear_counterpart(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    tagged: &TaggedKey,
    origin: &str,
) -> Result<()> {
    let Some(other) = tagged.state.counterpart() else {
        return Ok(());
    };
    let wire = tagged.with_state(other).to_wire();
    let removed = rows::delete(conn, kind.table(), &wire, origin).await?;
    if removed > 0 {
        debug!(%kind, tag = %wire, origin, "Removed counterpart tombstone");
    }
    Ok(())
}
