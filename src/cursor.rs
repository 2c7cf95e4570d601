// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication cursors.
//!
//! One row per `(origin, kind)` holding the highest `modified` value
//! ingested from that origin. The pull path advances it in the same
//! transaction as each replicated write, so it can never point past a row
//! that is not durably stored.
//!
//! ## Cursor Semantics
//!
//! ```text
//! fetch page (modifiedAfter = cursor)
//!   → write m1, cursor = m1   (one transaction)
//!   → write m2, cursor = m2   (crash here = cursor at m1, re-fetch m2.., idempotent)
//!   → ...
//! ```
//!
//! Advances use `MAX(old, new)`: a cursor never rewinds, even if a page
//! arrives out of order.

use crate::error::{ReplicationError, Result};
use crate::model::{EntityKind, Version};
use crate::store::{execute_with_retry, Store};
use sqlx::sqlite::SqlitePool;
use sqlx::{Row, SqliteConnection};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorEntry {
    pub origin: String,
    pub kind: EntityKind,
    pub modified: Version,
    /// Wall-clock millis of the last advance.
    pub updated_at: i64,
}

/// Advance a cursor on a connection that is inside the caller's transaction.
pub(crate) async fn advance_in(
    conn: &mut SqliteConnection,
    origin: &str,
    kind: EntityKind,
    modified: Version,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO replication_cursor (origin, kind, modified, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(origin, kind) DO UPDATE SET
            modified = MAX(modified, excluded.modified),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(origin)
    .bind(kind.as_str())
    .bind(modified.as_micros())
    .bind(chrono::Utc::now().timestamp_millis())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Read/administer cursors. Shares the store's pool.
#[derive(Clone)]
pub struct CursorStore {
    pool: SqlitePool,
}

impl CursorStore {
    pub fn new(store: &Store) -> Self {
        Self {
            pool: store.pool().clone(),
        }
    }

    /// Returns `None` if nothing was ever pulled for this origin and kind.
    pub async fn get(&self, origin: &str, kind: EntityKind) -> Result<Option<Version>> {
        let modified: Option<i64> =
            sqlx::query_scalar("SELECT modified FROM replication_cursor WHERE origin = ? AND kind = ?")
                .bind(origin)
                .bind(kind.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(modified.map(Version::from_micros))
    }

    /// Cursor, falling back to the newest stored row for the origin.
    ///
    /// Rows written before cursors existed (or restored from a backup) still
    /// give a usable resume point.
    pub async fn resume_point(&self, store: &Store, origin: &str, kind: EntityKind) -> Result<Option<Version>> {
        match self.get(origin, kind).await? {
            Some(v) => Ok(Some(v)),
            None => store.max_modified(kind, origin).await,
        }
    }

    /// Advance outside a write transaction. Never rewinds.
    /// Returns the stored value afterwards.
    pub async fn advance(&self, origin: &str, kind: EntityKind, modified: Version) -> Result<Version> {
        let pool = &self.pool;
        execute_with_retry("cursor_advance", move || async move {
            let mut conn = pool.acquire().await?;
            advance_in(&mut conn, origin, kind, modified).await?;
            Ok::<_, ReplicationError>(())
        })
        .await?;

        let stored = self.get(origin, kind).await?.unwrap_or(modified);
        debug!(origin, %kind, cursor = %stored, "Cursor advanced");
        Ok(stored)
    }

    /// All cursors for one origin.
    pub async fn list(&self, origin: &str) -> Result<Vec<CursorEntry>> {
        let rows = sqlx::query(
            "SELECT origin, kind, modified, updated_at FROM replication_cursor WHERE origin = ? ORDER BY kind",
        )
        .bind(origin)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().filter_map(|row| decode_entry(row).transpose()).collect()
    }

    /// Every cursor (for diagnostics).
    pub async fn get_all(&self) -> Result<Vec<CursorEntry>> {
        let rows = sqlx::query("SELECT origin, kind, modified, updated_at FROM replication_cursor ORDER BY origin, kind")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().filter_map(|row| decode_entry(row).transpose()).collect()
    }

    /// Forget every cursor of an origin, forcing a full re-pull.
    pub async fn reset(&self, origin: &str) -> Result<u64> {
        let pool = &self.pool;
        let removed = execute_with_retry("cursor_reset", move || async move {
            let result = sqlx::query("DELETE FROM replication_cursor WHERE origin = ?")
                .bind(origin)
                .execute(pool)
                .await?;
            Ok::<_, ReplicationError>(result.rows_affected())
        })
        .await?;
        info!(origin, removed, "Reset replication cursors");
        Ok(removed)
    }
}

/// Rows with an unknown kind name are skipped.
fn decode_entry(row: &sqlx::sqlite::SqliteRow) -> Result<Option<CursorEntry>> {
    let kind: String = row.try_get("kind")?;
    let Some(kind) = EntityKind::from_name(&kind) else {
        return Ok(None);
    };
    Ok(Some(CursorEntry {
        origin: row.try_get("origin")?,
        kind,
        modified: Version::from_micros(row.try_get("modified")?),
        updated_at: row.try_get("updated_at")?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_cursor_absent_then_advanced() {
        let store = Store::in_memory().await.unwrap();
        let cursors = CursorStore::new(&store);

        assert!(cursors.get("@r", EntityKind::Extension).await.unwrap().is_none());
        let v = cursors
            .advance("@r", EntityKind::Extension, Version::from_micros(100))
            .await
            .unwrap();
        assert_eq!(v, Version::from_micros(100));
        assert_eq!(
            cursors.get("@r", EntityKind::Extension).await.unwrap(),
            Some(Version::from_micros(100))
        );
    }

    #[tokio::test]
    async fn test_cursor_never_rewinds() {
        let store = Store::in_memory().await.unwrap();
        let cursors = CursorStore::new(&store);

        cursors.advance("@r", EntityKind::User, Version::from_micros(50)).await.unwrap();
        let v = cursors.advance("@r", EntityKind::User, Version::from_micros(20)).await.unwrap();
        assert_eq!(v, Version::from_micros(50));
    }

    #[tokio::test]
    async fn test_cursors_independent_per_kind_and_origin() {
        let store = Store::in_memory().await.unwrap();
        let cursors = CursorStore::new(&store);

        cursors.advance("@a", EntityKind::User, Version::from_micros(1)).await.unwrap();
        cursors.advance("@a", EntityKind::Plugin, Version::from_micros(2)).await.unwrap();
        cursors.advance("@b", EntityKind::User, Version::from_micros(3)).await.unwrap();

        let a = cursors.list("@a").await.unwrap();
        assert_eq!(a.len(), 2);
        assert!(a.iter().all(|c| c.origin == "@a"));
        assert_eq!(cursors.get_all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_resume_point_falls_back_to_max_modified() {
        let store = Store::in_memory().await.unwrap();
        let cursors = CursorStore::new(&store);
        sqlx::query("INSERT INTO template (key, origin, modified, body) VALUES ('_t', '@r', 77, '{\"tag\":\"_t\"}')")
            .execute(store.pool())
            .await
            .unwrap();

        assert_eq!(
            cursors.resume_point(&store, "@r", EntityKind::Template).await.unwrap(),
            Some(Version::from_micros(77))
        );
        cursors.advance("@r", EntityKind::Template, Version::from_micros(90)).await.unwrap();
        assert_eq!(
            cursors.resume_point(&store, "@r", EntityKind::Template).await.unwrap(),
            Some(Version::from_micros(90))
        );
    }

    #[tokio::test]
    async fn test_reset_forgets_origin() {
        let store = Store::in_memory().await.unwrap();
        let cursors = CursorStore::new(&store);
        cursors.advance("@a", EntityKind::User, Version::from_micros(1)).await.unwrap();
        cursors.advance("@b", EntityKind::User, Version::from_micros(1)).await.unwrap();

        assert_eq!(cursors.reset("@a").await.unwrap(), 1);
        assert!(cursors.get("@a", EntityKind::User).await.unwrap().is_none());
        assert!(cursors.get("@b", EntityKind::User).await.unwrap().is_some());
        assert_eq!(cursors.reset("@missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cursor_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let config = crate::config::StoreConfig::at_path(dir.path().join("c.db").to_string_lossy());
        {
            let store = Store::open(&config).await.unwrap();
            CursorStore::new(&store)
                .advance("@r", EntityKind::Resource, Version::from_micros(9999))
                .await
                .unwrap();
            store.close().await;
        }
        let store = Store::open(&config).await.unwrap();
        assert_eq!(
            CursorStore::new(&store).get("@r", EntityKind::Resource).await.unwrap(),
            Some(Version::from_micros(9999))
        );
        store.close().await;
    }
}
