// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Row-level statements shared by the sequencer paths.
//!
//! All helpers run on a connection that is already inside a transaction.

use crate::model::Version;
use sqlx::{Row, SqliteConnection};

pub(crate) struct StoredRow {
    pub modified: Version,
    pub body: String,
}

pub(crate) async fn fetch(
    conn: &mut SqliteConnection,
    table: &str,
    key: &str,
    origin: &str,
) -> Result<Option<StoredRow>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT modified, body FROM {table} WHERE key = ? AND origin = ?"
    ))
    .bind(key)
    .bind(origin)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => Ok(Some(StoredRow {
            modified: Version::from_micros(row.try_get("modified")?),
            body: row.try_get("body")?,
        })),
        None => Ok(None),
    }
}

pub(crate) async fn exists(
    conn: &mut SqliteConnection,
    table: &str,
    key: &str,
    origin: &str,
) -> Result<bool, sqlx::Error> {
    let found: Option<i64> = sqlx::query_scalar(&format!(
        "SELECT 1 FROM {table} WHERE key = ? AND origin = ?"
    ))
    .bind(key)
    .bind(origin)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(found.is_some())
}

pub(crate) async fn insert(
    conn: &mut SqliteConnection,
    table: &str,
    key: &str,
    origin: &str,
    modified: Version,
    body: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "INSERT INTO {table} (key, origin, modified, body) VALUES (?, ?, ?, ?)"
    ))
    .bind(key)
    .bind(origin)
    .bind(modified.as_micros())
    .bind(body)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Compare-and-swap on `modified`. Returns the number of rows changed.
pub(crate) async fn update_if_version(
    conn: &mut SqliteConnection,
    table: &str,
    key: &str,
    origin: &str,
    expected: Version,
    modified: Version,
    body: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(&format!(
        "UPDATE {table} SET modified = ?, body = ? WHERE key = ? AND origin = ? AND modified = ?"
    ))
    .bind(modified.as_micros())
    .bind(body)
    .bind(key)
    .bind(origin)
    .bind(expected.as_micros())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Insert or overwrite by natural key. An `(origin, modified)` clash with a
/// different row still fails.
pub(crate) async fn upsert(
    conn: &mut SqliteConnection,
    table: &str,
    key: &str,
    origin: &str,
    modified: Version,
    body: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        r#"
        INSERT INTO {table} (key, origin, modified, body) VALUES (?, ?, ?, ?)
        ON CONFLICT(key, origin) DO UPDATE SET
            modified = excluded.modified,
            body = excluded.body
        "#
    ))
    .bind(key)
    .bind(origin)
    .bind(modified.as_micros())
    .bind(body)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn delete(
    conn: &mut SqliteConnection,
    table: &str,
    key: &str,
    origin: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(&format!("DELETE FROM {table} WHERE key = ? AND origin = ?"))
        .bind(key)
        .bind(origin)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}
