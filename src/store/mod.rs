// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed entity store.
//!
//! One table per [`EntityKind`], each shaped `(key, origin, modified, body)`:
//!
//! - `UNIQUE(key, origin)`: one row per natural key per tenant
//! - `UNIQUE(origin, modified)`: the per-origin total order of writes
//!
//! The second constraint is what makes version sequencing safe across
//! processes; the application never checks it itself, it reacts to the
//! constraint violation.
//!
//! # SQLite Busy Handling
//!
//! SQLite returns SQLITE_BUSY/SQLITE_LOCKED (or an extended code derived
//! from them) when a writer is contended. Whole transactions are retried
//! with exponential backoff via [`execute_with_retry`].
//!
//! # Submodules
//!
//! - [`sequencer`]: versioned writes (create, update, push, delete)
//! - [`hooks`]: collaborator seams (validation, metadata, change publish)
//! - [`origins`]: origin configuration records

pub mod hooks;
pub mod origins;
mod rows;
pub mod sequencer;
mod tombstone;

pub use hooks::{ChangeEvent, ChangeOp, ChangePublisher, HookError, Hooks, MetadataHook, NoOpHooks, Validator};
pub use origins::OriginStore;
pub use sequencer::{PushOutcome, VersionSequencer};

use crate::config::StoreConfig;
use crate::error::{ReplicationError, Result};
use crate::model::{Entity, EntityKind, Version};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Check if an error is a retryable SQLite busy/locked error.
///
/// Extended result codes (e.g. `SQLITE_BUSY_SNAPSHOT` = 517) carry the
/// primary code in their low byte.
pub fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            if let Some(code) = db_err.code().and_then(|c| c.parse::<i32>().ok()) {
                let primary = code & 0xff;
                return primary == SQLITE_BUSY || primary == SQLITE_LOCKED;
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Which uniqueness constraint a failed insert/update hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UniqueViolation {
    /// `(origin, modified)`: another row already holds this version.
    Version,
    /// `(key, origin)`: the natural key is taken.
    NaturalKey,
}

pub(crate) fn unique_violation(e: &sqlx::Error) -> Option<UniqueViolation> {
    let sqlx::Error::Database(db_err) = e else {
        return None;
    };
    let msg = db_err.message();
    if !(db_err.is_unique_violation() || msg.contains("UNIQUE constraint failed")) {
        return None;
    }
    if msg.contains(".modified") {
        Some(UniqueViolation::Version)
    } else {
        Some(UniqueViolation::NaturalKey)
    }
}

/// Execute a store operation, retrying on SQLITE_BUSY/SQLITE_LOCKED.
///
/// Each attempt must be a complete unit of work (typically one transaction).
pub async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(ReplicationError::Store(e))
                if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS =>
            {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_store_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if let ReplicationError::Store(inner) = &e {
                    if is_sqlite_busy_error(inner) {
                        warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                    }
                }
                return Err(e);
            }
        }
    }
}

/// Decode a stored row. The `modified` column is authoritative.
pub(crate) fn decode_row<E: Entity>(body: &str, modified: i64) -> Result<E> {
    let mut entity: E = serde_json::from_str(body).map_err(|e| {
        ReplicationError::Internal(format!("corrupt {} row: {}", E::KIND, e))
    })?;
    entity.set_modified(Version::from_micros(modified));
    Ok(entity)
}

pub(crate) fn encode_body<E: Entity>(entity: &E) -> Result<String> {
    serde_json::to_string(entity)
        .map_err(|e| ReplicationError::Internal(format!("cannot encode {}: {}", E::KIND, e)))
}

/// Shared SQLite pool plus the read side of the entity tables.
///
/// Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    path: String,
}

impl Store {
    /// Open (creating if needed) the database and its schema.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        info!(path = %config.sqlite_path, "Opening origin store");

        let url = if config.is_in_memory() {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", config.sqlite_path)
        };
        let journal = if config.wal_mode {
            sqlx::sqlite::SqliteJournalMode::Wal
        } else {
            sqlx::sqlite::SqliteJournalMode::Memory
        };

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout_duration())
            .create_if_missing(true);

        let mut pool_options = SqlitePoolOptions::new().max_connections(config.max_connections.max(1));
        if config.is_in_memory() {
            // The database lives and dies with its only connection.
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;

        let store = Self {
            pool,
            path: config.sqlite_path.clone(),
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// Fresh in-memory store.
    pub async fn in_memory() -> Result<Self> {
        Self::open(&StoreConfig::in_memory()).await
    }

    async fn init_schema(&self) -> Result<()> {
        for kind in EntityKind::ALL {
            let table = kind.table();
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    key TEXT NOT NULL,
                    origin TEXT NOT NULL,
                    modified INTEGER NOT NULL,
                    body TEXT NOT NULL,
                    UNIQUE(key, origin),
                    UNIQUE(origin, modified)
                )
                "#
            ))
            .execute(&self.pool)
            .await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replication_cursor (
                origin TEXT NOT NULL,
                kind TEXT NOT NULL,
                modified INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (origin, kind)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS origin_config (
                name TEXT PRIMARY KEY,
                body TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Fetch one row by wire key.
    pub async fn get<E: Entity>(&self, key: &str, origin: &str) -> Result<Option<E>> {
        let row = sqlx::query(&format!(
            "SELECT modified, body FROM {} WHERE key = ? AND origin = ?",
            E::KIND.table()
        ))
        .bind(key)
        .bind(origin)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let modified: i64 = row.try_get("modified")?;
                let body: String = row.try_get("body")?;
                Ok(Some(decode_row(&body, modified)?))
            }
            None => Ok(None),
        }
    }

    /// Rows of `origin` strictly newer than `after`, ascending, at most `limit`.
    pub async fn modified_after<E: Entity>(
        &self,
        origin: &str,
        after: Option<Version>,
        limit: usize,
    ) -> Result<Vec<E>> {
        let after = after.map(|v| v.as_micros()).unwrap_or(i64::MIN);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            "SELECT modified, body FROM {} WHERE origin = ? AND modified > ? ORDER BY modified ASC LIMIT ?",
            E::KIND.table()
        ))
        .bind(origin)
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let modified: i64 = row.try_get("modified")?;
                let body: String = row.try_get("body")?;
                decode_row(&body, modified)
            })
            .collect()
    }

    /// Newest version stored for `origin`.
    pub async fn max_modified(&self, kind: EntityKind, origin: &str) -> Result<Option<Version>> {
        let max: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT MAX(modified) FROM {} WHERE origin = ?",
            kind.table()
        ))
        .bind(origin)
        .fetch_one(&self.pool)
        .await?;
        Ok(max.map(Version::from_micros))
    }

    pub async fn count(&self, kind: EntityKind, origin: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE origin = ?",
            kind.table()
        ))
        .bind(origin)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("store_checkpoint", move || async move {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await?;
            Ok::<_, ReplicationError>(())
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Origin store closed");
    }
}
