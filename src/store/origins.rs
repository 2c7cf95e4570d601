// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Origin configuration records.
//!
//! Stored as JSON bodies keyed by name. The engine re-reads an origin at the
//! start of every cycle, so edits take effect on the next cycle without a
//! restart.

use super::{execute_with_retry, Store};
use crate::error::{ReplicationError, Result};
use crate::model::Origin;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use tracing::{debug, info};

#[derive(Clone)]
pub struct OriginStore {
    pool: SqlitePool,
    local_origin: Option<String>,
}

impl OriginStore {
    pub fn new(store: &Store) -> Self {
        Self {
            pool: store.pool().clone(),
            local_origin: None,
        }
    }

    /// Refuse pulling origins whose `local` tag is this instance's own tenant.
    pub fn with_local_origin(mut self, local_origin: impl Into<String>) -> Self {
        self.local_origin = Some(local_origin.into());
        self
    }

    /// Insert or replace an origin record.
    pub async fn upsert(&self, origin: &Origin) -> Result<()> {
        if origin.name.is_empty() {
            return Err(ReplicationError::Config("origin name must not be empty".to_string()));
        }
        if let Some(local) = &self.local_origin {
            check_not_local(origin, local)?;
        }
        let body = serde_json::to_string(origin)
            .map_err(|e| ReplicationError::Internal(format!("cannot encode origin {}: {}", origin.name, e)))?;
        let (pool, name, body) = (&self.pool, origin.name.as_str(), body.as_str());
        execute_with_retry("origin_upsert", move || async move {
            sqlx::query(
                "INSERT INTO origin_config (name, body) VALUES (?, ?) \
                 ON CONFLICT(name) DO UPDATE SET body = excluded.body",
            )
            .bind(name)
            .bind(body)
            .execute(pool)
            .await?;
            Ok::<_, ReplicationError>(())
        })
        .await?;
        debug!(origin = name, "Stored origin");
        Ok(())
    }

    /// Upsert a configured origin, keeping the stored sync bookkeeping.
    pub async fn seed(&self, origin: &Origin) -> Result<()> {
        let mut merged = origin.clone();
        if let Some(existing) = self.get(&origin.name).await? {
            merged.last_pull = merged.last_pull.or(existing.last_pull);
            merged.last_push = merged.last_push.or(existing.last_push);
        }
        self.upsert(&merged).await?;
        info!(origin = %origin.name, url = %origin.url, "Seeded origin from configuration");
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<Option<Origin>> {
        let body: Option<String> = sqlx::query_scalar("SELECT body FROM origin_config WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        body.map(|b| decode(name, &b)).transpose()
    }

    pub async fn list(&self) -> Result<Vec<Origin>> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT name, body FROM origin_config ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|(name, body)| decode(name, body)).collect()
    }

    /// Returns whether a record was removed.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let pool = &self.pool;
        let removed = execute_with_retry("origin_delete", move || async move {
            let result = sqlx::query("DELETE FROM origin_config WHERE name = ?")
                .bind(name)
                .execute(pool)
                .await?;
            Ok::<_, ReplicationError>(result.rows_affected())
        })
        .await?;
        Ok(removed > 0)
    }

    pub async fn record_pull(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
        self.touch(name, |o| o.last_pull = Some(at)).await
    }

    pub async fn record_push(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
        self.touch(name, |o| o.last_push = Some(at)).await
    }

    async fn touch(&self, name: &str, apply: impl FnOnce(&mut Origin)) -> Result<()> {
        let Some(mut origin) = self.get(name).await? else {
            return Err(ReplicationError::Config(format!("unknown origin {}", name)));
        };
        apply(&mut origin);
        self.upsert(&origin).await
    }
}

/// A pulling origin tagged with the author tenant would overwrite local rows.
pub(crate) fn check_not_local(origin: &Origin, local_origin: &str) -> Result<()> {
    if origin.pulls() && origin.local == local_origin {
        return Err(ReplicationError::Config(format!(
            "origin {} pulls into the local tenant {:?}; set a distinct `local` tag",
            origin.name, local_origin
        )));
    }
    Ok(())
}

fn decode(name: &str, body: &str) -> Result<Origin> {
    serde_json::from_str(body)
        .map_err(|e| ReplicationError::Internal(format!("corrupt origin record {}: {}", name, e)))
}
