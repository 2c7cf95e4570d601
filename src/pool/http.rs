// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One bounded HTTP client per `(tenant, mode)`.
//!
//! `reqwest` keeps its own keep-alive pool per client; this wrapper adds the
//! per-route concurrency cap (a semaphore sized to the mode's connection
//! count) and the leased/available/pending counters the stats logger reads.

use super::PoolMode;
use crate::config::HttpConfig;
use crate::error::{ReplicationError, Result};
use std::ops::Deref;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Utilisation snapshot of one pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub tenant: String,
    pub mode: PoolMode,
    pub max: usize,
    pub leased: usize,
    pub available: usize,
    pub pending: usize,
}

pub struct HttpPool {
    tenant: String,
    mode: PoolMode,
    max: usize,
    settings: HttpConfig,
    client: RwLock<reqwest::Client>,
    permits: Arc<Semaphore>,
    counters: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    leased: AtomicUsize,
    pending: AtomicUsize,
    /// Millis since epoch of the last lease or return.
    last_used: AtomicI64,
}

impl Counters {
    fn touch(&self) {
        self.last_used
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

impl HttpPool {
    pub fn new(tenant: &str, mode: PoolMode, settings: &HttpConfig) -> Result<Self> {
        let max = mode.max_connections(settings);
        let client = build_client(max, settings)?;
        let counters = Counters::default();
        counters.touch();
        Ok(Self {
            tenant: tenant.to_string(),
            mode,
            max,
            settings: settings.clone(),
            client: RwLock::new(client),
            permits: Arc::new(Semaphore::new(max)),
            counters: Arc::new(counters),
        })
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn mode(&self) -> PoolMode {
        self.mode
    }

    /// Wait for a connection slot on this pool only.
    pub async fn lease(&self) -> Result<PooledClient> {
        self.counters.pending.fetch_add(1, Ordering::Relaxed);
        let permit = self.permits.clone().acquire_owned().await;
        self.counters.pending.fetch_sub(1, Ordering::Relaxed);
        let permit = permit.map_err(|_| ReplicationError::Shutdown)?;
        Ok(self.hand_out(permit))
    }

    /// Lease without waiting; `None` if every slot is taken.
    pub fn try_lease(&self) -> Option<PooledClient> {
        let permit = self.permits.clone().try_acquire_owned().ok()?;
        Some(self.hand_out(permit))
    }

    fn hand_out(&self, permit: OwnedSemaphorePermit) -> PooledClient {
        self.counters.leased.fetch_add(1, Ordering::Relaxed);
        self.counters.touch();
        let client = self
            .client
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        PooledClient {
            client,
            counters: Arc::clone(&self.counters),
            _permit: permit,
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            tenant: self.tenant.clone(),
            mode: self.mode,
            max: self.max,
            leased: self.counters.leased.load(Ordering::Relaxed),
            available: self.permits.available_permits(),
            pending: self.counters.pending.load(Ordering::Relaxed),
        }
    }

    /// Drop keep-alive connections of a pool nobody used for `idle`.
    ///
    /// Returns whether the client was recycled.
    pub fn close_idle(&self, idle: Duration) -> bool {
        if self.counters.leased.load(Ordering::Relaxed) > 0 {
            return false;
        }
        let last = self.counters.last_used.load(Ordering::Relaxed);
        let idle_ms = i64::try_from(idle.as_millis()).unwrap_or(i64::MAX);
        if chrono::Utc::now().timestamp_millis().saturating_sub(last) < idle_ms {
            return false;
        }
        match build_client(self.max, &self.settings) {
            Ok(fresh) => {
                *self.client.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = fresh;
                self.counters.touch();
                debug!(tenant = %self.tenant, mode = %self.mode, "Recycled idle HTTP pool");
                true
            }
            Err(_) => false,
        }
    }

    /// Stop handing out leases. Waiters get `Shutdown`.
    pub fn close(&self) {
        self.permits.close();
    }
}

fn build_client(max: usize, settings: &HttpConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(max)
        .pool_idle_timeout(settings.idle_timeout_duration())
        .connect_timeout(settings.connect_timeout_duration())
        .timeout(settings.request_timeout_duration())
        .user_agent(settings.user_agent.clone())
        .build()
        .map_err(|e| ReplicationError::Config(format!("cannot build HTTP client: {}", e)))
}

/// A leased client. The slot is returned on drop.
pub struct PooledClient {
    client: reqwest::Client,
    counters: Arc<Counters>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledClient {
    type Target = reqwest::Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        self.counters.leased.fetch_sub(1, Ordering::Relaxed);
        self.counters.touch();
    }
}
