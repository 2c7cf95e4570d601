// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection pool manager: per-tenant HTTP pools plus the SSH tunnel pool.
//!
//! # Traffic Classes
//!
//! | Mode | Slots | Use |
//! |------|-------|-----|
//! | [`PoolMode::Parallel`] | `max_connections_per_route` (4) | page fetches, pushes |
//! | [`PoolMode::Serial`] | 1 | calls whose order on the remote matters |
//!
//! Pools are created lazily with an atomic get-or-create on the map entry
//! and live for the process lifetime. Each pool has its own semaphore, so a
//! tenant that saturates its slots never delays another tenant.
//!
//! # Housekeeping
//!
//! [`ConnectionPools::housekeeping`] recycles idle pools;
//! [`ConnectionPools::log_stats`] reports leased/available/pending per pool.
//! The scheduler runs both on fixed periods.

mod http;
pub mod ssh;
pub mod tunnel;

pub use http::{HttpPool, PoolStats, PooledClient};
pub use tunnel::{TunnelConnector, TunnelLease, TunnelPool, TunnelSession};

use crate::config::{HttpConfig, TunnelConfig};
use crate::error::Result;
use crate::metrics;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Traffic class of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PoolMode {
    Parallel,
    Serial,
}

impl PoolMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolMode::Parallel => "parallel",
            PoolMode::Serial => "serial",
        }
    }

    pub fn max_connections(&self, settings: &HttpConfig) -> usize {
        match self {
            PoolMode::Parallel => settings.max_connections_per_route.max(1),
            PoolMode::Serial => 1,
        }
    }
}

impl fmt::Display for PoolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub tenant: String,
    pub mode: PoolMode,
}

/// All outbound connection state of the process.
#[derive(Clone)]
pub struct ConnectionPools {
    settings: HttpConfig,
    pools: Arc<DashMap<PoolKey, Arc<HttpPool>>>,
    tunnels: TunnelPool,
}

impl ConnectionPools {
    /// Pools whose tunnels are opened with OpenSSH.
    pub fn new(http: HttpConfig, tunnel: TunnelConfig) -> Self {
        let grace = tunnel.release_grace_duration();
        Self::with_connector(http, Arc::new(ssh::OpensshConnector::new(tunnel)), grace)
    }

    pub fn with_connector(http: HttpConfig, connector: Arc<dyn TunnelConnector>, grace: std::time::Duration) -> Self {
        Self {
            settings: http,
            pools: Arc::new(DashMap::new()),
            tunnels: TunnelPool::new(connector, grace),
        }
    }

    /// The pool for `(tenant, mode)`, created on first use.
    pub fn http(&self, tenant: &str, mode: PoolMode) -> Result<Arc<HttpPool>> {
        let key = PoolKey {
            tenant: tenant.to_string(),
            mode,
        };
        if let Some(pool) = self.pools.get(&key) {
            return Ok(Arc::clone(pool.value()));
        }
        let pool = self
            .pools
            .entry(key)
            .or_try_insert_with(|| {
                let pool = HttpPool::new(tenant, mode, &self.settings)?;
                metrics::record_pool_created(tenant, mode.as_str());
                debug!(tenant, %mode, "Created HTTP pool");
                Ok::<_, crate::error::ReplicationError>(Arc::new(pool))
            })?
            .clone();
        Ok(pool)
    }

    pub fn tunnels(&self) -> &TunnelPool {
        &self.tunnels
    }

    /// Recycle pools idle longer than the configured idle timeout.
    pub fn housekeeping(&self) -> usize {
        let idle = self.settings.idle_timeout_duration();
        let recycled = self.pools.iter().filter(|p| p.value().close_idle(idle)).count();
        if recycled > 0 {
            debug!(recycled, "HTTP pool housekeeping");
        }
        recycled
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self.pools.iter().map(|p| p.value().stats()).collect();
        stats.sort_by(|a, b| (&a.tenant, a.mode).cmp(&(&b.tenant, b.mode)));
        stats
    }

    /// Log and export utilisation of every pool.
    pub fn log_stats(&self) {
        for s in self.stats() {
            metrics::record_pool_stats(&s.tenant, s.mode.as_str(), s.leased, s.available, s.pending);
            info!(
                tenant = %s.tenant,
                mode = %s.mode,
                leased = s.leased,
                available = s.available,
                pending = s.pending,
                "HTTP pool stats"
            );
        }
        metrics::set_live_tunnels(self.tunnels.live_count());
    }

    /// Stop handing out leases and close every tunnel.
    pub async fn shutdown(&self) {
        for pool in self.pools.iter() {
            pool.value().close();
        }
        self.tunnels.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pools() -> ConnectionPools {
        ConnectionPools::new(HttpConfig::default(), TunnelConfig::default())
    }

    #[test]
    fn test_pool_mode_sizes() {
        let settings = HttpConfig::default();
        assert_eq!(PoolMode::Parallel.max_connections(&settings), 4);
        assert_eq!(PoolMode::Serial.max_connections(&settings), 1);
        assert_eq!(PoolMode::Serial.to_string(), "serial");
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_pool() {
        let pools = pools();
        let a = pools.http("@a", PoolMode::Parallel).unwrap();
        let again = pools.http("@a", PoolMode::Parallel).unwrap();
        let serial = pools.http("@a", PoolMode::Serial).unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &serial));
        assert_eq!(pools.stats().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_first_use_creates_one_pool() {
        let pools = pools();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let pools = pools.clone();
                tokio::spawn(async move { pools.http("@race", PoolMode::Parallel).unwrap() })
            })
            .collect();
        let mut created = Vec::new();
        for h in handles {
            created.push(h.await.unwrap());
        }
        assert!(created.iter().all(|p| Arc::ptr_eq(p, &created[0])));
        assert_eq!(pools.stats().len(), 1);
    }

    #[tokio::test]
    async fn test_tenant_isolation() {
        let pools = pools();
        let a = pools.http("@a", PoolMode::Parallel).unwrap();
        let _held: Vec<_> = (0..4).map(|_| a.try_lease().unwrap()).collect();

        let b = pools.http("@b", PoolMode::Parallel).unwrap();
        let lease = tokio::time::timeout(Duration::from_millis(100), b.lease()).await;
        assert!(lease.is_ok(), "tenant b must not wait on tenant a");

        let stats = pools.stats();
        assert_eq!(stats[0].tenant, "@a");
        assert_eq!(stats[0].available, 0);
        pools.log_stats();
    }

    #[tokio::test]
    async fn test_housekeeping_recycles_idle() {
        let mut http = HttpConfig::default();
        http.idle_timeout = "0s".to_string();
        let pools = ConnectionPools::new(http, TunnelConfig::default());
        pools.http("@a", PoolMode::Parallel).unwrap();
        assert_eq!(pools.housekeeping(), 1);
    }
}
