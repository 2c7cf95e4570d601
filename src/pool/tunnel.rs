// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reference-counted SSH tunnel pool.
//!
//! At most one live session per `(user, host, port)`. Every transition goes
//! through the entry table:
//!
//! ```text
//! acquire ──► entry live? ──yes──► refs += 1 (under the shard lock)
//!                 │
//!                 no ──► per-target gate ──► connect ──► insert (refs = 1)
//!
//! release ──► refs -= 1 ──► 0? ──► after grace: remove_if(same entry, refs == 0)
//!
//! health  ──► probe ──► failed? ──► remove_if(same entry) ──► close
//! ```
//!
//! Removal always compares the entry by pointer, so a release or health
//! check that lost a race against a reconnect never evicts the new session.

use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::model::TunnelTarget;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// An established session with a local port forwarded to the remote origin.
pub trait TunnelSession: Send + Sync + 'static {
    /// Local port the remote HTTP endpoint is reachable on.
    fn local_port(&self) -> u16;

    /// Protocol-level liveness probe.
    fn check(&self) -> BoxFuture<'_, Result<()>>;

    /// Tear the session down. Idempotent.
    fn close(&self) -> BoxFuture<'_, ()>;

    fn is_closed(&self) -> bool;
}

/// Opens sessions. A failed connect must leave nothing running behind.
pub trait TunnelConnector: Send + Sync + 'static {
    fn connect<'a>(&'a self, target: &'a TunnelTarget) -> BoxFuture<'a, Result<Arc<dyn TunnelSession>>>;
}

struct TunnelEntry {
    session: Arc<dyn TunnelSession>,
    refs: AtomicUsize,
}

struct Inner {
    connector: Arc<dyn TunnelConnector>,
    entries: DashMap<TunnelTarget, Arc<TunnelEntry>>,
    gates: DashMap<TunnelTarget, Arc<tokio::sync::Mutex<()>>>,
    grace: Duration,
}

impl Inner {
    /// Take a reference on a live entry while holding the shard lock, so a
    /// concurrent `remove_if` sees the new count.
    fn reuse(&self, target: &TunnelTarget) -> Option<Arc<TunnelEntry>> {
        let entry = self.entries.get(target)?;
        if entry.session.is_closed() {
            return None;
        }
        entry.refs.fetch_add(1, Ordering::AcqRel);
        Some(Arc::clone(entry.value()))
    }

    async fn evict_if_unused(&self, target: &TunnelTarget, expected: &Arc<TunnelEntry>) {
        let removed = self
            .entries
            .remove_if(target, |_, e| Arc::ptr_eq(e, expected) && e.refs.load(Ordering::Acquire) == 0);
        if let Some((_, entry)) = removed {
            entry.session.close().await;
            metrics::record_tunnel_event("released");
            metrics::set_live_tunnels(self.entries.len());
            debug!(tunnel = %target, "Closed unused tunnel after grace period");
        }
    }

    async fn evict(&self, target: &TunnelTarget, expected: &Arc<TunnelEntry>) -> bool {
        let removed = self.entries.remove_if(target, |_, e| Arc::ptr_eq(e, expected));
        match removed {
            Some((_, entry)) => {
                entry.session.close().await;
                metrics::record_tunnel_event("evicted");
                metrics::set_live_tunnels(self.entries.len());
                true
            }
            None => false,
        }
    }
}

#[derive(Clone)]
pub struct TunnelPool {
    inner: Arc<Inner>,
}

impl TunnelPool {
    pub fn new(connector: Arc<dyn TunnelConnector>, grace: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                entries: DashMap::new(),
                gates: DashMap::new(),
                grace,
            }),
        }
    }

    /// Lease the tunnel for `target`, opening it if needed.
    pub async fn acquire(&self, target: &TunnelTarget) -> Result<TunnelLease> {
        if let Some(entry) = self.inner.reuse(target) {
            metrics::record_tunnel_event("reused");
            return Ok(self.lease(target, entry));
        }

        let gate = self.inner.gates.entry(target.clone()).or_default().clone();
        let _connecting = gate.lock().await;

        if let Some(entry) = self.inner.reuse(target) {
            metrics::record_tunnel_event("reused");
            return Ok(self.lease(target, entry));
        }

        // A closed session may still sit in the table until the next health
        // check; it is replaced below.
        let session = match self.inner.connector.connect(target).await {
            Ok(session) => session,
            Err(e) => {
                metrics::record_tunnel_event("failed");
                warn!(tunnel = %target, error = %e, "Tunnel setup failed");
                return Err(match e {
                    e @ ReplicationError::Tunnel { .. } => e,
                    other => ReplicationError::tunnel(target.to_string(), "tunnel setup failed", other),
                });
            }
        };

        let entry = Arc::new(TunnelEntry {
            session,
            refs: AtomicUsize::new(1),
        });
        if let Some(stale) = self.inner.entries.insert(target.clone(), Arc::clone(&entry)) {
            stale.session.close().await;
        }
        metrics::record_tunnel_event("opened");
        metrics::set_live_tunnels(self.inner.entries.len());
        info!(tunnel = %target, local_port = entry.session.local_port(), "Opened SSH tunnel");
        Ok(self.lease(target, entry))
    }

    fn lease(&self, target: &TunnelTarget, entry: Arc<TunnelEntry>) -> TunnelLease {
        TunnelLease {
            inner: Arc::clone(&self.inner),
            target: target.clone(),
            entry,
        }
    }

    /// Probe every session; evict the closed or unresponsive ones.
    ///
    /// Returns the number of evicted sessions.
    pub async fn health_check(&self) -> usize {
        let snapshot: Vec<(TunnelTarget, Arc<TunnelEntry>)> = self
            .inner
            .entries
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut evicted = 0;
        for (target, entry) in snapshot {
            let healthy = !entry.session.is_closed() && entry.session.check().await.is_ok();
            if !healthy && self.inner.evict(&target, &entry).await {
                warn!(tunnel = %target, refs = entry.refs.load(Ordering::Acquire), "Evicted unhealthy tunnel");
                evicted += 1;
            }
        }
        evicted
    }

    pub fn live_count(&self) -> usize {
        self.inner.entries.len()
    }

    /// Current reference count for `target` (0 if absent).
    pub fn refs(&self, target: &TunnelTarget) -> usize {
        self.inner
            .entries
            .get(target)
            .map(|e| e.refs.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Close every session regardless of leases.
    pub async fn shutdown(&self) {
        let targets: Vec<TunnelTarget> = self.inner.entries.iter().map(|e| e.key().clone()).collect();
        for target in targets {
            if let Some((_, entry)) = self.inner.entries.remove(&target) {
                entry.session.close().await;
            }
        }
        self.inner.gates.clear();
        metrics::set_live_tunnels(0);
        info!("Tunnel pool shut down");
    }
}

/// A reference on a pooled tunnel. Dropping it releases the reference.
pub struct TunnelLease {
    inner: Arc<Inner>,
    target: TunnelTarget,
    entry: Arc<TunnelEntry>,
}

impl TunnelLease {
    pub fn local_port(&self) -> u16 {
        self.entry.session.local_port()
    }

    pub fn target(&self) -> &TunnelTarget {
        &self.target
    }

    /// Base URL of the remote HTTP endpoint through the tunnel.
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.local_port())
    }
}

impl std::fmt::Debug for TunnelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelLease")
            .field("target", &self.target)
            .field("local_port", &self.local_port())
            .field("refs", &self.entry.refs.load(Ordering::Acquire))
            .finish()
    }
}

impl Drop for TunnelLease {
    fn drop(&mut self) {
        if self.entry.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let target = self.target.clone();
        let entry = Arc::clone(&self.entry);
        handle.spawn(async move {
            tokio::time::sleep(inner.grace).await;
            inner.evict_if_unused(&target, &entry).await;
        });
    }
}
