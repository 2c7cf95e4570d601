// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP client for a remote origin's replication endpoints.
//!
//! | Call | Request |
//! |------|---------|
//! | [`fetch_page`](RemoteClient::fetch_page) | `GET {base}/pub/api/v1/repl/{kind}?origin=&size=[&modifiedAfter=]` |
//! | [`fetch_cursor`](RemoteClient::fetch_cursor) | `GET {base}/pub/api/v1/repl/{kind}/cursor?origin=` |
//! | [`push_batch`](RemoteClient::push_batch) | `POST {base}/pub/api/v1/repl/{kind}?origin=` |
//!
//! Reads lease from the tenant's parallel pool; pushes go through the
//! serial pool so batches land on the remote in the order they were sent.
//! Every call runs through the origin's circuit breaker.

use crate::circuit_breaker::RemoteCircuits;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::model::{Entity, EntityKind, Origin, Version};
use crate::pool::{ConnectionPools, PoolMode, TunnelLease};
use serde::de::DeserializeOwned;
use std::time::Instant;
use tracing::debug;

pub const REPL_PATH: &str = "/pub/api/v1/repl";

/// A resolved remote for the duration of one cycle.
///
/// Holds the tunnel lease (if any) so the tunnel stays up until the cycle
/// ends.
pub struct RemoteEndpoint {
    pub origin: String,
    pub base_url: String,
    /// Pool tenant, the local tag the origin's rows are stored under.
    pub tenant: String,
    /// Origin tag on the remote side.
    pub remote_tag: String,
    tunnel: Option<TunnelLease>,
}

impl RemoteEndpoint {
    pub fn is_tunnelled(&self) -> bool {
        self.tunnel.is_some()
    }

    fn url(&self, kind: EntityKind, suffix: &str) -> String {
        format!("{}{}/{}{}", self.base_url, REPL_PATH, kind.path(), suffix)
    }
}

#[derive(Clone)]
pub struct RemoteClient {
    pools: ConnectionPools,
    circuits: RemoteCircuits,
}

impl RemoteClient {
    pub fn new(pools: ConnectionPools, circuits: RemoteCircuits) -> Self {
        Self { pools, circuits }
    }

    pub fn pools(&self) -> &ConnectionPools {
        &self.pools
    }

    pub fn circuits(&self) -> &RemoteCircuits {
        &self.circuits
    }

    /// Resolve the base URL: the tunnel if configured, else proxy or url.
    pub async fn connect(&self, origin: &Origin) -> Result<RemoteEndpoint> {
        let (base_url, tunnel) = match &origin.tunnel {
            Some(target) => {
                let lease = self.pools.tunnels().acquire(target).await?;
                (lease.base_url(), Some(lease))
            }
            None => (origin.base_url().to_string(), None),
        };
        if base_url.is_empty() {
            return Err(ReplicationError::Config(format!("origin {} has no url", origin.name)));
        }
        Ok(RemoteEndpoint {
            origin: origin.name.clone(),
            base_url,
            tenant: origin.local.clone(),
            remote_tag: origin.remote.clone(),
            tunnel,
        })
    }

    /// One page of records newer than `after`, ascending by `modified`.
    pub async fn fetch_page<E: Entity>(
        &self,
        ep: &RemoteEndpoint,
        after: Option<Version>,
        size: usize,
    ) -> Result<Vec<E>> {
        let url = ep.url(E::KIND, "");
        let mut query = vec![("origin", ep.remote_tag.clone()), ("size", size.to_string())];
        if let Some(after) = after {
            query.push(("modifiedAfter", after.to_string()));
        }

        let started = Instant::now();
        let page: Vec<E> = self
            .circuits
            .call(&ep.origin, || async {
                let client = self.pools.http(&ep.tenant, PoolMode::Parallel)?.lease().await?;
                let response = client
                    .get(&url)
                    .query(&query)
                    .send()
                    .await
                    .map_err(|e| ReplicationError::http(&ep.origin, e))?;
                read_json(&ep.origin, &url, response).await
            })
            .await?;
        metrics::record_remote_latency(&ep.origin, "fetch_page", started.elapsed());
        debug!(origin = %ep.origin, kind = %E::KIND, records = page.len(), "Fetched page");
        Ok(page)
    }

    /// The remote's newest version for its side of the origin pair.
    pub async fn fetch_cursor(&self, ep: &RemoteEndpoint, kind: EntityKind) -> Result<Option<Version>> {
        let url = ep.url(kind, "/cursor");
        let started = Instant::now();
        let cursor: Option<Version> = self
            .circuits
            .call(&ep.origin, || async {
                let client = self.pools.http(&ep.tenant, PoolMode::Parallel)?.lease().await?;
                let response = client
                    .get(&url)
                    .query(&[("origin", ep.remote_tag.as_str())])
                    .send()
                    .await
                    .map_err(|e| ReplicationError::http(&ep.origin, e))?;
                read_json(&ep.origin, &url, response).await
            })
            .await?;
        metrics::record_remote_latency(&ep.origin, "fetch_cursor", started.elapsed());
        Ok(cursor)
    }

    /// Send a batch for the remote to apply through its trusted path.
    pub async fn push_batch<E: Entity>(&self, ep: &RemoteEndpoint, batch: &[E]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let url = ep.url(E::KIND, "");
        let started = Instant::now();
        self.circuits
            .call(&ep.origin, || async {
                let client = self.pools.http(&ep.tenant, PoolMode::Serial)?.lease().await?;
                let response = client
                    .post(&url)
                    .query(&[("origin", ep.remote_tag.as_str())])
                    .json(batch)
                    .send()
                    .await
                    .map_err(|e| ReplicationError::http(&ep.origin, e))?;
                check_status(&ep.origin, &url, &response)?;
                Ok(())
            })
            .await?;
        metrics::record_remote_latency(&ep.origin, "push_batch", started.elapsed());
        debug!(origin = %ep.origin, kind = %E::KIND, records = batch.len(), "Pushed batch");
        Ok(())
    }
}

fn check_status(origin: &str, url: &str, response: &reqwest::Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(ReplicationError::Remote {
            origin: origin.to_string(),
            url: url.to_string(),
            status: status.as_u16(),
        })
    }
}

async fn read_json<T: DeserializeOwned>(origin: &str, url: &str, response: reqwest::Response) -> Result<T> {
    check_status(origin, url, &response)?;
    let body = response
        .bytes()
        .await
        .map_err(|e| ReplicationError::http(origin, e))?;
    serde_json::from_slice(&body).map_err(|e| ReplicationError::Parse {
        origin: origin.to_string(),
        message: format!("{}: {}", url, e),
    })
}
