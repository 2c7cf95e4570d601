// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! OpenSSH-backed tunnel connector.
//!
//! Session setup:
//!
//! 1. Multiplexed SSH session to `user@host:port`
//! 2. Banner negotiation: run the banner command on the remote and parse the
//!    HTTP port it reports (`port: 8081`, `port=8081` or a bare number)
//! 3. Bind a free local port and forward it to `127.0.0.1:<remote port>`
//!
//! Any failure after step 1 closes the session before the error is returned.

use super::tunnel::{TunnelConnector, TunnelSession};
use crate::config::TunnelConfig;
use crate::error::{ReplicationError, Result};
use crate::model::TunnelTarget;
use futures::future::BoxFuture;
use openssh::{ForwardType, KnownHosts, Session, SessionBuilder, Socket};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Parse the remote HTTP port out of a banner.
///
/// The first line that yields a non-zero port wins. Returns `None` if no
/// line does.
pub fn parse_banner_port(banner: &str) -> Option<u16> {
    banner.lines().find_map(|line| {
        let line = line.trim();
        let value = match line.split_once(|c: char| c == ':' || c == '=') {
            Some((key, value)) if key.trim().eq_ignore_ascii_case("port") => value.trim(),
            Some(_) => return None,
            None => line,
        };
        value.parse::<u16>().ok().filter(|p| *p != 0)
    })
}

pub struct OpensshConnector {
    settings: TunnelConfig,
}

impl OpensshConnector {
    pub fn new(settings: TunnelConfig) -> Self {
        Self { settings }
    }

    fn known_hosts(&self) -> KnownHosts {
        if self.settings.strict_host_keys {
            KnownHosts::Strict
        } else {
            KnownHosts::Accept
        }
    }

    async fn open(&self, target: &TunnelTarget) -> Result<Arc<dyn TunnelSession>> {
        let label = target.to_string();
        let mut builder = SessionBuilder::default();
        builder
            .user(target.user.clone())
            .port(target.port)
            .known_hosts_check(self.known_hosts())
            .connect_timeout(self.settings.connect_timeout_duration());
        if let Some(identity) = &self.settings.identity_file {
            builder.keyfile(identity);
        }

        let session = builder
            .connect_mux(&target.host)
            .await
            .map_err(|e| ReplicationError::tunnel(&label, "ssh connect failed", e))?;

        match self.negotiate(&session, &label).await {
            Ok(local_port) => {
                debug!(tunnel = %label, local_port, "SSH port forward established");
                Ok(Arc::new(OpensshSession {
                    local_port,
                    session: Mutex::new(Some(session)),
                    closed: AtomicBool::new(false),
                }))
            }
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    warn!(tunnel = %label, error = %close_err, "Failed to close SSH session after setup error");
                }
                Err(e)
            }
        }
    }

    async fn negotiate(&self, session: &Session, label: &str) -> Result<u16> {
        let output = session
            .command(&self.settings.banner_command)
            .output()
            .await
            .map_err(|e| ReplicationError::tunnel(label, "banner negotiation failed", e))?;
        let banner = String::from_utf8_lossy(&output.stdout);
        let remote_port = parse_banner_port(&banner).unwrap_or_else(|| {
            debug!(tunnel = %label, "No port in banner, using default");
            self.settings.default_remote_port
        });

        let local_port = free_local_port()
            .await
            .map_err(|e| ReplicationError::tunnel(label, "no free local port", e))?;

        let listen = Socket::from(SocketAddr::from((Ipv4Addr::LOCALHOST, local_port)));
        let connect = Socket::from(SocketAddr::from((Ipv4Addr::LOCALHOST, remote_port)));
        session
            .request_port_forward(ForwardType::Local, listen, connect)
            .await
            .map_err(|e| ReplicationError::tunnel(label, "port forward rejected", e))?;
        Ok(local_port)
    }
}

impl TunnelConnector for OpensshConnector {
    fn connect<'a>(&'a self, target: &'a TunnelTarget) -> BoxFuture<'a, Result<Arc<dyn TunnelSession>>> {
        Box::pin(self.open(target))
    }
}

async fn free_local_port() -> std::io::Result<u16> {
    let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    Ok(listener.local_addr()?.port())
}

struct OpensshSession {
    local_port: u16,
    session: Mutex<Option<Session>>,
    closed: AtomicBool,
}

impl TunnelSession for OpensshSession {
    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn check(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let guard = self.session.lock().await;
            let Some(session) = guard.as_ref() else {
                return Err(ReplicationError::tunnel_msg(self.local_port.to_string(), "session closed"));
            };
            session.check().await.map_err(|e| {
                self.closed.store(true, Ordering::Release);
                ReplicationError::tunnel(format!("127.0.0.1:{}", self.local_port), "health probe failed", e)
            })
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::Release);
            let taken = self.session.lock().await.take();
            if let Some(session) = taken {
                if let Err(e) = session.close().await {
                    warn!(local_port = self.local_port, error = %e, "Error closing SSH session");
                }
            }
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
