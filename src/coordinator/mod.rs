// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine coordinator.
//!
//! Ties together:
//! - The origin store and its [`VersionSequencer`]
//! - Cursor persistence via [`CursorStore`]
//! - Remote access via [`RemoteClient`] (pooled HTTP, SSH tunnels, per-origin
//!   circuit breakers)
//! - The scheduler loops and the bulkhead that bounds them
//!
//! # Architecture
//!
//! ```text
//!   scheduler (pull loop) ──┐
//!   scheduler (push loop) ──┼──► run_cycle ──► CycleGuard ──► Bulkhead ──► pull / push
//!   engine.pull / push  ────┘                                               │
//!                                                                           ▼
//!                                          RemoteClient ◄──── per kind ────► VersionSequencer
//! ```
//!
//! Different origins replicate concurrently; the same origin and direction
//! never overlaps.

mod pull;
mod push;
mod scheduler;
mod types;

pub use types::{
    ActiveCycles, CycleGuard, CycleReport, Diagnostics, Direction, EngineState, HealthCheck, KindReport,
};

use crate::circuit_breaker::RemoteCircuits;
use crate::config::ReplicationConfig;
use crate::cursor::CursorStore;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::model::{Clock, Origin, SystemClock};
use crate::pool::ConnectionPools;
use crate::remote::RemoteClient;
use crate::resilience::{Bulkhead, RateLimiter};
use crate::store::{Hooks, OriginStore, Store, VersionSequencer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors after which the remaining kinds of a cycle are not attempted.
fn aborts_cycle(e: &ReplicationError) -> bool {
    matches!(
        e,
        ReplicationError::Http { .. }
            | ReplicationError::Tunnel { .. }
            | ReplicationError::CircuitOpen(_)
            | ReplicationError::Shutdown
    )
}

/// Everything a running cycle needs. Built by [`ReplicationEngine::start`].
pub struct ReplicationContext {
    config: ReplicationConfig,
    store: Store,
    sequencer: VersionSequencer,
    cursors: CursorStore,
    origins: OriginStore,
    remote: RemoteClient,
    bulkhead: Bulkhead,
    rate_limiter: Option<Arc<RateLimiter>>,
    active: ActiveCycles,
    shutdown_rx: watch::Receiver<bool>,
}

impl ReplicationContext {
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn sequencer(&self) -> &VersionSequencer {
        &self.sequencer
    }

    pub fn cursors(&self) -> &CursorStore {
        &self.cursors
    }

    pub fn origins(&self) -> &OriginStore {
        &self.origins
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }
}

/// The main replication engine.
///
/// Owns the lifecycle: [`start`](Self::start) opens the store and spawns the
/// background loops, [`shutdown`](Self::shutdown) drains them. Manual
/// [`pull`](Self::pull) / [`push`](Self::push) go through the same guard and
/// bulkhead as scheduled cycles.
pub struct ReplicationEngine {
    config: ReplicationConfig,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    hooks: Hooks,
    clock: Arc<dyn Clock>,
    pools: ConnectionPools,
    circuits: RemoteCircuits,
    bulkhead: Bulkhead,
    active: ActiveCycles,

    /// Set once `start()` has opened the store.
    context: RwLock<Option<Arc<ReplicationContext>>>,

    /// Background task handles
    handles: RwLock<Vec<JoinHandle<()>>>,
}

impl ReplicationEngine {
    /// Create an engine in `Created` state. Nothing is opened until
    /// [`start()`](Self::start).
    pub fn new(config: ReplicationConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let settings = &config.settings;
        let pools = ConnectionPools::new(settings.http.clone(), settings.tunnel.clone());
        let circuits = RemoteCircuits::new(settings.circuit.to_circuit_config());
        let bulkhead = Bulkhead::new(settings.schedule.max_concurrent_cycles);

        Self {
            config,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            hooks: Hooks::default(),
            clock: Arc::new(SystemClock),
            pools,
            circuits,
            bulkhead,
            active: ActiveCycles::default(),
            context: RwLock::new(None),
            handles: RwLock::new(Vec::new()),
        }
    }

    /// Collaborator hooks for the sequencer (validation, metadata, publish).
    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the connection pools (e.g. with a custom tunnel connector).
    pub fn with_pools(mut self, pools: ConnectionPools) -> Self {
        self.pools = pools;
        self
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn local_origin(&self) -> &str {
        &self.config.local_origin
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    pub fn pools(&self) -> &ConnectionPools {
        &self.pools
    }

    pub fn circuits(&self) -> &RemoteCircuits {
        &self.circuits
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }

    /// The running context.
    ///
    /// Fails with `InvalidState` before `start()` and `Shutdown` after
    /// `shutdown()`.
    pub async fn context(&self) -> Result<Arc<ReplicationContext>> {
        match self.context.read().await.as_ref() {
            Some(ctx) if !*self.shutdown_rx.borrow() => Ok(Arc::clone(ctx)),
            Some(_) => Err(ReplicationError::Shutdown),
            None => Err(ReplicationError::InvalidState {
                expected: "Running".to_string(),
                actual: self.state().to_string(),
            }),
        }
    }

    /// Start the engine.
    ///
    /// 1. Opens the store (schema created if missing)
    /// 2. Upserts the configured origins, keeping their bookkeeping
    /// 3. Spawns housekeeping and, if enabled, the pull and push schedules
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            local_origin = %self.config.local_origin,
            origins = self.config.origins.len(),
            "Starting replication engine"
        );

        let store = match Store::open(&self.config.store).await {
            Ok(store) => store,
            Err(e) => {
                error!(error = %e, path = %self.config.store.sqlite_path, "Failed to open store");
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        };

        let origins = OriginStore::new(&store).with_local_origin(self.config.local_origin.clone());
        for origin in &self.config.origins {
            if let Err(e) = origins.seed(origin).await {
                error!(origin = %origin.name, error = %e, "Failed to seed origin");
                store.close().await;
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        }

        let rate_limiter = self.config.settings.schedule.rate_limit_config().map(|cfg| {
            info!(
                rate_per_sec = cfg.refill_rate,
                burst = cfg.burst_size,
                "Rate limiting enabled for pulled records"
            );
            Arc::new(RateLimiter::new(cfg))
        });

        let sequencer = VersionSequencer::new(store.clone(), self.config.settings.sequencer.max_attempts)
            .with_clock(Arc::clone(&self.clock))
            .with_hooks(self.hooks.clone());

        let ctx = Arc::new(ReplicationContext {
            config: self.config.clone(),
            cursors: CursorStore::new(&store),
            sequencer,
            origins,
            store,
            remote: RemoteClient::new(self.pools.clone(), self.circuits.clone()),
            bulkhead: self.bulkhead.clone(),
            rate_limiter,
            active: Arc::clone(&self.active),
            shutdown_rx: self.shutdown_rx.clone(),
        });
        *self.context.write().await = Some(Arc::clone(&ctx));

        let mut handles = self.handles.write().await;
        handles.push(tokio::spawn(scheduler::run_housekeeping(
            Arc::clone(&ctx),
            self.shutdown_rx.clone(),
        )));

        let schedule = &self.config.settings.schedule;
        if schedule.enabled {
            handles.push(tokio::spawn(scheduler::run_schedule(
                Arc::clone(&ctx),
                Direction::Pull,
                schedule.pull_interval_duration(),
                self.shutdown_rx.clone(),
            )));
            handles.push(tokio::spawn(scheduler::run_schedule(
                Arc::clone(&ctx),
                Direction::Push,
                schedule.push_interval_duration(),
                self.shutdown_rx.clone(),
            )));
        } else {
            debug!("Replication schedule disabled, cycles run on demand only");
        }
        drop(handles);

        self.set_state(EngineState::Running);
        info!(scheduled = schedule.enabled, "Replication engine running");
        Ok(())
    }

    /// Pull one origin now.
    pub async fn pull(&self, origin: &str) -> Result<CycleReport> {
        self.run_now(origin, Direction::Pull).await
    }

    /// Push to one origin now.
    pub async fn push(&self, origin: &str) -> Result<CycleReport> {
        self.run_now(origin, Direction::Push).await
    }

    async fn run_now(&self, name: &str, direction: Direction) -> Result<CycleReport> {
        let ctx = self.context().await?;
        let origin = ctx
            .origins
            .get(name)
            .await?
            .ok_or_else(|| ReplicationError::Config(format!("unknown origin {}", name)))?;
        let enabled = match direction {
            Direction::Pull => origin.pulls(),
            Direction::Push => origin.pushes(),
        };
        if !enabled {
            return Err(ReplicationError::Config(format!(
                "origin {} has {} disabled",
                name, direction
            )));
        }
        scheduler::run_cycle(&ctx, &origin, direction).await
    }

    /// Add or replace an origin record.
    pub async fn upsert_origin(&self, origin: &Origin) -> Result<()> {
        self.context().await?.origins.upsert(origin).await
    }

    /// Remove an origin record and forget its circuit breaker.
    ///
    /// Cursors are kept; a re-added origin resumes where it left off.
    pub async fn remove_origin(&self, name: &str) -> Result<bool> {
        let removed = self.context().await?.origins.delete(name).await?;
        if removed {
            self.circuits.forget(name);
        }
        Ok(removed)
    }

    /// Health summary for readiness probes.
    ///
    /// **Performance**: no network or store I/O; reads atomics and maps only.
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let origins_circuit_open = self.circuits.snapshot().iter().filter(|c| c.likely_open).count();
        let ready = state == EngineState::Running;
        HealthCheck {
            state,
            ready,
            healthy: ready && origins_circuit_open == 0,
            origins_circuit_open,
            cycles_in_flight: self.active.len(),
            bulkhead_available: self.bulkhead.available(),
            live_tunnels: self.pools.tunnels().live_count(),
        }
    }

    /// Health plus pool, circuit and cursor snapshots.
    pub async fn diagnostics(&self) -> Result<Diagnostics> {
        let cursors = match self.context().await {
            Ok(ctx) => ctx.cursors.get_all().await?,
            Err(_) => Vec::new(),
        };
        Ok(Diagnostics {
            health: self.health_check(),
            pools: self.pools.stats(),
            circuits: self.circuits.snapshot(),
            cursors,
        })
    }

    /// Shutdown the engine gracefully.
    ///
    /// 1. Signal loops and in-flight cycles to stop
    /// 2. Wait for loops to exit (bounded)
    /// 3. Close HTTP pools and tunnels
    /// 4. Checkpoint and close the store
    pub async fn shutdown(&mut self) {
        info!("Shutting down replication engine");
        self.set_state(EngineState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.handles.write().await;
            std::mem::take(&mut *guard)
        };
        if !handles.is_empty() {
            info!(task_count = handles.len(), "Waiting for background tasks");
        }
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }

        self.bulkhead.close();
        self.pools.shutdown().await;

        if let Some(ctx) = self.context.write().await.take() {
            if let Err(e) = ctx.store.checkpoint().await {
                warn!(error = %e, "WAL checkpoint failed on shutdown");
            }
            ctx.store.close().await;
        }

        self.set_state(EngineState::Stopped);
        info!("Replication engine stopped");
    }
}
