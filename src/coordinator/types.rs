//! Engine state and per-cycle bookkeeping types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Running
//!    │                            │
//!    │ (store failed to open)     │ shutdown()
//!    ↓                            ↓
//! Failed                    ShuttingDown
//!                                 │
//!                                 ↓
//!                              Stopped
//! ```
//!
//! - **Created**: after `ReplicationEngine::new()`. Nothing opened.
//! - **Running**: store open, origins seeded, scheduler loops spawned (if enabled).
//! - **ShuttingDown**: loops told to stop, in-flight cycles draining.
//! - **Stopped**: pools closed, store checkpointed. Safe to drop.
//! - **Failed**: `start()` could not open the store.

use crate::circuit_breaker::CircuitSnapshot;
use crate::cursor::CursorEntry;
use crate::error::{ReplicationError, Result};
use crate::model::{EntityKind, Version};
use crate::pool::PoolStats;
use dashmap::DashSet;
use std::fmt;
use std::sync::Arc;

/// State of the replication engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// Replication direction. Each origin runs an independent state machine per
/// direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Pull,
    Push,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Pull => "pull",
            Direction::Push => "push",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one entity kind within a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindReport {
    pub kind: EntityKind,
    /// Records written (pull) or sent (push).
    pub applied: usize,
    /// Pulled records identical to the stored row.
    pub unchanged: usize,
    /// Newest version handled this cycle, or the starting cursor if none.
    pub cursor: Option<Version>,
    /// The page came back full, so more records are probably waiting.
    pub full: bool,
    pub error: Option<String>,
}

impl KindReport {
    pub fn new(kind: EntityKind, cursor: Option<Version>) -> Self {
        Self {
            kind,
            applied: 0,
            unchanged: 0,
            cursor,
            full: false,
            error: None,
        }
    }
}

/// Result of one pull or push cycle for one origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub origin: String,
    pub direction: Direction,
    pub kinds: Vec<KindReport>,
}

impl CycleReport {
    pub fn new(origin: impl Into<String>, direction: Direction) -> Self {
        Self {
            origin: origin.into(),
            direction,
            kinds: Vec::with_capacity(EntityKind::ALL.len()),
        }
    }

    pub fn kind(&self, kind: EntityKind) -> Option<&KindReport> {
        self.kinds.iter().find(|k| k.kind == kind)
    }

    pub fn total_applied(&self) -> usize {
        self.kinds.iter().map(|k| k.applied).sum()
    }

    pub fn failed_kinds(&self) -> usize {
        self.kinds.iter().filter(|k| k.error.is_some()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.failed_kinds() == 0
    }

    /// Whether a burst origin should go again straight away.
    pub fn has_more(&self) -> bool {
        self.kinds.iter().any(|k| k.full && k.error.is_none())
    }

    pub fn outcome(&self) -> &'static str {
        match self.failed_kinds() {
            0 => "ok",
            n if n == self.kinds.len() => "failed",
            _ => "partial",
        }
    }
}

/// Set of `(origin, direction)` pairs with a cycle in flight.
pub type ActiveCycles = Arc<DashSet<(String, Direction)>>;

/// Marks an `(origin, direction)` busy until dropped.
pub struct CycleGuard {
    active: ActiveCycles,
    key: (String, Direction),
}

impl CycleGuard {
    /// Fails with `CycleInProgress` if the pair is already running.
    pub fn acquire(active: &ActiveCycles, origin: &str, direction: Direction) -> Result<Self> {
        let key = (origin.to_string(), direction);
        if !active.insert(key.clone()) {
            return Err(ReplicationError::CycleInProgress {
                origin: origin.to_string(),
                direction: direction.as_str().to_string(),
            });
        }
        Ok(Self {
            active: Arc::clone(active),
            key,
        })
    }
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.active.remove(&self.key);
    }
}

/// Cheap health summary. Built from in-memory state only.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Running and accepting cycles.
    pub ready: bool,
    /// Ready and no origin's circuit is open.
    pub healthy: bool,
    pub origins_circuit_open: usize,
    pub cycles_in_flight: usize,
    pub bulkhead_available: usize,
    pub live_tunnels: usize,
}

/// Full diagnostics snapshot for an operator endpoint.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub health: HealthCheck,
    pub pools: Vec<PoolStats>,
    pub circuits: Vec<CircuitSnapshot>,
    pub cursors: Vec<CursorEntry>,
}
