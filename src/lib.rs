//! # Origin Replication
//!
//! Versioned storage and pull/push replication for a federated, multi-tenant
//! content store. Every tenant ("origin") keeps its own copy of five entity
//! kinds and synchronizes with partners over HTTP, optionally through SSH
//! tunnels.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                           origin-replication                              │
//! │                                                                           │
//! │  ┌─────────────┐    ┌──────────────┐    ┌──────────────────────────────┐  │
//! │  │ Scheduler   │───►│ Pull / Push  │───►│ VersionSequencer             │  │
//! │  │ + Bulkhead  │    │ (per kind)   │    │ (create/update/push/delete)  │  │
//! │  └─────────────┘    └──────────────┘    └──────────────────────────────┘  │
//! │                            │                         │                    │
//! │                            ▼                         ▼                    │
//! │  ┌──────────────────────────────────┐    ┌─────────────────────────┐      │
//! │  │ RemoteClient                     │    │ Store + CursorStore     │      │
//! │  │ HTTP pools · SSH tunnels · CB    │    │ (SQLite, UNIQUE(origin, │      │
//! │  └──────────────────────────────────┘    │  modified))             │      │
//! │                                          └─────────────────────────┘      │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Versions
//!
//! An entity's `modified` timestamp is both its optimistic-lock token and the
//! replication cursor. The store enforces `UNIQUE(origin, modified)`, so each
//! origin has a strict total order of writes; the sequencer resolves
//! timestamp collisions by re-stamping and never retries a stale write.
//!
//! ## Deletes
//!
//! Resources are deleted physically. The other kinds encode deletes in the
//! tag (`del/...` intent, `deleted/...` confirmed) and replicate them like
//! any other write.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use origin_replication::{ReplicationConfig, ReplicationEngine};
//!
//! #[tokio::main]
//! async fn main() -> origin_replication::Result<()> {
//!     let config = ReplicationConfig::default();
//!     let mut engine = ReplicationEngine::new(config);
//!     engine.start().await?;
//!
//!     let report = engine.pull("upstream").await?;
//!     println!("pulled {} records", report.total_applied());
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod coordinator;
pub mod cursor;
pub mod error;
pub mod metrics;
pub mod model;
pub mod pool;
pub mod remote;
pub mod resilience;
pub mod store;
pub mod tag;

// Re-exports for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, RemoteCircuits};
pub use config::{ReplicationConfig, ReplicationSettings, StoreConfig};
pub use coordinator::{CycleReport, Direction, EngineState, ReplicationContext, ReplicationEngine};
pub use cursor::CursorStore;
pub use error::{ReplicationError, Result};
pub use model::{Entity, EntityKind, Extension, Origin, Plugin, Resource, Template, TunnelTarget, User, Version};
pub use pool::{ConnectionPools, PoolMode};
pub use remote::RemoteClient;
pub use store::{Hooks, OriginStore, PushOutcome, Store, VersionSequencer};
pub use tag::{TagState, TaggedKey};
