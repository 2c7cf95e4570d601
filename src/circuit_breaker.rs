//! Circuit breakers guarding remote origins.
//!
//! Every HTTP call to a remote origin goes through that origin's breaker, so
//! a dead partner fails its cycles fast instead of tying up a bulkhead slot
//! for the full request timeout. Uses the `recloser` crate.
//!
//! # States
//!
//! - **Closed**: Normal operation, requests pass through
//! - **Open**: Origin unhealthy, requests fail fast without attempting
//! - **HalfOpen**: Probing whether the origin recovered
//!
//! # Usage
//!
//! ```rust,no_run
//! # use origin_replication::circuit_breaker::{CircuitConfig, RemoteCircuits};
//! # use origin_replication::ReplicationError;
//! # async fn example() -> Result<(), ReplicationError> {
//! let circuits = RemoteCircuits::new(CircuitConfig::default());
//!
//! let page = circuits
//!     .call("@remote", || async { Ok::<_, ReplicationError>(vec![1, 2, 3]) })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{ReplicationError, Result};
use crate::metrics;
use dashmap::DashMap;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open).
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed.
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected)
    }
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => CircuitError::Rejected,
            RecloserError::Inner(e) => CircuitError::Inner(e),
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Size of the closed-state window; the circuit trips once half of
    /// the calls in it failed.
    pub failure_threshold: u32,
    /// Calls allowed through while half-open before deciding.
    pub success_threshold: u32,
    /// How long to stay open before probing.
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// A named circuit breaker with call counters.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(0.5)
            .closed_len(config.failure_threshold.max(1) as usize)
            .half_open_len(config.success_threshold.max(1) as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute an async operation through the circuit breaker.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> std::result::Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(&self.name, "success");
                metrics::set_circuit_state(&self.name, "closed");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(&self.name, "rejected");
                metrics::set_circuit_state(&self.name, "open");
                warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(&self.name, "failure");
                debug!(circuit = %self.name, "Circuit call failed");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Check if circuit is likely open (based on recent rejections).
    #[must_use]
    pub fn is_likely_open(&self) -> bool {
        self.rejections() > 0 && self.rejections() > self.successes()
    }
}

/// Counters of one origin's breaker, for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub origin: String,
    pub calls_total: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
    pub likely_open: bool,
}

/// One breaker per remote origin, created on first use.
#[derive(Clone)]
pub struct RemoteCircuits {
    config: CircuitConfig,
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
}

impl RemoteCircuits {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            breakers: Arc::new(DashMap::new()),
        }
    }

    pub fn for_origin(&self, origin: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(origin) {
            return Arc::clone(existing.value());
        }
        self.breakers
            .entry(origin.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(format!("origin-{}", origin), &self.config)))
            .clone()
    }

    /// Run a remote call through the origin's breaker. An open circuit
    /// becomes [`ReplicationError::CircuitOpen`].
    pub async fn call<F, Fut, T>(&self, origin: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.for_origin(origin).call(f).await {
            Ok(value) => Ok(value),
            Err(CircuitError::Rejected) => Err(ReplicationError::CircuitOpen(origin.to_string())),
            Err(CircuitError::Inner(e)) => Err(e),
        }
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut out: Vec<CircuitSnapshot> = self
            .breakers
            .iter()
            .map(|entry| {
                let cb = entry.value();
                CircuitSnapshot {
                    origin: entry.key().clone(),
                    calls_total: cb.calls_total(),
                    successes: cb.successes(),
                    failures: cb.failures(),
                    rejections: cb.rejections(),
                    likely_open: cb.is_likely_open(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.origin.cmp(&b.origin));
        out
    }

    /// Drop the breaker of a removed origin.
    pub fn forget(&self, origin: &str) {
        self.breakers.remove(origin);
    }
}
