// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background loops: one schedule per direction plus pool housekeeping.
//!
//! Every cycle, scheduled or manual, goes through [`run_cycle`]:
//! 1. Claim `(origin, direction)` so the same pair never runs twice at once
//! 2. Wait for a bulkhead slot, at most `queue_timeout`
//! 3. Run the pull or push
//!
//! Burst origins repeat the cycle while some kind keeps returning full
//! pages, up to `max_burst_cycles`. Loop bodies log errors and carry on;
//! nothing a cycle does can end a loop.

use super::types::{CycleGuard, CycleReport, Direction};
use super::{pull, push, ReplicationContext};
use crate::error::Result;
use crate::metrics;
use crate::model::Origin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

const MIN_PERIOD: Duration = Duration::from_millis(10);

fn ticker(period: Duration) -> Interval {
    let mut timer = tokio::time::interval(period.max(MIN_PERIOD));
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

/// Run one cycle under the per-pair guard and the bulkhead.
pub(super) async fn run_cycle(ctx: &ReplicationContext, origin: &Origin, direction: Direction) -> Result<CycleReport> {
    let _guard = CycleGuard::acquire(&ctx.active, &origin.name, direction)?;

    let permit = match ctx
        .bulkhead
        .acquire_timeout(ctx.config.settings.schedule.queue_timeout_duration())
        .await
    {
        Ok(permit) => permit,
        Err(e) => {
            metrics::record_bulkhead_rejection(direction.as_str());
            return Err(e.into());
        }
    };
    metrics::set_bulkhead_in_flight(ctx.bulkhead.in_flight());

    let span = info_span!("replication_cycle", origin = %origin.name, direction = direction.as_str());
    let result = match direction {
        Direction::Pull => pull::pull_origin(ctx, origin).instrument(span).await,
        Direction::Push => push::push_origin(ctx, origin).instrument(span).await,
    };

    drop(permit);
    metrics::set_bulkhead_in_flight(ctx.bulkhead.in_flight());
    result
}

/// Periodic pull or push of every origin enabled for `direction`.
pub(super) async fn run_schedule(
    ctx: Arc<ReplicationContext>,
    direction: Direction,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(%direction, period_ms = period.as_millis() as u64, "Starting replication schedule");
    let mut timer = ticker(period);

    loop {
        tokio::select! {
            _ = timer.tick() => {
                run_due(&ctx, direction).await;
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!(%direction, "Replication schedule stopping");
                    break;
                }
            }
        }
    }

    info!(%direction, "Replication schedule stopped");
}

async fn run_due(ctx: &Arc<ReplicationContext>, direction: Direction) {
    let origins = match ctx.origins.list().await {
        Ok(origins) => origins,
        Err(e) => {
            warn!(%direction, error = %e, "Failed to list origins");
            return;
        }
    };

    let handles: Vec<_> = origins
        .into_iter()
        .filter(|o| match direction {
            Direction::Pull => o.pulls(),
            Direction::Push => o.pushes(),
        })
        .map(|origin| {
            let ctx = Arc::clone(ctx);
            let name = origin.name.clone();
            (name, tokio::spawn(async move { run_origin(&ctx, origin, direction).await }))
        })
        .collect();

    for (name, handle) in handles {
        if let Err(e) = handle.await {
            error!(origin = %name, %direction, error = %e, "Replication cycle task panicked");
        }
    }
}

async fn run_origin(ctx: &ReplicationContext, origin: Origin, direction: Direction) {
    let rounds = if origin.burst {
        ctx.config.settings.schedule.max_burst_cycles.max(1)
    } else {
        1
    };

    for round in 1..=rounds {
        if ctx.is_shutting_down() {
            break;
        }
        match run_cycle(ctx, &origin, direction).await {
            Ok(report) if report.has_more() && round < rounds => {
                debug!(origin = %origin.name, %direction, round, "Batch full, continuing burst");
            }
            Ok(_) => break,
            Err(e) => {
                warn!(
                    origin = %origin.name,
                    %direction,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Replication cycle failed"
                );
                break;
            }
        }
    }
}

/// HTTP pool housekeeping, pool stats logging and tunnel health checks.
pub(super) async fn run_housekeeping(ctx: Arc<ReplicationContext>, mut shutdown_rx: watch::Receiver<bool>) {
    let pools = ctx.remote.pools();
    let http = &ctx.config.settings.http;
    let mut housekeeping = ticker(http.housekeeping_interval_duration());
    let mut stats = ticker(http.stats_interval_duration());
    let mut health = ticker(ctx.config.settings.tunnel.health_interval_duration());

    loop {
        tokio::select! {
            _ = housekeeping.tick() => {
                pools.housekeeping();
            }
            _ = stats.tick() => {
                pools.log_stats();
                metrics::set_bulkhead_in_flight(ctx.bulkhead.in_flight());
            }
            _ = health.tick() => {
                let evicted = pools.tunnels().health_check().await;
                if evicted > 0 {
                    info!(evicted, "Evicted unhealthy tunnels");
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!("Housekeeping stopping");
                    break;
                }
            }
        }
    }
}
