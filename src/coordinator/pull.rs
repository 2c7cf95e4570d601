// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pull: fetch a remote's deltas since the local cursor and ingest them.
//!
//! For each kind in [`EntityKind::ALL`] order:
//! 1. Resume point = explicit cursor for `(origin.local, kind)`, else the
//!    newest stored row for `origin.local`
//! 2. `GET .../{kind}?modifiedAfter=<cursor>&size=<batch>`
//! 3. Each record, ascending by `modified`, is re-tagged with `origin.local`
//!    and written through [`VersionSequencer::replicate`], which advances the
//!    cursor in the same transaction
//!
//! A crash or error mid-page therefore leaves the cursor at the last record
//! written. Errors stay local to their kind unless the remote itself is
//! unreachable, in which case the rest of the cycle is skipped.
//!
//! [`VersionSequencer::replicate`]: crate::store::VersionSequencer::replicate

use super::types::{CycleReport, Direction, KindReport};
use super::{aborts_cycle, ReplicationContext};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::model::{Entity, EntityKind, Extension, Origin, Plugin, Resource, Template, User};
use crate::remote::RemoteEndpoint;
use crate::store::origins::check_not_local;
use crate::store::PushOutcome;
use std::time::Instant;
use tracing::{debug, info, warn};

pub(super) async fn pull_origin(ctx: &ReplicationContext, origin: &Origin) -> Result<CycleReport> {
    let started = Instant::now();
    let size = origin.batch_size_or(ctx.config.settings.schedule.page_size());
    check_not_local(origin, &ctx.config.local_origin)?;

    let ep = match ctx.remote.connect(origin).await {
        Ok(ep) => ep,
        Err(e) => {
            warn!(error = %e, "Pull aborted, remote unreachable");
            metrics::record_cycle(&origin.name, "pull", "failed", started.elapsed());
            return Err(e);
        }
    };
    debug!(base_url = %ep.base_url, tunnelled = ep.is_tunnelled(), batch = size, "Pull started");

    let mut report = CycleReport::new(&origin.name, Direction::Pull);
    for kind in EntityKind::ALL {
        let mut kind_report = KindReport::new(kind, None);
        let result = match kind {
            EntityKind::Plugin => pull_kind::<Plugin>(ctx, &ep, origin, size, &mut kind_report).await,
            EntityKind::Template => pull_kind::<Template>(ctx, &ep, origin, size, &mut kind_report).await,
            EntityKind::Extension => pull_kind::<Extension>(ctx, &ep, origin, size, &mut kind_report).await,
            EntityKind::User => pull_kind::<User>(ctx, &ep, origin, size, &mut kind_report).await,
            EntityKind::Resource => pull_kind::<Resource>(ctx, &ep, origin, size, &mut kind_report).await,
        };
        if kind_report.applied > 0 {
            metrics::record_records_pulled(&origin.name, kind, kind_report.applied);
        }

        match result {
            Ok(()) => report.kinds.push(kind_report),
            Err(e) => {
                metrics::record_kind_error(&origin.name, kind, &e);
                warn!(
                    %kind,
                    applied = kind_report.applied,
                    cursor = ?kind_report.cursor,
                    error = %e,
                    "Pull failed for kind"
                );
                kind_report.error = Some(e.to_string());
                report.kinds.push(kind_report);
                if aborts_cycle(&e) {
                    metrics::record_cycle(&origin.name, "pull", "failed", started.elapsed());
                    return Err(e);
                }
            }
        }
    }

    if report.is_complete() {
        if let Err(e) = ctx.origins.record_pull(&origin.name, chrono::Utc::now()).await {
            warn!(error = %e, "Failed to record pull time");
        }
    }

    metrics::record_cycle(&origin.name, "pull", report.outcome(), started.elapsed());
    info!(
        applied = report.total_applied(),
        failed_kinds = report.failed_kinds(),
        more = report.has_more(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Pull cycle finished"
    );
    Ok(report)
}

async fn pull_kind<E: Entity>(
    ctx: &ReplicationContext,
    ep: &RemoteEndpoint,
    origin: &Origin,
    size: usize,
    report: &mut KindReport,
) -> Result<()> {
    if ctx.is_shutting_down() {
        return Err(ReplicationError::Shutdown);
    }

    let cursor = ctx.cursors.resume_point(&ctx.store, &origin.local, E::KIND).await?;
    report.cursor = cursor;

    let mut page: Vec<E> = ctx.remote.fetch_page(ep, cursor, size).await?;
    report.full = page.len() >= size;
    page.sort_by_key(|e| e.modified());

    for mut entity in page {
        if let Some(limiter) = &ctx.rate_limiter {
            limiter.acquire().await;
        }
        let modified = entity.modified();
        entity.set_origin(origin.local.clone());
        match ctx.sequencer.replicate(entity, &origin.local).await? {
            PushOutcome::Applied => report.applied += 1,
            PushOutcome::Unchanged => report.unchanged += 1,
        }
        report.cursor = modified;
    }

    if let Some(cursor) = report.cursor {
        metrics::record_cursor_advance(&origin.local, E::KIND, cursor.as_micros());
    }
    Ok(())
}
