// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Push: the mirror of pull.
//!
//! The remote reports its newest version for `origin.remote`; every local
//! row of this instance's tenant newer than that is re-tagged with
//! `origin.remote` and posted in one batch per kind. The remote's own
//! cursor is the watermark, so a failed push is simply resent next cycle.

use super::types::{CycleReport, Direction, KindReport};
use super::{aborts_cycle, ReplicationContext};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::model::{Entity, EntityKind, Extension, Origin, Plugin, Resource, Template, User};
use crate::remote::RemoteEndpoint;
use std::time::Instant;
use tracing::{debug, info, warn};

pub(super) async fn push_origin(ctx: &ReplicationContext, origin: &Origin) -> Result<CycleReport> {
    let started = Instant::now();
    let size = origin.batch_size_or(ctx.config.settings.schedule.page_size());

    let ep = match ctx.remote.connect(origin).await {
        Ok(ep) => ep,
        Err(e) => {
            warn!(error = %e, "Push aborted, remote unreachable");
            metrics::record_cycle(&origin.name, "push", "failed", started.elapsed());
            return Err(e);
        }
    };

    let mut report = CycleReport::new(&origin.name, Direction::Push);
    for kind in EntityKind::ALL {
        let mut kind_report = KindReport::new(kind, None);
        let result = match kind {
            EntityKind::Plugin => push_kind::<Plugin>(ctx, &ep, origin, size, &mut kind_report).await,
            EntityKind::Template => push_kind::<Template>(ctx, &ep, origin, size, &mut kind_report).await,
            EntityKind::Extension => push_kind::<Extension>(ctx, &ep, origin, size, &mut kind_report).await,
            EntityKind::User => push_kind::<User>(ctx, &ep, origin, size, &mut kind_report).await,
            EntityKind::Resource => push_kind::<Resource>(ctx, &ep, origin, size, &mut kind_report).await,
        };

        match result {
            Ok(()) => {
                if kind_report.applied > 0 {
                    metrics::record_records_pushed(&origin.name, kind, kind_report.applied);
                }
                report.kinds.push(kind_report);
            }
            Err(e) => {
                metrics::record_kind_error(&origin.name, kind, &e);
                warn!(%kind, error = %e, "Push failed for kind");
                kind_report.error = Some(e.to_string());
                report.kinds.push(kind_report);
                if aborts_cycle(&e) {
                    metrics::record_cycle(&origin.name, "push", "failed", started.elapsed());
                    return Err(e);
                }
            }
        }
    }

    if report.is_complete() {
        if let Err(e) = ctx.origins.record_push(&origin.name, chrono::Utc::now()).await {
            warn!(error = %e, "Failed to record push time");
        }
    }

    metrics::record_cycle(&origin.name, "push", report.outcome(), started.elapsed());
    info!(
        sent = report.total_applied(),
        failed_kinds = report.failed_kinds(),
        more = report.has_more(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Push cycle finished"
    );
    Ok(report)
}

async fn push_kind<E: Entity>(
    ctx: &ReplicationContext,
    ep: &RemoteEndpoint,
    origin: &Origin,
    size: usize,
    report: &mut KindReport,
) -> Result<()> {
    if ctx.is_shutting_down() {
        return Err(ReplicationError::Shutdown);
    }

    let remote_cursor = ctx.remote.fetch_cursor(ep, E::KIND).await?;
    report.cursor = remote_cursor;

    let mut batch: Vec<E> = ctx
        .store
        .modified_after(&ctx.config.local_origin, remote_cursor, size)
        .await?;
    if batch.is_empty() {
        debug!(kind = %E::KIND, "Nothing to push");
        return Ok(());
    }
    for entity in &mut batch {
        entity.set_origin(origin.remote.clone());
    }

    ctx.remote.push_batch(ep, &batch).await?;
    report.applied = batch.len();
    report.full = batch.len() >= size;
    report.cursor = batch.last().and_then(|e| e.modified());
    Ok(())
}
