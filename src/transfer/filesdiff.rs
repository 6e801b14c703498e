// src/transfer/filesdiff.rs

//! Files-diff phase: catch-up on files created or modified since the
//! previous pass
//!
//! The repository's diff-handling range is sliced into 15-minute windows
//! so every AQL stays small, restarts are cheap to re-drive, and
//! late-arriving writes are covered predictably. A trailing fragment
//! shorter than a full window is still emitted. Failures recorded by
//! previous runs are re-driven through the same chunk machinery before
//! the windows are handled.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, info};

use crate::error::{Error, Result};

use super::api::FileRef;
use super::aql::modified_window_query;
use super::runner::{run_phase_pool, ChunkBuilder, WorkContext};
use super::sinks::SinkOutcomes;
use super::{PhaseContext, TransferPhase, DIFF_WINDOW_MINUTES};

/// Work of the files-diff pool: either one search window or the re-drive
/// of previously failed files
enum DiffUnit {
    Window {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
    Redrive {
        files: Vec<FileRef>,
    },
}

pub(crate) struct FilesDiffPhase;

impl TransferPhase for FilesDiffPhase {
    fn name(&self) -> &'static str {
        "Files Diff Phase"
    }

    fn should_skip(&self, ctx: &PhaseContext<'_>) -> Result<bool> {
        if ctx.options.dry_run {
            // A dry run still plans windows, but only for repositories
            // whose migration a real run already completed.
            return Ok(!ctx.state.is_repo_migrated(&ctx.repo_key)?);
        }
        Ok(false)
    }

    fn started(&self, ctx: &PhaseContext<'_>) -> Result<()> {
        if ctx.options.dry_run {
            return Ok(());
        }
        let now = Utc::now();
        ctx.state.add_diff_window(&ctx.repo_key, now)?;
        ctx.state.files_diff_started(&ctx.repo_key, now)
    }

    fn run(&self, ctx: &PhaseContext<'_>) -> Result<()> {
        let (start, end) = if ctx.options.dry_run {
            // Plan the range the next real pass would cover without
            // opening a window in state.
            match ctx.state.next_range_start(&ctx.repo_key)? {
                Some(start) => (start, Utc::now()),
                None => return Ok(()),
            }
        } else {
            ctx.state.diff_handling_range(&ctx.repo_key)?
        };
        debug!(
            "handling files diff of '{}' in range {start} .. {end}",
            ctx.repo_key
        );

        let mut units = Vec::new();
        if !ctx.options.dry_run {
            let failed = ctx.sinks.take_failures()?;
            if !failed.is_empty() {
                info!(
                    "re-driving {} previously failed files of '{}'",
                    failed.len(),
                    ctx.repo_key
                );
                units.push(DiffUnit::Redrive { files: failed });
            }
        }
        for (from, to) in slice_windows(start, end) {
            units.push(DiffUnit::Window { from, to });
        }

        let outcomes = SinkOutcomes::new(ctx.sinks, ctx.progress);
        run_phase_pool(ctx, units, &outcomes, |unit, work_ctx| {
            handle_diff_unit(ctx, unit, work_ctx)
        })?;

        if ctx.options.dry_run {
            return Ok(());
        }
        // Only a completed pass may forget the consumed failures.
        ctx.sinks.clear_redrive()
    }

    fn done(&self, ctx: &PhaseContext<'_>) -> Result<()> {
        if ctx.options.dry_run {
            return Ok(());
        }
        ctx.state.files_diff_completed(&ctx.repo_key)
    }
}

fn handle_diff_unit(
    ctx: &PhaseContext<'_>,
    unit: DiffUnit,
    work_ctx: &WorkContext<'_, DiffUnit>,
) -> Result<()> {
    match unit {
        DiffUnit::Window { from, to } => {
            debug!("searching time frame {from} .. {to}");
            let query = modified_window_query(&ctx.repo_key, &from, &to);
            let result = ctx.source.run_aql(&query)?;
            if result.results.is_empty() {
                debug!("no diffs found in time frame {from} .. {to}");
                return Ok(());
            }
            let mut chunk = ChunkBuilder::new(ctx, work_ctx);
            for item in &result.results {
                if ctx.cancel.is_cancelled() {
                    return Err(Error::Interrupted);
                }
                chunk.push(FileRef::new(&item.repo, &item.path, &item.name))?;
            }
            chunk.flush()
        }
        DiffUnit::Redrive { files } => {
            let mut chunk = ChunkBuilder::new(ctx, work_ctx);
            for file in files {
                if ctx.cancel.is_cancelled() {
                    return Err(Error::Interrupted);
                }
                chunk.push(file)?;
            }
            chunk.flush()
        }
    }
}

/// Slice `[start, end)` into contiguous windows of `DIFF_WINDOW_MINUTES`.
/// The trailing fragment is emitted as one short window rather than
/// silently dropped.
fn slice_windows(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let width = ChronoDuration::minutes(DIFF_WINDOW_MINUTES);
    let mut windows = Vec::new();
    let mut from = start;
    while from < end {
        let to = (from + width).min(end);
        windows.push((from, to));
        from = to;
    }
    windows
}
