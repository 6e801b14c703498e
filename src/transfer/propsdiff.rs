// src/transfer/propsdiff.rs

//! Properties-diff phase: catch-up on metadata-only changes
//!
//! The agent walks the property changes of the diff-handling range behind
//! a continuation cookie. The phase keeps calling `handlePropertiesDiff`
//! with the last cookie until the agent reports done with nothing left,
//! sleeping one poll interval whenever the agent is still working.

use std::thread;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::api::{PropertiesDiffRequest, ProcessStatus};
use super::{PhaseContext, TransferPhase, PROPERTIES_PHASE_ENABLED};

pub(crate) struct PropertiesDiffPhase;

impl TransferPhase for PropertiesDiffPhase {
    fn name(&self) -> &'static str {
        "Properties Diff Phase"
    }

    fn should_skip(&self, ctx: &PhaseContext<'_>) -> Result<bool> {
        Ok(!PROPERTIES_PHASE_ENABLED || ctx.options.dry_run)
    }

    fn started(&self, ctx: &PhaseContext<'_>) -> Result<()> {
        ctx.state.props_diff_started(&ctx.repo_key, Utc::now())
    }

    fn run(&self, ctx: &PhaseContext<'_>) -> Result<()> {
        let (start, end) = ctx.state.diff_handling_range(&ctx.repo_key)?;
        let mut cookie: Option<String> = None;
        let mut updated: u64 = 0;

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(Error::Interrupted);
            }
            let request = PropertiesDiffRequest {
                repo_key: ctx.repo_key.clone(),
                from_time: format_bound(&start),
                to_time: format_bound(&end),
                cookie: cookie.clone(),
            };
            let response = ctx.agent.handle_properties_diff(&request)?;

            for error in &response.errors {
                warn!(
                    "property update failed for {}/{}/{}: {}",
                    error.file.repo,
                    error.file.path,
                    error.file.name,
                    error.reason.as_deref().unwrap_or("unknown reason")
                );
            }
            updated += response.properties_updated.unwrap_or(0);

            match response.status {
                ProcessStatus::InProgress => {
                    // The agent is still working; re-poll with the same
                    // cursor unless it handed out a fresher one.
                    if let Some(next) = response.cookie {
                        cookie = Some(next);
                    }
                    thread::sleep(ctx.options.poll_interval);
                }
                ProcessStatus::Done => match response.cookie {
                    Some(next) if !next.is_empty() => cookie = Some(next),
                    _ => break,
                },
            }
        }

        debug!(
            "properties diff of '{}' delivered {updated} updates",
            ctx.repo_key
        );
        Ok(())
    }

    fn done(&self, ctx: &PhaseContext<'_>) -> Result<()> {
        ctx.state.props_diff_completed(&ctx.repo_key)
    }
}

fn format_bound(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}
