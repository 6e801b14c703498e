// src/progress.rs

//! Progress reporting for transfer phases
//!
//! The engine emits phase-start, per-chunk and phase-end ticks through the
//! [`ProgressSink`] trait. Implementations cover the CLI (indicatif
//! spinner with counters), plain logging, and silence for scripted use.

use std::sync::atomic::{AtomicU64, Ordering};

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

/// Receiver of phase progress ticks. Implementations must be thread-safe;
/// chunk and file ticks arrive from worker and polling threads.
pub trait ProgressSink: Send + Sync {
    /// A phase started for a repository
    fn phase_started(&self, repo_key: &str, phase: &str);

    /// A chunk of `files` upload candidates was handed to the agent
    fn chunk_submitted(&self, files: usize);

    /// `count` files reached a terminal outcome
    fn files_done(&self, count: usize);

    /// The phase finished for the repository
    fn phase_done(&self, repo_key: &str, phase: &str);
}

/// No-op sink for scripted or embedded use
#[derive(Debug, Default)]
pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn phase_started(&self, _repo_key: &str, _phase: &str) {}
    fn chunk_submitted(&self, _files: usize) {}
    fn files_done(&self, _count: usize) {}
    fn phase_done(&self, _repo_key: &str, _phase: &str) {}
}

/// Logs phase boundaries at info level and ticks at debug level
#[derive(Debug, Default)]
pub struct LogProgress {
    files: AtomicU64,
}

impl ProgressSink for LogProgress {
    fn phase_started(&self, repo_key: &str, phase: &str) {
        info!("========== Running '{phase}' for repo '{repo_key}' ==========");
    }

    fn chunk_submitted(&self, files: usize) {
        debug!("submitted a chunk of {files} files");
    }

    fn files_done(&self, count: usize) {
        let total = self.files.fetch_add(count as u64, Ordering::Relaxed) + count as u64;
        debug!("{total} files reached a terminal state");
    }

    fn phase_done(&self, repo_key: &str, phase: &str) {
        info!("========== Done running '{phase}' for repo '{repo_key}' ==========");
    }
}

/// Interactive progress for the CLI: a spinner with file counters
pub struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner} {msg} [{pos} files]")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        Self { bar }
    }
}

impl Default for CliProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for CliProgress {
    fn phase_started(&self, repo_key: &str, phase: &str) {
        self.bar.set_message(format!("{repo_key}: {phase}"));
    }

    fn chunk_submitted(&self, _files: usize) {
        self.bar.tick();
    }

    fn files_done(&self, count: usize) {
        self.bar.inc(count as u64);
    }

    fn phase_done(&self, repo_key: &str, phase: &str) {
        self.bar
            .println(format!("{repo_key}: {phase} done ({} files)", self.bar.position()));
    }
}
