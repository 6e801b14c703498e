// src/transfer/sinks.rs

//! Append-only outcome logs
//!
//! Per repository, three line-oriented JSON files under
//! `<transfer_dir>/<repo>/`:
//!
//! - `outcomes.jsonl`: every terminal file outcome
//! - `failures.jsonl`: Fail outcomes, consumed by the next files-diff
//!   phase for re-drive
//! - `skipped.jsonl`: SkippedLargeProps outcomes, informational
//!
//! One record per line: repo, path, name, status, optional reason.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

use crate::error::Result;
use crate::progress::ProgressSink;

use super::api::{FileOutcome, FileRef, FileStatus};
use super::coordinator::OutcomeHandler;

const OUTCOMES_FILE: &str = "outcomes.jsonl";
const FAILURES_FILE: &str = "failures.jsonl";
const REDRIVE_FILE: &str = "failures-redrive.jsonl";
const SKIPPED_FILE: &str = "skipped.jsonl";

/// Outcome logs of one repository
pub struct RepoSinks {
    dir: PathBuf,
    // Appends come from worker threads (synchronous completions) and the
    // polling thread; the lock keeps lines whole.
    write_lock: Mutex<()>,
}

impl RepoSinks {
    pub fn new(transfer_dir: &Path, repo_key: &str) -> Self {
        Self {
            dir: transfer_dir.join(repo_key),
            write_lock: Mutex::new(()),
        }
    }

    /// Record a terminal outcome; failures and skips also go to their
    /// dedicated logs.
    pub fn append(&self, outcome: &FileOutcome) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        fs::create_dir_all(&self.dir)?;
        self.append_line(OUTCOMES_FILE, outcome)?;
        match outcome.status {
            FileStatus::Fail => self.append_line(FAILURES_FILE, outcome)?,
            FileStatus::SkippedLargeProps => self.append_line(SKIPPED_FILE, outcome)?,
            FileStatus::Success => {}
        }
        Ok(())
    }

    /// Collect the failures recorded by previous runs for re-drive. The
    /// pending entries are moved to a consumption file so outcomes of the
    /// re-drive itself land in a fresh failures log; the consumption file
    /// survives until [`RepoSinks::clear_redrive`] so an interrupted
    /// re-drive is retried on the next run.
    pub fn take_failures(&self) -> Result<Vec<FileRef>> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut files = self.read_refs(&self.dir.join(REDRIVE_FILE))?;
        let failures_path = self.dir.join(FAILURES_FILE);
        let fresh = self.read_refs(&failures_path)?;
        if !fresh.is_empty() || failures_path.exists() {
            files.extend(fresh);
            fs::create_dir_all(&self.dir)?;
            let mut redrive = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(self.dir.join(REDRIVE_FILE))?;
            for file in &files {
                let record = FileOutcome {
                    file: file.clone(),
                    status: FileStatus::Fail,
                    reason: None,
                };
                serde_json::to_writer(&mut redrive, &record)?;
                redrive.write_all(b"\n")?;
            }
            fs::remove_file(&failures_path)?;
        }
        Ok(files)
    }

    /// Forget consumed failures after a successful re-drive
    pub fn clear_redrive(&self) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let path = self.dir.join(REDRIVE_FILE);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn append_line(&self, file_name: &str, outcome: &FileOutcome) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file_name))?;
        serde_json::to_writer(&mut file, outcome)?;
        file.write_all(b"\n")?;
        Ok(())
    }

    fn read_refs(&self, path: &Path) -> Result<Vec<FileRef>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(path)?);
        let mut refs = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<FileOutcome>(&line) {
                Ok(outcome) => refs.push(outcome.file),
                Err(e) => warn!("skipping malformed outcome line in {}: {e}", path.display()),
            }
        }
        Ok(refs)
    }
}

/// Plain outcome handling: log to the repository's sinks and tick the
/// progress sink. The diff phases use this directly; migration layers
/// snapshot bookkeeping on top.
pub(crate) struct SinkOutcomes<'a> {
    sinks: &'a RepoSinks,
    progress: &'a dyn ProgressSink,
}

impl<'a> SinkOutcomes<'a> {
    pub fn new(sinks: &'a RepoSinks, progress: &'a dyn ProgressSink) -> Self {
        Self { sinks, progress }
    }
}

impl OutcomeHandler for SinkOutcomes<'_> {
    fn file_done(&self, outcome: &FileOutcome) -> Result<()> {
        self.sinks.append(outcome)?;
        self.progress.files_done(1);
        Ok(())
    }
}
