// src/transfer/state.rs

//! Persistent transfer state
//!
//! One JSON record per source server, stored at
//! `<transfer_dir>/state.json`. The engine consults it to decide which
//! phases still need to run: whether a repository's migration completed,
//! and which time range the next diff pass must cover.
//!
//! All mutation goes through [`TransferStateManager::with_state`], which
//! holds a process-wide mutex plus an exclusive file lock so that
//! concurrent runs on one workstation cannot corrupt the file. Writes go
//! to a temp file first and are renamed into place.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{Error, Result};

use super::PROPERTIES_PHASE_ENABLED;

/// Current on-disk schema version
pub const STATE_VERSION: u32 = 1;

const STATE_FILE_NAME: &str = "state.json";
const LOCK_FILE_NAME: &str = "state.lock";

// Serializes state access inside the process; the file lock covers other
// processes.
static STATE_MUTEX: Mutex<()> = Mutex::new(());

/// Start/end stamps of one phase run. RFC 3339 on disk, parsed into native
/// instants at the serde boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseStamps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended: Option<DateTime<Utc>>,
}

/// One diff pass over a repository. `handled_range` is the time interval
/// the pass covers; the sub-phases record when files-diff and
/// properties-diff actually ran for it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffWindow {
    #[serde(default)]
    pub files_diff: PhaseStamps,
    #[serde(default)]
    pub properties_diff: PhaseStamps,
    #[serde(default)]
    pub handled_range: PhaseStamps,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub completed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryState {
    pub name: String,
    #[serde(default)]
    pub migration: PhaseStamps,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diffs: Vec<DiffWindow>,
}

impl RepositoryState {
    /// Where the next diff window must begin: the end of the last
    /// completed window, else the end of the migration phase.
    pub fn next_range_start(&self) -> Option<DateTime<Utc>> {
        self.diffs
            .iter()
            .rev()
            .find(|d| d.completed)
            .and_then(|d| d.handled_range.ended)
            .or(self.migration.ended)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferState {
    #[serde(default)]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repositories: Vec<RepositoryState>,
    #[serde(default, rename = "nodes", skip_serializing_if = "Vec::is_empty")]
    pub node_ids: Vec<String>,
}

impl Default for TransferState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            repositories: Vec::new(),
            node_ids: Vec::new(),
        }
    }
}

impl TransferState {
    pub fn repository(&self, repo_key: &str) -> Option<&RepositoryState> {
        self.repositories.iter().find(|r| r.name == repo_key)
    }

    fn get_or_add_repository(&mut self, repo_key: &str) -> &mut RepositoryState {
        if let Some(pos) = self.repositories.iter().position(|r| r.name == repo_key) {
            return &mut self.repositories[pos];
        }
        self.repositories.push(RepositoryState {
            name: repo_key.to_owned(),
            ..Default::default()
        });
        self.repositories.last_mut().unwrap()
    }
}

pub struct TransferStateManager {
    state_file: PathBuf,
    lock_file: PathBuf,
}

impl TransferStateManager {
    pub fn new(transfer_dir: &Path) -> Self {
        Self {
            state_file: transfer_dir.join(STATE_FILE_NAME),
            lock_file: transfer_dir.join(LOCK_FILE_NAME),
        }
    }

    /// A clean start is the absence of a state file
    pub fn clean_start(&self) -> Result<bool> {
        Ok(!self.state_file.exists())
    }

    /// Run `action` against the persisted state under both the in-process
    /// mutex and an exclusive file lock, then write the result back
    /// atomically. The mutating bookkeeping calls below compose on this.
    pub fn with_state<T>(
        &self,
        action: impl FnOnce(&mut TransferState) -> Result<T>,
    ) -> Result<T> {
        let _guard = STATE_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(dir) = self.state_file.parent() {
            fs::create_dir_all(dir)?;
        }
        let lock = fs::File::create(&self.lock_file)?;
        FileExt::lock_exclusive(&lock)?;

        let mut state = self.read_state()?;
        let out = action(&mut state)?;
        self.write_state(&state)?;
        // Dropping `lock` releases the file lock.
        Ok(out)
    }

    /// Read-only access to the persisted state. Queries go through here so
    /// they neither create the state file nor add repository entries as a
    /// side effect; atomic writes keep concurrent readers consistent.
    pub fn view<T>(&self, action: impl FnOnce(&TransferState) -> Result<T>) -> Result<T> {
        let _guard = STATE_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let state = self.read_state()?;
        action(&state)
    }

    fn read_state(&self) -> Result<TransferState> {
        if !self.state_file.exists() {
            return Ok(TransferState::default());
        }
        let content = fs::read_to_string(&self.state_file)?;
        let state: TransferState = serde_json::from_str(&content).map_err(|e| {
            Error::StateCorruption(format!(
                "state file {} failed to parse: {e}",
                self.state_file.display()
            ))
        })?;
        if state.version != STATE_VERSION {
            return Err(Error::StateCorruption(format!(
                "state file {} has unsupported version {}",
                self.state_file.display(),
                state.version
            )));
        }
        Ok(state)
    }

    fn write_state(&self, state: &TransferState) -> Result<()> {
        let dir = self.state_file.parent().unwrap_or(Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, state)?;
        tmp.write_all(b"\n")?;
        tmp.persist(&self.state_file).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    pub fn repo_migration_started(
        &self,
        repo_key: &str,
        started: DateTime<Utc>,
    ) -> Result<()> {
        self.with_state(|state| {
            state.get_or_add_repository(repo_key).migration.started = Some(started);
            Ok(())
        })
    }

    pub fn repo_migration_completed(&self, repo_key: &str) -> Result<()> {
        self.with_state(|state| {
            state.get_or_add_repository(repo_key).migration.ended = Some(Utc::now());
            Ok(())
        })
    }

    pub fn is_repo_migrated(&self, repo_key: &str) -> Result<bool> {
        self.view(|state| {
            Ok(state
                .repository(repo_key)
                .is_some_and(|r| r.migration.ended.is_some()))
        })
    }

    /// Start of the range the next diff window would cover, if any diff
    /// can run yet. Used by dry runs to plan windows without opening one.
    pub fn next_range_start(&self, repo_key: &str) -> Result<Option<DateTime<Utc>>> {
        self.view(|state| {
            Ok(state
                .repository(repo_key)
                .and_then(RepositoryState::next_range_start))
        })
    }

    /// Open a new diff window ending at `started`. The window begins where
    /// the last completed window ended; the first window begins at the end
    /// of the migration phase.
    pub fn add_diff_window(&self, repo_key: &str, started: DateTime<Utc>) -> Result<()> {
        self.with_state(|state| {
            let repo = state.get_or_add_repository(repo_key);
            let Some(range_start) = repo.next_range_start() else {
                return Err(Error::StateCorruption(format!(
                    "cannot open a diff window for '{repo_key}': migration has not completed"
                )));
            };
            repo.diffs.push(DiffWindow {
                handled_range: PhaseStamps {
                    started: Some(range_start),
                    ended: Some(started),
                },
                ..Default::default()
            });
            Ok(())
        })
    }

    /// The `[start, end)` interval the current (last) diff window covers
    pub fn diff_handling_range(
        &self,
        repo_key: &str,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        self.view(|state| {
            let repo = state.repository(repo_key).ok_or_else(|| {
                Error::StateCorruption(format!(
                    "repository '{repo_key}' has no open diff window"
                ))
            })?;
            let last = repo.diffs.last().ok_or_else(|| {
                Error::StateCorruption(format!(
                    "repository '{repo_key}' has no open diff window"
                ))
            })?;
            match (last.handled_range.started, last.handled_range.ended) {
                (Some(start), Some(end)) => Ok((start, end)),
                _ => Err(Error::StateCorruption(format!(
                    "diff window of '{repo_key}' is missing its handled range"
                ))),
            }
        })
    }

    pub fn files_diff_started(&self, repo_key: &str, started: DateTime<Utc>) -> Result<()> {
        self.on_last_diff(repo_key, |diff| {
            diff.files_diff.started = Some(started);
        })
    }

    /// Files-diff completion also completes the window when the properties
    /// phase is disabled; otherwise the window stays open for it.
    pub fn files_diff_completed(&self, repo_key: &str) -> Result<()> {
        self.on_last_diff(repo_key, |diff| {
            diff.files_diff.ended = Some(Utc::now());
            diff.completed = !PROPERTIES_PHASE_ENABLED;
        })
    }

    pub fn props_diff_started(&self, repo_key: &str, started: DateTime<Utc>) -> Result<()> {
        self.on_last_diff(repo_key, |diff| {
            diff.properties_diff.started = Some(started);
        })
    }

    pub fn props_diff_completed(&self, repo_key: &str) -> Result<()> {
        self.on_last_diff(repo_key, |diff| {
            diff.properties_diff.ended = Some(Utc::now());
            diff.completed = true;
        })
    }

    pub fn node_ids(&self) -> Result<Vec<String>> {
        self.view(|state| Ok(state.node_ids.clone()))
    }

    pub fn set_node_ids(&self, node_ids: Vec<String>) -> Result<()> {
        self.with_state(|state| {
            state.node_ids = node_ids;
            Ok(())
        })
    }

    fn on_last_diff(
        &self,
        repo_key: &str,
        update: impl FnOnce(&mut DiffWindow),
    ) -> Result<()> {
        self.with_state(|state| {
            let repo = state.get_or_add_repository(repo_key);
            let last = repo.diffs.last_mut().ok_or_else(|| {
                Error::StateCorruption(format!(
                    "repository '{repo_key}' has no open diff window"
                ))
            })?;
            update(last);
            Ok(())
        })
    }
}
