// src/transfer/migration.rs

//! Migration phase: full traversal and transfer of a repository
//!
//! Runs once per repository. Every folder is one work unit: its contents
//! are listed with a flat AQL, child folders become new units, and files
//! are batched into upload chunks. The repository snapshot trie tracks
//! what was found and what is still pending; completed subtrees collapse
//! and an interrupted run resumes from the persisted snapshot.

use std::fs;
use std::sync::Mutex;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::progress::ProgressSink;

use super::api::{FileOutcome, FileRef};
use super::aql::folder_contents_query;
use super::coordinator::OutcomeHandler;
use super::lru::NodeLruCache;
use super::runner::{run_phase_pool, ChunkBuilder, WorkContext};
use super::sinks::RepoSinks;
use super::snapshot::{NodeId, RepoSnapshot};
use super::{
    join_relative, PhaseContext, TransferPhase, PROPERTIES_PHASE_ENABLED,
    SNAPSHOT_LRU_CAPACITY,
};

/// One folder of the repository awaiting traversal
struct FolderUnit {
    relative_path: String,
}

pub(crate) struct MigrationPhase;

impl TransferPhase for MigrationPhase {
    fn name(&self) -> &'static str {
        "Migration Phase"
    }

    fn should_skip(&self, ctx: &PhaseContext<'_>) -> Result<bool> {
        ctx.state.is_repo_migrated(&ctx.repo_key)
    }

    fn started(&self, ctx: &PhaseContext<'_>) -> Result<()> {
        if ctx.options.dry_run {
            return Ok(());
        }
        ctx.state
            .repo_migration_started(&ctx.repo_key, Utc::now())?;
        if PROPERTIES_PHASE_ENABLED {
            // The agent records the property baseline now so the
            // properties-diff phase has something to diff against.
            ctx.agent.store_properties(&ctx.repo_key)?;
        }
        Ok(())
    }

    fn run(&self, ctx: &PhaseContext<'_>) -> Result<()> {
        let snapshot_path = ctx.snapshot_path();
        let loaded = RepoSnapshot::load(&snapshot_path)?;
        if loaded.is_some() {
            info!(
                "resuming migration of '{}' from its snapshot",
                ctx.repo_key
            );
        }
        let outcomes = MigrationOutcomes {
            snapshot: Mutex::new(loaded.unwrap_or_default()),
            lru: Mutex::new(NodeLruCache::new(SNAPSHOT_LRU_CAPACITY)),
            sinks: ctx.sinks,
            progress: ctx.progress,
        };

        let initial = vec![FolderUnit {
            relative_path: ".".to_owned(),
        }];
        let result = run_phase_pool(ctx, initial, &outcomes, |unit, work_ctx| {
            transfer_folder(ctx, &outcomes, unit, work_ctx)
        });

        if ctx.options.dry_run {
            return result;
        }
        match &result {
            Ok(()) => {
                // The snapshot has collapsed to nothing useful; drop it.
                if snapshot_path.exists() {
                    fs::remove_file(&snapshot_path)?;
                }
            }
            Err(_) => {
                let snapshot = outcomes
                    .snapshot
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                if let Err(e) = snapshot.save(&snapshot_path) {
                    warn!(
                        "failed to persist the snapshot of '{}': {e}",
                        ctx.repo_key
                    );
                }
            }
        }
        result
    }

    fn done(&self, ctx: &PhaseContext<'_>) -> Result<()> {
        if ctx.options.dry_run {
            return Ok(());
        }
        ctx.state.repo_migration_completed(&ctx.repo_key)
    }
}

/// How a folder found in the snapshot needs to be handled
enum FolderState {
    /// Fully handled before; nothing to do
    Completed,
    /// Explored before but not finished: re-enqueue the known children
    /// and re-upload the still-pending files
    Explored {
        children: Vec<String>,
        pending: Vec<String>,
    },
    /// Needs exploring (fresh or partially explored)
    Explore(NodeId),
}

fn transfer_folder(
    ctx: &PhaseContext<'_>,
    outcomes: &MigrationOutcomes<'_>,
    unit: FolderUnit,
    work_ctx: &WorkContext<'_, FolderUnit>,
) -> Result<()> {
    let path = unit.relative_path;
    debug!("handling folder {}/{path}", ctx.repo_key);

    let state = {
        let snapshot = outcomes.snapshot();
        let node = snapshot.look_up(&path)?;
        if snapshot.is_completed(node) {
            FolderState::Completed
        } else if snapshot.is_done_exploring(node) {
            FolderState::Explored {
                children: snapshot.children(node).into_iter().map(|(n, _)| n).collect(),
                pending: snapshot.pending_files(node),
            }
        } else {
            FolderState::Explore(node)
        }
    };

    match state {
        FolderState::Completed => {
            debug!("skipping completed folder {}/{path}", ctx.repo_key);
            Ok(())
        }
        FolderState::Explored { children, pending } => {
            debug!(
                "folder {}/{path} was already explored, uploading remaining files",
                ctx.repo_key
            );
            let mut chunk = ChunkBuilder::new(ctx, work_ctx);
            if children.is_empty() && pending.is_empty() {
                // An empty folder whose candidate was never acknowledged;
                // re-emit it so the target still mirrors the tree.
                let (parent, name) = split_parent(&path);
                chunk.push(FileRef::new(&ctx.repo_key, parent, name))?;
            } else {
                for child in children {
                    work_ctx.spawn(FolderUnit {
                        relative_path: join_relative(&path, &child),
                    })?;
                }
                for file in pending {
                    chunk.push(FileRef::new(&ctx.repo_key, &path, file))?;
                }
            }
            chunk.flush()
        }
        FolderState::Explore(node) => {
            explore_folder(ctx, outcomes, node, &path, work_ctx)
        }
    }
}

fn explore_folder(
    ctx: &PhaseContext<'_>,
    outcomes: &MigrationOutcomes<'_>,
    node: NodeId,
    path: &str,
    work_ctx: &WorkContext<'_, FolderUnit>,
) -> Result<()> {
    outcomes.snapshot().begin_explore(node);

    let query = folder_contents_query(&ctx.repo_key, path);
    let result = ctx.source.run_aql(&query)?;

    let mut chunk = ChunkBuilder::new(ctx, work_ctx);
    if result.results.is_empty() {
        // Empty folder: ship the folder itself so the target mirrors the
        // tree. The node holds no pending files, so it must stay open
        // until the candidate is acknowledged; its ack collapses it.
        let (parent, name) = split_parent(path);
        outcomes.snapshot().mark_done_exploring(node);
        chunk.push(FileRef::new(&ctx.repo_key, parent, name))?;
        chunk.flush()?;
    } else {
        for item in &result.results {
            if ctx.cancel.is_cancelled() {
                return Err(crate::error::Error::Interrupted);
            }
            if item.name == "." {
                continue;
            }
            match item.item_type.as_str() {
                "folder" => {
                    outcomes.snapshot().add_child(node, &item.name);
                    work_ctx.spawn(FolderUnit {
                        relative_path: join_relative(path, &item.name),
                    })?;
                }
                "file" => {
                    outcomes.snapshot().add_file(node, &item.name);
                    chunk.push(FileRef::new(&item.repo, &item.path, &item.name))?;
                }
                other => {
                    debug!("ignoring item '{}' of unknown type '{other}'", item.name);
                }
            }
        }
        outcomes.snapshot().mark_done_exploring(node);
        chunk.flush()?;
        // Outcomes that arrived while exploration was still running could
        // not collapse this node yet; re-check now that exploring is done.
        outcomes.snapshot().check_completed(node);
    }
    debug!("done exploring folder {}/{path}", ctx.repo_key);
    Ok(())
}

/// Split a relative path into its parent directory and final segment.
/// The root stays "."; first-level entries get an empty parent.
fn split_parent(path: &str) -> (String, String) {
    if path == "." {
        return (".".to_owned(), ".".to_owned());
    }
    match path.rsplit_once('/') {
        Some((parent, name)) => (parent.to_owned(), name.to_owned()),
        None => (String::new(), path.to_owned()),
    }
}

/// Migration outcome handling: record the outcome in the sinks, then
/// update the snapshot - remove the pending file from its directory node
/// (resolved through the LRU) and collapse whatever completed.
struct MigrationOutcomes<'a> {
    snapshot: Mutex<RepoSnapshot>,
    lru: Mutex<NodeLruCache>,
    sinks: &'a RepoSinks,
    progress: &'a dyn ProgressSink,
}

impl MigrationOutcomes<'_> {
    fn snapshot(&self) -> std::sync::MutexGuard<'_, RepoSnapshot> {
        self.snapshot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl OutcomeHandler for MigrationOutcomes<'_> {
    fn file_done(&self, outcome: &FileOutcome) -> Result<()> {
        self.sinks.append(outcome)?;
        self.progress.files_done(1);

        let mut snapshot = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        let mut lru = self.lru.lock().unwrap_or_else(|e| e.into_inner());

        // Empty-folder candidates are acknowledged with the directory's
        // own parent/name split; a node exists at the joined path. Files
        // never have nodes of their own.
        let full = join_relative(&outcome.file.path, &outcome.file.name);
        if let Ok(node) = snapshot.look_up(&full) {
            snapshot.check_completed(node);
            return Ok(());
        }

        let dir = if outcome.file.path.is_empty() {
            "."
        } else {
            outcome.file.path.as_str()
        };
        let node = match lru.get(dir) {
            Some(node) => node,
            None => match snapshot.look_up(dir) {
                Ok(node) => {
                    lru.insert(dir, node);
                    node
                }
                Err(_) => {
                    // The subtree collapsed already; a duplicate terminal
                    // report has nothing left to update.
                    debug!("outcome for '{full}' arrived after its subtree collapsed");
                    return Ok(());
                }
            },
        };
        if snapshot.is_completed(node) {
            // Stale shortcut: the directory collapsed after the entry was
            // cached. Same late-duplicate case as a failed look-up.
            debug!("outcome for '{full}' arrived after its subtree collapsed");
            return Ok(());
        }
        snapshot.file_completed(node, &outcome.file.name)?;
        snapshot.check_completed(node);
        Ok(())
    }
}
