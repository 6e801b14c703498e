// src/transfer/mod.rs

//! The data migration engine
//!
//! Drives the full transfer of a source server's repositories to a target
//! server through the source-resident transfer agent. Per repository the
//! engine runs three phases in order:
//!
//! 1. Migration: traverse the whole repository tree and hand every file
//!    to the agent in chunks
//! 2. Files-diff: re-scan the time range since the previous pass in
//!    15-minute windows to catch files created or modified meanwhile
//! 3. Properties-diff: catch up on metadata-only changes in the same range
//!
//! Progress and completion are recorded in a persistent state file after
//! every phase boundary, so interrupted runs resume where they stopped.

pub mod agent;
pub mod api;
pub mod aql;
mod coordinator;
mod filesdiff;
mod lru;
mod migration;
mod propsdiff;
mod runner;
pub mod sinks;
pub mod snapshot;
pub mod state;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use glob::Pattern;
use tracing::{debug, error, info, warn};

use crate::config::ServerDetails;
use crate::error::{Error, Result};
use crate::platform::PlatformApi;
use crate::progress::{LogProgress, ProgressSink};

use agent::TransferAgent;
use api::TargetAuth;
use filesdiff::FilesDiffPhase;
use migration::MigrationPhase;
use propsdiff::PropertiesDiffPhase;
use sinks::RepoSinks;
use state::TransferStateManager;

/// Maximum number of file references per upload chunk
pub(crate) const UPLOAD_CHUNK_SIZE: usize = 16;

/// Default size of the worker pool
pub const DEFAULT_THREADS: usize = 8;

/// Capacity of the snapshot-node shortcut cache
pub(crate) const SNAPSHOT_LRU_CAPACITY: usize = 3000;

/// Width of one files-diff search window
pub(crate) const DIFF_WINDOW_MINUTES: i64 = 15;

/// Ping calls used to enumerate the source cluster's nodes. The load
/// balancer is assumed to spray them across all nodes.
pub(crate) const NODE_DETECTION_REQUESTS: usize = 50;

/// Default wait between chunk status polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Capacity of the per-phase work channel
pub(crate) const WORK_CHANNEL_CAPACITY: usize = 65_536;

/// Capacity of the outstanding-token channel
pub(crate) const TOKEN_CHANNEL_CAPACITY: usize = 1024;

/// Whether the properties-diff phase runs after each files-diff pass.
/// When disabled, files-diff completion closes the diff window by itself.
pub(crate) const PROPERTIES_PHASE_ENABLED: bool = true;

/// Cooperative cancellation signal, observed by workers and the polling
/// loop at every suspension point.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Engine options, CLI-facing
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Worker pool size; also bounds the agent's in-flight chunk count
    pub threads: usize,
    /// Glob patterns of repositories to include (empty means all)
    pub include_repos: Vec<String>,
    /// Glob patterns of repositories to exclude
    pub exclude_repos: Vec<String>,
    /// Ask the agent to skip uploads whose checksum already exists in the
    /// target filestore
    pub check_existence_in_filestore: bool,
    /// Traverse and plan without submitting anything or touching state
    pub dry_run: bool,
    /// Directory holding the state file, snapshots and outcome logs
    pub transfer_dir: PathBuf,
    /// Wait between chunk status polls
    pub poll_interval: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            threads: DEFAULT_THREADS,
            include_repos: Vec::new(),
            exclude_repos: Vec::new(),
            check_existence_in_filestore: false,
            dry_run: false,
            transfer_dir: default_transfer_dir(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Default transfer dir: `<home>/.depot/transfer`
pub fn default_transfer_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".depot")
        .join("transfer")
}

/// Everything a phase needs for one repository
pub(crate) struct PhaseContext<'a> {
    pub repo_key: String,
    pub agent: &'a dyn TransferAgent,
    pub source: &'a dyn PlatformApi,
    pub target_auth: &'a TargetAuth,
    pub state: &'a TransferStateManager,
    pub sinks: &'a RepoSinks,
    pub progress: &'a dyn ProgressSink,
    pub options: &'a TransferOptions,
    pub cancel: CancelFlag,
}

impl PhaseContext<'_> {
    pub fn snapshot_path(&self) -> PathBuf {
        self.options
            .transfer_dir
            .join("snapshots")
            .join(format!("{}.json", self.repo_key))
    }
}

/// One migration phase of a repository
pub(crate) trait TransferPhase {
    fn name(&self) -> &'static str;
    fn should_skip(&self, ctx: &PhaseContext<'_>) -> Result<bool>;
    fn started(&self, ctx: &PhaseContext<'_>) -> Result<()>;
    fn run(&self, ctx: &PhaseContext<'_>) -> Result<()>;
    fn done(&self, ctx: &PhaseContext<'_>) -> Result<()>;
}

/// The cross-server data migration engine
pub struct TransferEngine {
    agent: Box<dyn TransferAgent>,
    source: Box<dyn PlatformApi>,
    target: Box<dyn PlatformApi>,
    target_auth: TargetAuth,
    progress: Box<dyn ProgressSink>,
    options: TransferOptions,
    cancel: CancelFlag,
}

impl TransferEngine {
    pub fn new(
        agent: Box<dyn TransferAgent>,
        source: Box<dyn PlatformApi>,
        target: Box<dyn PlatformApi>,
        target_details: &ServerDetails,
        options: TransferOptions,
    ) -> Self {
        Self {
            agent,
            source,
            target,
            target_auth: target_details.to_target_auth(),
            progress: Box::new(LogProgress::default()),
            options,
            cancel: CancelFlag::default(),
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Handle an orchestrator can use to stop the engine cooperatively
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Run the transfer: pick repositories, sequence phases, surface the
    /// first fatal error. A failing phase aborts its repository but the
    /// run moves on to the next one.
    pub fn run(&self) -> Result<()> {
        let state = TransferStateManager::new(&self.options.transfer_dir);

        if state.clean_start()? && !self.options.dry_run {
            info!("no previous transfer state found, detecting source cluster nodes...");
            self.detect_nodes(&state)?;
        }

        let source_repos = self.filter_repositories(self.source.local_repositories()?)?;
        let target_repos: BTreeSet<String> =
            self.target.local_repositories()?.into_iter().collect();
        info!("transferring {} repositories", source_repos.len());

        let phases: [&dyn TransferPhase; 3] =
            [&MigrationPhase, &FilesDiffPhase, &PropertiesDiffPhase];
        let mut first_error: Option<Error> = None;

        'repos: for repo_key in source_repos {
            if self.cancel.is_cancelled() {
                break;
            }
            if !target_repos.contains(&repo_key) {
                warn!("repository '{repo_key}' does not exist in target. Skipping...");
                continue;
            }

            let sinks = RepoSinks::new(&self.options.transfer_dir, &repo_key);
            let ctx = PhaseContext {
                repo_key: repo_key.clone(),
                agent: &*self.agent,
                source: &*self.source,
                target_auth: &self.target_auth,
                state: &state,
                sinks: &sinks,
                progress: &*self.progress,
                options: &self.options,
                cancel: self.cancel.clone(),
            };

            for phase in phases {
                if let Err(e) = self.run_phase(phase, &ctx) {
                    error!(
                        "phase '{}' failed for repository '{repo_key}': {e}",
                        phase.name()
                    );
                    first_error.get_or_insert(e);
                    // Abort this repository, move on to the next one.
                    continue 'repos;
                }
                if self.cancel.is_cancelled() {
                    break 'repos;
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None if self.cancel.is_cancelled() => Err(Error::Interrupted),
            None => {
                info!("files transfer is complete");
                Ok(())
            }
        }
    }

    fn run_phase(&self, phase: &dyn TransferPhase, ctx: &PhaseContext<'_>) -> Result<()> {
        if phase.should_skip(ctx)? {
            debug!(
                "skipping '{}' for repository '{}'",
                phase.name(),
                ctx.repo_key
            );
            return Ok(());
        }
        phase.started(ctx)?;
        ctx.progress.phase_started(&ctx.repo_key, phase.name());
        phase.run(ctx)?;
        phase.done(ctx)?;
        ctx.progress.phase_done(&ctx.repo_key, phase.name());
        Ok(())
    }

    /// Enumerate the source cluster's nodes by pinging through the load
    /// balancer, freeze the distinct set into state, and notify every
    /// node of the clean start.
    fn detect_nodes(&self, state: &TransferStateManager) -> Result<()> {
        let mut nodes: Vec<String> = Vec::new();
        for _ in 0..NODE_DETECTION_REQUESTS {
            let node_id = self.agent.ping()?;
            if !nodes.contains(&node_id) {
                nodes.push(node_id);
            }
        }
        info!("detected source nodes: {nodes:?}");

        let mut remaining: BTreeSet<String> = nodes.iter().cloned().collect();
        for _ in 0..nodes.len() * 5 {
            if remaining.is_empty() {
                break;
            }
            match self.agent.clean_start() {
                Ok(node_id) => {
                    remaining.remove(&node_id);
                }
                Err(e) => warn!("clean start notification failed: {e}"),
            }
        }
        if !remaining.is_empty() {
            warn!("nodes did not acknowledge the clean start: {remaining:?}");
        }

        state.set_node_ids(nodes)
    }

    fn filter_repositories(&self, repos: Vec<String>) -> Result<Vec<String>> {
        let include = compile_patterns(&self.options.include_repos)?;
        let exclude = compile_patterns(&self.options.exclude_repos)?;
        Ok(repos
            .into_iter()
            .filter(|repo| {
                let included =
                    include.is_empty() || include.iter().any(|p| p.matches(repo));
                included && !exclude.iter().any(|p| p.matches(repo))
            })
            .collect())
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p)
                .map_err(|e| Error::Config(format!("invalid repository pattern '{p}': {e}")))
        })
        .collect()
}

/// Join a directory path and an entry name into a relative path, keeping
/// the "." root convention intact.
pub(crate) fn join_relative(path: &str, name: &str) -> String {
    if path.is_empty() || path == "." {
        name.to_owned()
    } else {
        format!("{path}/{name}")
    }
}
