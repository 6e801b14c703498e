// src/transfer/runner.rs

//! Shared producer/consumer scaffolding for phase runs
//!
//! A phase run is a bounded pool of workers consuming typed work units
//! from a channel. Workers may enqueue further units (folder branching in
//! the migration phase). A pending-unit counter detects drain exactly: the
//! worker that finishes the last unit broadcasts shutdown sentinels, the
//! supervisor then signals the polling loop and waits for every
//! outstanding token to resolve. The first error wins and cancels the
//! phase; workers observe cancellation at every suspension point.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::error;

use crate::error::{Error, Result};

use super::api::{FileRef, TargetAuth, UploadChunk};
use super::coordinator::{ChunkCoordinator, OutcomeHandler};
use super::{PhaseContext, UPLOAD_CHUNK_SIZE, WORK_CHANNEL_CAPACITY};

enum Message<W> {
    Task(W),
    Shutdown,
}

/// Handle workers use to enqueue further units and submit chunks
pub(crate) struct WorkContext<'a, W> {
    work_tx: Sender<Message<W>>,
    pending: &'a AtomicUsize,
    pub coordinator: &'a ChunkCoordinator<'a>,
    pub outcomes: &'a dyn OutcomeHandler,
}

impl<W> WorkContext<'_, W> {
    /// Enqueue a new work unit into the pool
    pub fn spawn(&self, unit: W) -> Result<()> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.work_tx.send(Message::Task(unit)).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Interrupted);
        }
        Ok(())
    }
}

/// Run `initial` work units through a pool of `ctx.threads` workers wired
/// to a fresh coordinator and polling loop. Returns once the pool is
/// drained and every submitted token reached a terminal status.
pub(crate) fn run_phase_pool<W, F>(
    ctx: &PhaseContext<'_>,
    initial: Vec<W>,
    outcomes: &dyn OutcomeHandler,
    handler: F,
) -> Result<()>
where
    W: Send,
    F: Fn(W, &WorkContext<'_, W>) -> Result<()> + Sync,
{
    if initial.is_empty() {
        return Ok(());
    }

    let threads = ctx.options.threads.max(1);
    let (coordinator, token_rx) = ChunkCoordinator::new(
        ctx.agent,
        ctx.progress,
        threads,
        ctx.options.poll_interval,
        ctx.options.dry_run,
        ctx.cancel.clone(),
    );
    let (work_tx, work_rx) = bounded(WORK_CHANNEL_CAPACITY);
    let (done_tx, done_rx) = bounded(1);
    let pending = AtomicUsize::new(0);
    let first_error: Mutex<Option<Error>> = Mutex::new(None);

    for unit in initial {
        pending.fetch_add(1, Ordering::SeqCst);
        if work_tx.send(Message::Task(unit)).is_err() {
            return Err(Error::Interrupted);
        }
    }

    thread::scope(|scope| {
        let poller = scope.spawn(|| coordinator.poll_loop(token_rx, done_rx, outcomes));

        let mut workers = Vec::with_capacity(threads);
        for _ in 0..threads {
            workers.push(scope.spawn(|| {
                worker_loop(
                    &work_tx,
                    &work_rx,
                    &pending,
                    &coordinator,
                    outcomes,
                    ctx,
                    &first_error,
                    &handler,
                    threads,
                )
            }));
        }
        for worker in workers {
            if worker.join().is_err() {
                record_first_error(&first_error, Error::Interrupted);
                ctx.cancel.cancel();
            }
        }

        let _ = done_tx.send(());
        match poller.join() {
            Ok(Err(e)) => {
                record_first_error(&first_error, e);
                ctx.cancel.cancel();
            }
            Ok(Ok(())) => {}
            Err(_) => record_first_error(&first_error, Error::Interrupted),
        }
    });

    let taken = first_error
        .into_inner()
        .unwrap_or_else(|e| e.into_inner());
    match taken {
        Some(e) => Err(e),
        None if ctx.cancel.is_cancelled() => Err(Error::Interrupted),
        None => Ok(()),
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_loop<W, F>(
    work_tx: &Sender<Message<W>>,
    work_rx: &Receiver<Message<W>>,
    pending: &AtomicUsize,
    coordinator: &ChunkCoordinator<'_>,
    outcomes: &dyn OutcomeHandler,
    ctx: &PhaseContext<'_>,
    first_error: &Mutex<Option<Error>>,
    handler: &F,
    threads: usize,
) where
    W: Send,
    F: Fn(W, &WorkContext<'_, W>) -> Result<()> + Sync,
{
    loop {
        if ctx.cancel.is_cancelled() {
            return;
        }
        match work_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(Message::Task(unit)) => {
                let work_ctx = WorkContext {
                    work_tx: work_tx.clone(),
                    pending,
                    coordinator,
                    outcomes,
                };
                if let Err(e) = handler(unit, &work_ctx) {
                    // Interruption is a cancellation cascade, not a root
                    // cause; leave the slot for the error that started it.
                    if !matches!(e, Error::Interrupted) {
                        error!("{}: task failed: {e}", ctx.repo_key);
                        record_first_error(first_error, e);
                    }
                    ctx.cancel.cancel();
                }
                if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                    // Pool drained; wake every worker so they can exit.
                    for _ in 0..threads {
                        let _ = work_tx.send(Message::Shutdown);
                    }
                }
            }
            Ok(Message::Shutdown) => return,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn record_first_error(slot: &Mutex<Option<Error>>, e: Error) {
    let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
    guard.get_or_insert(e);
}

/// Accumulates file references into chunks and ships each full chunk
/// through the coordinator. Residuals are flushed at the end of the work
/// unit that produced them.
pub(crate) struct ChunkBuilder<'a> {
    target_auth: &'a TargetAuth,
    check_existence_in_filestore: bool,
    coordinator: &'a ChunkCoordinator<'a>,
    outcomes: &'a dyn OutcomeHandler,
    files: Vec<FileRef>,
}

impl<'a> ChunkBuilder<'a> {
    pub fn new<W>(ctx: &PhaseContext<'a>, work_ctx: &'a WorkContext<'a, W>) -> Self {
        Self {
            target_auth: ctx.target_auth,
            check_existence_in_filestore: ctx.options.check_existence_in_filestore,
            coordinator: work_ctx.coordinator,
            outcomes: work_ctx.outcomes,
            files: Vec::with_capacity(UPLOAD_CHUNK_SIZE),
        }
    }

    pub fn push(&mut self, file: FileRef) -> Result<()> {
        self.files.push(file);
        if self.files.len() == UPLOAD_CHUNK_SIZE {
            return self.flush();
        }
        Ok(())
    }

    /// Ship whatever is accumulated, if anything
    pub fn flush(&mut self) -> Result<()> {
        if self.files.is_empty() {
            return Ok(());
        }
        let chunk = UploadChunk {
            target_auth: self.target_auth.clone(),
            check_existence_in_filestore: self.check_existence_in_filestore,
            upload_candidates: std::mem::take(&mut self.files),
        };
        self.coordinator.submit(chunk, self.outcomes)
    }
}
