// src/transfer/coordinator.rs

//! Chunk admission and token polling
//!
//! Admission and polling share state, so both live here. The admission
//! counter bounds the number of chunks the agent is processing at once to
//! the engine's thread budget; a submitting worker blocks until a slot
//! frees up. Tokens returned for asynchronously processed chunks go to a
//! polling loop that owns the outstanding set, queries the agent each
//! tick, releases slots on completion and forwards per-file outcomes.
//!
//! One coordinator is constructed per phase run; nothing here is global.

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::progress::ProgressSink;

use super::agent::TransferAgent;
use super::api::{FileOutcome, ProcessStatus, UploadChunk};
use super::{CancelFlag, TOKEN_CHANNEL_CAPACITY};

/// Retry attempts for transient agent failures before they surface
const MAX_RETRIES: u32 = 3;

/// Delay between retry attempts in milliseconds
const RETRY_DELAY_MS: u64 = 1000;

/// Receiver of terminal per-file outcomes. The migration phase layers
/// snapshot bookkeeping on top of the plain sink writer.
pub(crate) trait OutcomeHandler: Sync {
    fn file_done(&self, outcome: &FileOutcome) -> Result<()>;
}

pub(crate) struct ChunkCoordinator<'a> {
    agent: &'a dyn TransferAgent,
    progress: &'a dyn ProgressSink,
    threads: usize,
    in_flight: Mutex<usize>,
    token_tx: Sender<String>,
    poll_interval: Duration,
    dry_run: bool,
    cancel: CancelFlag,
}

impl<'a> ChunkCoordinator<'a> {
    pub fn new(
        agent: &'a dyn TransferAgent,
        progress: &'a dyn ProgressSink,
        threads: usize,
        poll_interval: Duration,
        dry_run: bool,
        cancel: CancelFlag,
    ) -> (Self, Receiver<String>) {
        let (token_tx, token_rx) = bounded(TOKEN_CHANNEL_CAPACITY);
        (
            Self {
                agent,
                progress,
                threads,
                in_flight: Mutex::new(0),
                token_tx,
                poll_interval,
                dry_run,
                cancel,
            },
            token_rx,
        )
    }

    /// Claim an admission slot if one is free
    fn try_acquire(&self) -> bool {
        let mut count = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if *count < self.threads {
            *count += 1;
            return true;
        }
        false
    }

    fn release(&self) {
        let mut count = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        *count = count.saturating_sub(1);
    }

    /// Chunks the agent is currently processing
    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        *self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hand a chunk to the agent once there is room in its queue. Blocks
    /// until a slot frees up; `AgentBusy` releases the slot and retries,
    /// transient failures retry a bounded number of times. A token
    /// response is forwarded to the polling loop; a synchronous completion
    /// records Success for every file immediately.
    pub fn submit(&self, chunk: UploadChunk, outcomes: &dyn OutcomeHandler) -> Result<()> {
        if chunk.upload_candidates.is_empty() {
            return Ok(());
        }
        if self.dry_run {
            debug!(
                "dry run: would submit a chunk of {} files",
                chunk.upload_candidates.len()
            );
            return Ok(());
        }
        let mut transient_attempts = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Interrupted);
            }
            if !self.try_acquire() {
                thread::sleep(self.poll_interval);
                continue;
            }
            match self.agent.upload_chunk(&chunk) {
                Ok(Some(token)) => {
                    self.progress.chunk_submitted(chunk.upload_candidates.len());
                    debug!("chunk accepted, polling on token '{token}'");
                    if self.token_tx.send(token).is_err() {
                        // Polling loop is gone; the phase is winding down.
                        self.release();
                        return Err(Error::Interrupted);
                    }
                    return Ok(());
                }
                Ok(None) => {
                    // The whole chunk was checksum-deployed synchronously.
                    self.release();
                    self.progress.chunk_submitted(chunk.upload_candidates.len());
                    for file in &chunk.upload_candidates {
                        outcomes.file_done(&FileOutcome::success(file.clone()))?;
                    }
                    return Ok(());
                }
                Err(Error::AgentBusy) => {
                    self.release();
                    debug!("agent upload queue is full, backing off");
                    thread::sleep(self.poll_interval);
                }
                Err(e) if e.is_transient() => {
                    self.release();
                    transient_attempts += 1;
                    if transient_attempts >= MAX_RETRIES {
                        return Err(e);
                    }
                    warn!("chunk submission failed: {e}, retrying...");
                    thread::sleep(Duration::from_millis(
                        RETRY_DELAY_MS * transient_attempts as u64,
                    ));
                }
                Err(e) => {
                    self.release();
                    return Err(e);
                }
            }
        }
    }

    /// Poll outstanding tokens until the producer side signals done and
    /// every token reached a terminal status. On cancellation in-flight
    /// tokens are abandoned; the agent keeps processing them and the next
    /// files-diff run rediscovers their effects.
    pub fn poll_loop(
        &self,
        token_rx: Receiver<String>,
        done_rx: Receiver<()>,
        outcomes: &dyn OutcomeHandler,
    ) -> Result<()> {
        let result = self.poll_tokens(token_rx, done_rx, outcomes);
        if result.is_err() {
            // Submitters block on admission slots held by dead tokens;
            // cancelling is what unblocks them.
            self.cancel.cancel();
        }
        result
    }

    fn poll_tokens(
        &self,
        token_rx: Receiver<String>,
        done_rx: Receiver<()>,
        outcomes: &dyn OutcomeHandler,
    ) -> Result<()> {
        let mut outstanding: Vec<String> = Vec::new();
        let mut done = false;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            drain_tokens(&token_rx, &mut outstanding);
            if !done && done_rx.try_recv().is_ok() {
                done = true;
                // The done signal arrives after the last send; one more
                // drain observes every token.
                drain_tokens(&token_rx, &mut outstanding);
            }
            if outstanding.is_empty() {
                if done {
                    return Ok(());
                }
                thread::sleep(self.poll_interval);
                continue;
            }

            thread::sleep(self.poll_interval);
            drain_tokens(&token_rx, &mut outstanding);
            let response = self.status_with_retries(&outstanding)?;
            for chunk in response.chunks_status {
                match chunk.status {
                    ProcessStatus::InProgress => {}
                    ProcessStatus::Done => {
                        match outstanding.iter().position(|t| *t == chunk.uuid_token) {
                            Some(pos) => {
                                outstanding.remove(pos);
                                self.release();
                            }
                            None => warn!(
                                "unexpected uuid token '{}' in status response",
                                chunk.uuid_token
                            ),
                        }
                        for file in &chunk.files {
                            outcomes.file_done(file)?;
                        }
                    }
                }
            }
        }
    }

    fn status_with_retries(
        &self,
        tokens: &[String],
    ) -> Result<super::api::UploadChunksStatusResponse> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.agent.upload_chunks_status(tokens) {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempt < MAX_RETRIES => {
                    warn!("chunk status poll failed: {e}, retrying...");
                    thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn drain_tokens(token_rx: &Receiver<String>, outstanding: &mut Vec<String>) {
    while let Ok(token) = token_rx.try_recv() {
        outstanding.push(token);
    }
}
