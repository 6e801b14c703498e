// src/lib.rs

//! Depot Transfer
//!
//! Cross-server data migration for the Depot binary repository platform.
//! The engine moves the entire binary payload of a source server to a
//! target server by driving the data-transfer agent installed on the
//! source: folders are explored and batched into upload chunks, the agent
//! pushes the content directly to the target, and the CLI polls the agent
//! for per-file outcomes.
//!
//! # Architecture
//!
//! - Persistent cross-run state: one JSON record per source server,
//!   tracking migration timestamps and chained diff windows
//! - Repository snapshots: a prefix tree of explored directories that
//!   collapses as subtrees complete, with an LRU shortcut cache
//! - Bounded producer/consumer phase runners over typed channels
//! - Token-based asynchronous polling of in-flight upload chunks

pub mod config;
mod error;
pub mod platform;
pub mod progress;
pub mod transfer;

pub use error::{Error, Result};
pub use transfer::{CancelFlag, TransferEngine, TransferOptions};
