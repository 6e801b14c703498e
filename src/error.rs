// src/error.rs

//! Error types for the transfer engine

use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a transfer
#[derive(Error, Debug)]
pub enum Error {
    /// Transient network failure: connection refused, timeout, 5xx.
    /// Retried by the caller's loop; surfaces when retries are exhausted.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The agent's chunk queue is full. Retried by the admission layer.
    #[error("agent upload queue is full")]
    AgentBusy,

    /// Malformed or unexpected agent response. Fatal to the phase.
    #[error("agent protocol error: {0}")]
    AgentProtocol(String),

    /// A referenced repository does not exist
    #[error("repository not found: {0}")]
    RepoNotFound(String),

    /// The persistent state file failed to parse or carries an
    /// unsupported version. Fatal to the run; never silently reset.
    #[error("transfer state corrupted: {0}")]
    StateCorruption(String),

    /// Snapshot look-up failed inside an already-enumerated repository
    #[error("no snapshot node for path '{0}'")]
    PathNotFound(String),

    /// A file was reported done but is not pending in its directory node
    #[error("file '{name}' is not pending in directory '{dir}'")]
    UnknownFile { dir: String, name: String },

    /// The transfer was cancelled
    #[error("transfer was interrupted")]
    Interrupted,

    /// Configuration problem (server registry, CLI arguments)
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the caller's retry loop may try again
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Http(_))
    }
}
