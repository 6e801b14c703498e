// src/transfer/api.rs

//! Wire types of the data-transfer agent protocol
//!
//! A chunk is a batch of file references handed to the source agent in one
//! call. The agent either finishes a chunk synchronously (HTTP 200, no
//! token) or accepts it for asynchronous processing (HTTP 202) and returns
//! an opaque uuid token that is polled until the chunk reaches a terminal
//! status with per-file outcomes.

use serde::{Deserialize, Serialize};

/// Authentication material for the target server, embedded in every chunk
/// so the agent can push content directly. Either a token or a
/// username/password pair is set, never both.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetAuth {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_token: Option<String>,
}

/// One file (or empty-folder candidate) inside a source repository
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRef {
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub name: String,
}

impl FileRef {
    pub fn new(
        repo: impl Into<String>,
        path: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            repo: repo.into(),
            path: path.into(),
            name: name.into(),
        }
    }
}

/// A batch of upload candidates submitted to the agent in one call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadChunk {
    #[serde(flatten)]
    pub target_auth: TargetAuth,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub check_existence_in_filestore: bool,
    #[serde(default)]
    pub upload_candidates: Vec<FileRef>,
}

/// Body of an upload-chunk response. The token is absent when the agent
/// finished the chunk synchronously.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadChunkResponse {
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub uuid_token: Option<String>,
}

/// Body of a chunk-status request: the batch of outstanding tokens
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadChunksStatusBody {
    #[serde(default)]
    pub uuid_tokens: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadChunksStatusResponse {
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub chunks_status: Vec<ChunkStatus>,
}

/// Processing state the agent reports for a chunk or a properties cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessStatus {
    #[serde(rename = "IN_PROGRESS")]
    InProgress,
    #[serde(rename = "DONE")]
    Done,
}

/// Status of one polled chunk; `files` is populated once the chunk is done
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkStatus {
    pub uuid_token: String,
    pub status: ProcessStatus,
    #[serde(default)]
    pub files: Vec<FileOutcome>,
}

/// Terminal outcome the agent reports for a single file of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAIL")]
    Fail,
    #[serde(rename = "SKIPPED_LARGE_PROPS")]
    SkippedLargeProps,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOutcome {
    #[serde(flatten)]
    pub file: FileRef,
    pub status: FileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl FileOutcome {
    /// Outcome recorded locally when the agent completed a chunk
    /// synchronously and reported no per-file detail.
    pub fn success(file: FileRef) -> Self {
        Self {
            file,
            status: FileStatus::Success,
            reason: None,
        }
    }
}

/// Request body of the properties-diff cursor call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertiesDiffRequest {
    pub repo_key: String,
    pub from_time: String,
    pub to_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PropertiesDiffResponse {
    #[serde(default)]
    pub node_id: Option<String>,
    pub status: ProcessStatus,
    #[serde(default)]
    pub properties_updated: Option<u64>,
    /// Continuation cookie; absent once there is nothing left in the range
    #[serde(default)]
    pub cookie: Option<String>,
    #[serde(default)]
    pub errors: Vec<PropertyError>,
}

/// A property mutation the agent could not apply; informational only
#[derive(Debug, Clone, Deserialize)]
pub struct PropertyError {
    #[serde(flatten)]
    pub file: FileRef,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Body of a ping / clean-start response
#[derive(Debug, Clone, Deserialize)]
pub struct NodeIdResponse {
    #[serde(default)]
    pub node_id: String,
}
