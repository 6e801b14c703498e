// tests/common/mod.rs

//! In-memory stubs of the transfer agent and the platform surface,
//! programmable per scenario and inspectable after a run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use depot_transfer::platform::{AqlItem, AqlSearchResult, PlatformApi};
use depot_transfer::transfer::agent::TransferAgent;
use depot_transfer::transfer::api::{
    ChunkStatus, FileOutcome, FileRef, FileStatus, ProcessStatus, PropertiesDiffRequest,
    PropertiesDiffResponse, UploadChunk, UploadChunksStatusResponse,
};
use depot_transfer::Result;

type OutcomeFn = dyn Fn(&FileRef) -> FileOutcome + Send + Sync;

pub struct TokenState {
    pub polls_remaining: usize,
    pub files: Vec<FileOutcome>,
}

#[derive(Default)]
pub struct AgentState {
    pub pings: AtomicUsize,
    pub clean_starts: AtomicUsize,
    pub chunks: Mutex<Vec<UploadChunk>>,
    pub tokens: Mutex<HashMap<String, TokenState>>,
    pub issued: AtomicUsize,
    pub completed: AtomicUsize,
    pub open: AtomicUsize,
    pub max_open: AtomicUsize,
    pub store_properties_calls: Mutex<Vec<String>>,
    pub props_requests: Mutex<Vec<PropertiesDiffRequest>>,
}

/// Scenario-programmable transfer agent
#[derive(Clone)]
pub struct StubAgent {
    pub state: Arc<AgentState>,
    /// Status polls until a token reports done
    polls_to_done: usize,
    /// When set, chunks complete synchronously (HTTP 200, no token)
    synchronous: bool,
    outcome_of: Arc<OutcomeFn>,
    props_script: Arc<Mutex<Vec<PropertiesDiffResponse>>>,
}

impl StubAgent {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AgentState::default()),
            polls_to_done: 1,
            synchronous: false,
            outcome_of: Arc::new(|file| FileOutcome::success(file.clone())),
            props_script: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_polls_to_done(mut self, polls: usize) -> Self {
        self.polls_to_done = polls;
        self
    }

    pub fn synchronous(mut self) -> Self {
        self.synchronous = true;
        self
    }

    pub fn with_outcomes(
        mut self,
        f: impl Fn(&FileRef) -> FileOutcome + Send + Sync + 'static,
    ) -> Self {
        self.outcome_of = Arc::new(f);
        self
    }

    /// Queue properties-diff responses, served in order; once drained the
    /// agent answers done-with-nothing-left.
    pub fn with_props_script(self, script: Vec<PropertiesDiffResponse>) -> Self {
        {
            let mut guard = self.props_script.lock().unwrap();
            *guard = script;
            guard.reverse();
        }
        self
    }

    pub fn submitted_chunks(&self) -> Vec<UploadChunk> {
        self.state.chunks.lock().unwrap().clone()
    }
}

pub fn done_response(cookie: Option<&str>, updated: u64) -> PropertiesDiffResponse {
    serde_json::from_value(serde_json::json!({
        "node_id": "node-1",
        "status": "DONE",
        "properties_updated": updated,
        "cookie": cookie,
    }))
    .unwrap()
}

impl TransferAgent for StubAgent {
    fn ping(&self) -> Result<String> {
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        Ok("node-1".to_owned())
    }

    fn clean_start(&self) -> Result<String> {
        self.state.clean_starts.fetch_add(1, Ordering::SeqCst);
        Ok("node-1".to_owned())
    }

    fn upload_chunk(&self, chunk: &UploadChunk) -> Result<Option<String>> {
        self.state.chunks.lock().unwrap().push(chunk.clone());
        if self.synchronous {
            return Ok(None);
        }
        let open = self.state.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_open.fetch_max(open, Ordering::SeqCst);
        let n = self.state.issued.fetch_add(1, Ordering::SeqCst);
        let token = format!("token-{n}");
        let files = chunk
            .upload_candidates
            .iter()
            .map(|f| (self.outcome_of)(f))
            .collect();
        self.state.tokens.lock().unwrap().insert(
            token.clone(),
            TokenState {
                polls_remaining: self.polls_to_done,
                files,
            },
        );
        Ok(Some(token))
    }

    fn upload_chunks_status(&self, tokens: &[String]) -> Result<UploadChunksStatusResponse> {
        let mut states = self.state.tokens.lock().unwrap();
        let mut chunks_status = Vec::new();
        for token in tokens {
            let Some(state) = states.get_mut(token) else {
                continue;
            };
            if state.polls_remaining > 0 {
                state.polls_remaining -= 1;
            }
            if state.polls_remaining == 0 {
                self.state.open.fetch_sub(1, Ordering::SeqCst);
                self.state.completed.fetch_add(1, Ordering::SeqCst);
                chunks_status.push(ChunkStatus {
                    uuid_token: token.clone(),
                    status: ProcessStatus::Done,
                    files: state.files.clone(),
                });
                states.remove(token);
            } else {
                chunks_status.push(ChunkStatus {
                    uuid_token: token.clone(),
                    status: ProcessStatus::InProgress,
                    files: Vec::new(),
                });
            }
        }
        Ok(UploadChunksStatusResponse {
            node_id: Some("node-1".to_owned()),
            chunks_status,
        })
    }

    fn handle_properties_diff(
        &self,
        request: &PropertiesDiffRequest,
    ) -> Result<PropertiesDiffResponse> {
        self.state
            .props_requests
            .lock()
            .unwrap()
            .push(request.clone());
        let next = self.props_script.lock().unwrap().pop();
        Ok(next.unwrap_or_else(|| done_response(None, 0)))
    }

    fn store_properties(&self, repo_key: &str) -> Result<()> {
        self.state
            .store_properties_calls
            .lock()
            .unwrap()
            .push(repo_key.to_owned());
        Ok(())
    }
}

type AqlFn = dyn Fn(&str) -> AqlSearchResult + Send + Sync;

#[derive(Default)]
pub struct PlatformState {
    pub folder_queries: AtomicUsize,
    pub window_queries: AtomicUsize,
}

/// Scenario-programmable platform: fixed repository list plus an AQL
/// answering closure.
#[derive(Clone)]
pub struct StubPlatform {
    pub state: Arc<PlatformState>,
    repos: Vec<String>,
    aql: Arc<AqlFn>,
}

impl StubPlatform {
    pub fn new(repos: &[&str]) -> Self {
        Self {
            state: Arc::new(PlatformState::default()),
            repos: repos.iter().map(|r| (*r).to_owned()).collect(),
            aql: Arc::new(|_| AqlSearchResult::default()),
        }
    }

    pub fn with_aql(
        mut self,
        f: impl Fn(&str) -> AqlSearchResult + Send + Sync + 'static,
    ) -> Self {
        self.aql = Arc::new(f);
        self
    }
}

impl PlatformApi for StubPlatform {
    fn local_repositories(&self) -> Result<Vec<String>> {
        Ok(self.repos.clone())
    }

    fn run_aql(&self, query: &str) -> Result<AqlSearchResult> {
        if query.contains(r#""modified""#) {
            self.state.window_queries.fetch_add(1, Ordering::SeqCst);
        } else {
            self.state.folder_queries.fetch_add(1, Ordering::SeqCst);
        }
        Ok((self.aql)(query))
    }
}

pub fn file_item(repo: &str, path: &str, name: &str) -> AqlItem {
    AqlItem {
        repo: repo.to_owned(),
        path: path.to_owned(),
        name: name.to_owned(),
        item_type: "file".to_owned(),
    }
}

pub fn folder_item(repo: &str, path: &str, name: &str) -> AqlItem {
    AqlItem {
        repo: repo.to_owned(),
        path: path.to_owned(),
        name: name.to_owned(),
        item_type: "folder".to_owned(),
    }
}

pub fn items(list: Vec<AqlItem>) -> AqlSearchResult {
    AqlSearchResult { results: list }
}

/// Status lines of one outcome log, parsed back from JSONL
pub fn outcome_lines(path: &std::path::Path) -> Vec<FileOutcome> {
    if !path.exists() {
        return Vec::new();
    }
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

pub fn statuses_of(outcomes: &[FileOutcome]) -> Vec<FileStatus> {
    outcomes.iter().map(|o| o.status).collect()
}
