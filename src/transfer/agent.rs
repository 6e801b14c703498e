// src/transfer/agent.rs

//! Client for the data-transfer agent installed on the source server
//!
//! All operations live under the plugin-execute prefix of the source
//! server. The engine only ever talks to the agent through the
//! [`TransferAgent`] trait so phase logic can be exercised against stubs.

use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;

use crate::config::ServerDetails;
use crate::error::{Error, Result};

use super::api::{
    NodeIdResponse, PropertiesDiffRequest, PropertiesDiffResponse, UploadChunk,
    UploadChunkResponse, UploadChunksStatusBody, UploadChunksStatusResponse,
};

/// Prefix of the agent's REST surface on the source server
pub const PLUGIN_EXECUTE_API: &str = "api/plugins/execute/";

/// Hard timeout for agent calls
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Typed operations the source agent exposes
pub trait TransferAgent: Send + Sync {
    /// Returns the identifier of the node that served the request; the
    /// load balancer sprays these, which is what node detection relies on.
    fn ping(&self) -> Result<String>;

    /// Tells the agent to reset its per-run counters; returns the node id
    fn clean_start(&self) -> Result<String>;

    /// Hands a chunk of upload candidates to the agent. Returns `None`
    /// when the agent finished the chunk synchronously (HTTP 200), or the
    /// uuid token to poll on (HTTP 202).
    fn upload_chunk(&self, chunk: &UploadChunk) -> Result<Option<String>>;

    /// Status of a batch of outstanding tokens
    fn upload_chunks_status(&self, tokens: &[String]) -> Result<UploadChunksStatusResponse>;

    /// Advance the properties-diff cursor for a repository and time range
    fn handle_properties_diff(
        &self,
        request: &PropertiesDiffRequest,
    ) -> Result<PropertiesDiffResponse>;

    /// Record the repository's property baseline before migration starts
    fn store_properties(&self, repo_key: &str) -> Result<()>;
}

/// Blocking HTTP implementation of [`TransferAgent`]
pub struct HttpTransferAgent {
    details: ServerDetails,
    client: Client,
}

impl HttpTransferAgent {
    pub fn new(details: ServerDetails) -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { details, client })
    }

    fn execute_url(&self, operation: &str) -> String {
        let base = self.details.url.trim_end_matches('/');
        format!("{base}/{PLUGIN_EXECUTE_API}{operation}")
    }

    fn get(&self, operation: &str) -> Result<Response> {
        let request = self.client.get(self.execute_url(operation));
        let request = self.details.apply_auth(request);
        request
            .send()
            .map_err(|e| Error::Http(format!("{operation}: {e}")))
    }

    fn post_json<B: serde::Serialize>(&self, operation: &str, body: &B) -> Result<Response> {
        let request = self.client.post(self.execute_url(operation)).json(body);
        let request = self.details.apply_auth(request);
        request
            .send()
            .map_err(|e| Error::Http(format!("{operation}: {e}")))
    }

    fn post_empty(&self, url: String, operation: &str) -> Result<Response> {
        let request = self.client.post(url);
        let request = self.details.apply_auth(request);
        request
            .send()
            .map_err(|e| Error::Http(format!("{operation}: {e}")))
    }

    fn node_id_of(&self, operation: &str, response: Response) -> Result<String> {
        let response = check_agent_status(operation, response)?;
        let body: NodeIdResponse = parse_agent_body(operation, response)?;
        Ok(body.node_id)
    }
}

/// Map a non-success agent status to the engine's error taxonomy:
/// 409 means the upload queue is full, 5xx is transient, anything else
/// unexpected is a protocol error carrying the raw body.
fn check_agent_status(operation: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::CONFLICT {
        return Err(Error::AgentBusy);
    }
    let body = response.text().unwrap_or_default();
    if status.is_server_error() {
        return Err(Error::Http(format!("{operation}: HTTP {status}: {body}")));
    }
    Err(Error::AgentProtocol(format!(
        "{operation}: HTTP {status}: {body}"
    )))
}

fn parse_agent_body<T: serde::de::DeserializeOwned>(
    operation: &str,
    response: Response,
) -> Result<T> {
    let body = response
        .text()
        .map_err(|e| Error::Http(format!("{operation}: {e}")))?;
    serde_json::from_str(&body)
        .map_err(|e| Error::AgentProtocol(format!("{operation}: {e}: {body}")))
}

impl TransferAgent for HttpTransferAgent {
    fn ping(&self) -> Result<String> {
        let response = self.get("pingDataTransfer")?;
        self.node_id_of("pingDataTransfer", response)
    }

    fn clean_start(&self) -> Result<String> {
        let response = self.post_empty(self.execute_url("cleanStart"), "cleanStart")?;
        self.node_id_of("cleanStart", response)
    }

    fn upload_chunk(&self, chunk: &UploadChunk) -> Result<Option<String>> {
        let response = self.post_json("uploadChunk", chunk)?;
        let status = response.status();
        let response = check_agent_status("uploadChunk", response)?;
        // 200 means the whole chunk was checksum-deployed synchronously
        // and there is nothing to poll.
        if status == StatusCode::OK {
            return Ok(None);
        }
        let body: UploadChunkResponse = parse_agent_body("uploadChunk", response)?;
        match body.uuid_token {
            Some(token) if !token.is_empty() => Ok(Some(token)),
            _ => Err(Error::AgentProtocol(
                "uploadChunk: accepted chunk carried no uuid token".into(),
            )),
        }
    }

    fn upload_chunks_status(&self, tokens: &[String]) -> Result<UploadChunksStatusResponse> {
        let body = UploadChunksStatusBody {
            uuid_tokens: tokens.to_vec(),
        };
        let response = self.post_json("getUploadChunksStatus", &body)?;
        let response = check_agent_status("getUploadChunksStatus", response)?;
        parse_agent_body("getUploadChunksStatus", response)
    }

    fn handle_properties_diff(
        &self,
        request: &PropertiesDiffRequest,
    ) -> Result<PropertiesDiffResponse> {
        let response = self.post_json("handlePropertiesDiff", request)?;
        let response = check_agent_status("handlePropertiesDiff", response)?;
        parse_agent_body("handlePropertiesDiff", response)
    }

    fn store_properties(&self, repo_key: &str) -> Result<()> {
        let url = format!("{}?repoKey={repo_key}", self.execute_url("storeProperties"));
        let response = self.post_empty(url, "storeProperties")?;
        check_agent_status("storeProperties", response)?;
        Ok(())
    }
}
