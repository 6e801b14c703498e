// src/platform.rs

//! Platform REST surface consumed by the engine
//!
//! Two operations are needed from a server: enumerating its local
//! repositories and executing AQL content queries. Both live behind
//! [`PlatformApi`] so phase logic can run against stubs.

use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use serde::Deserialize;
use tracing::warn;

use crate::config::ServerDetails;
use crate::error::{Error, Result};

/// Hard timeout for platform calls
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry attempts for transient platform failures
const MAX_RETRIES: u32 = 3;

/// Delay between retry attempts in milliseconds
const RETRY_DELAY_MS: u64 = 1000;

/// One item of an AQL search result
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct AqlItem {
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub item_type: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AqlSearchResult {
    #[serde(default)]
    pub results: Vec<AqlItem>,
}

#[derive(Debug, Clone, Deserialize)]
struct RepositoryDetails {
    key: String,
}

/// Repository catalog and AQL execution for one server
pub trait PlatformApi: Send + Sync {
    /// Keys of the server's local repositories
    fn local_repositories(&self) -> Result<Vec<String>>;

    /// Run a textual AQL query against the server
    fn run_aql(&self, query: &str) -> Result<AqlSearchResult>;
}

/// Blocking HTTP implementation of [`PlatformApi`]
pub struct HttpPlatformClient {
    details: ServerDetails,
    client: Client,
}

impl HttpPlatformClient {
    pub fn new(details: ServerDetails) -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { details, client })
    }

    fn api_url(&self, suffix: &str) -> String {
        let base = self.details.url.trim_end_matches('/');
        format!("{base}/{suffix}")
    }

    /// Send with bounded retries on transient failures
    fn send_with_retries(
        &self,
        what: &str,
        build: impl Fn() -> reqwest::blocking::RequestBuilder,
    ) -> Result<Response> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let request = self.details.apply_auth(build());
            let err = match request.send() {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    let body = response.text().unwrap_or_default();
                    if status.is_server_error() {
                        Error::Http(format!("{what}: HTTP {status}: {body}"))
                    } else {
                        return Err(Error::AgentProtocol(format!(
                            "{what}: HTTP {status}: {body}"
                        )));
                    }
                }
                Err(e) => Error::Http(format!("{what}: {e}")),
            };
            if err.is_transient() && attempt < MAX_RETRIES {
                warn!("{what} attempt {attempt} failed: {err}, retrying...");
                thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                continue;
            }
            return Err(err);
        }
    }
}

impl PlatformApi for HttpPlatformClient {
    fn local_repositories(&self) -> Result<Vec<String>> {
        let url = self.api_url("api/repositories?type=local");
        let response = self.send_with_retries("list repositories", || self.client.get(&url))?;
        let body = response
            .text()
            .map_err(|e| Error::Http(format!("list repositories: {e}")))?;
        let repos: Vec<RepositoryDetails> = serde_json::from_str(&body).map_err(|e| {
            Error::AgentProtocol(format!("list repositories: {e}: {body}"))
        })?;
        Ok(repos.into_iter().map(|r| r.key).collect())
    }

    fn run_aql(&self, query: &str) -> Result<AqlSearchResult> {
        let url = self.api_url("api/search/aql");
        let response = self.send_with_retries("aql", || {
            self.client
                .post(&url)
                .header("Content-Type", "text/plain")
                .body(query.to_owned())
        })?;
        let body = response
            .text()
            .map_err(|e| Error::Http(format!("aql: {e}")))?;
        serde_json::from_str(&body)
            .map_err(|e| Error::AgentProtocol(format!("aql: {e}: {body}")))
    }
}
