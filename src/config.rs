// src/config.rs

//! Server registry and credentials
//!
//! The CLI resolves the source and target servers by id from a JSON
//! registry file. The engine itself only ever sees [`ServerDetails`]; how
//! the credentials got there is not its concern.

use std::fs;
use std::path::{Path, PathBuf};

use reqwest::blocking::RequestBuilder;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::transfer::api::TargetAuth;

const REGISTRY_FILE_NAME: &str = "servers.json";

/// Connection details for one platform server. Token auth wins over
/// username/password when both are present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerDetails {
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ServerDetails {
    /// Attach this server's credentials to an outgoing request
    pub fn apply_auth(&self, request: RequestBuilder) -> RequestBuilder {
        if let Some(token) = &self.access_token {
            return request.bearer_auth(token);
        }
        if let Some(user) = &self.username {
            return request.basic_auth(user, self.password.as_deref());
        }
        request
    }

    /// The authentication material embedded in each upload chunk so the
    /// agent can push directly to the target.
    pub fn to_target_auth(&self) -> TargetAuth {
        if let Some(token) = &self.access_token {
            return TargetAuth {
                target_url: self.url.clone(),
                target_token: Some(token.clone()),
                ..Default::default()
            };
        }
        TargetAuth {
            target_url: self.url.clone(),
            target_username: self.username.clone(),
            target_password: self.password.clone(),
            ..Default::default()
        }
    }
}

/// The set of configured servers, loaded from `servers.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerRegistry {
    #[serde(default)]
    pub servers: Vec<ServerDetails>,
}

impl ServerRegistry {
    /// Default registry path: `<home>/.depot/servers.json`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("cannot determine the home directory".into()))?;
        Ok(home.join(".depot").join(REGISTRY_FILE_NAME))
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::Config(format!(
                "server registry {} does not exist; add your servers there first",
                path.display()
            )));
        }
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("server registry {} failed to parse: {e}", path.display()))
        })
    }

    pub fn resolve(&self, id: &str) -> Result<ServerDetails> {
        self.servers
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no server with id '{id}' in the registry")))
    }
}
