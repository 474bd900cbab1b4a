use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::model::{ServerState, VaultItem};

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault server unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("vault server rejected request: {0}")]
    Rejected(String),
    #[error("unexpected vault response: {0}")]
    Malformed(String),
    /// Outcome of a fetch another caller started and this one waited on.
    #[error("{0}")]
    Shared(Arc<VaultError>),
}

/// Operations the plugin needs from a running `bw serve` instance.
///
/// Every call is a single attempt. `status` never fails: when the server
/// cannot be reached the implementation falls back to another source or
/// reports [`ServerState::Unauthenticated`].
#[async_trait]
pub trait VaultApi: Send + Sync {
    async fn status(&self, port: u16) -> ServerState;
    async fn unlock(&self, port: u16, password: &str) -> Result<(), VaultError>;
    async fn lock(&self, port: u16) -> Result<(), VaultError>;
    async fn one_time_code(&self, port: u16, item_id: &str) -> Result<String, VaultError>;
    async fn list_items(&self, port: u16) -> Result<Vec<VaultItem>, VaultError>;
    async fn sync(&self, port: u16) -> Result<(), VaultError>;
    /// Polls until the server answers or `max_attempts` is used up. Used
    /// after an explicit start, since spawning returns before the server
    /// listens.
    async fn wait_until_ready(&self, port: u16, max_attempts: usize) -> bool;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct StatusData {
    template: Option<StatusTemplate>,
}

#[derive(Debug, Deserialize)]
struct StatusTemplate {
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Wrapped<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct CliStatus {
    status: Option<String>,
}

pub struct VaultClient {
    http: reqwest::Client,
    hostname: String,
    bw_executable: PathBuf,
    cli_timeout: Duration,
}

impl VaultClient {
    pub fn new(config: &Config) -> Result<Self, VaultError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            http,
            hostname: config.server_hostname.clone(),
            bw_executable: config.bw_executable.clone(),
            cli_timeout: config.request_timeout(),
        })
    }

    fn url(&self, port: u16, path: &str) -> String {
        format!("http://{}:{port}{path}", self.hostname)
    }

    async fn read<T: DeserializeOwned>(response: reqwest::Response) -> Result<Option<T>, VaultError> {
        let body = response.bytes().await?;
        let envelope: Envelope<T> =
            serde_json::from_slice(&body).map_err(|e| VaultError::Malformed(e.to_string()))?;
        if !envelope.success {
            return Err(VaultError::Rejected(
                envelope.message.unwrap_or_else(|| "request failed".to_string()),
            ));
        }
        Ok(envelope.data)
    }

    async fn cli_status(&self) -> ServerState {
        let mut command = tokio::process::Command::new(&self.bw_executable);
        command
            .arg("status")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(windows)]
        command.creation_flags(crate::supervisor::CREATE_NO_WINDOW);

        let output = match tokio::time::timeout(self.cli_timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                warn!(%err, "bw status failed to run");
                return ServerState::Unauthenticated;
            }
            Err(_) => {
                warn!("bw status timed out");
                return ServerState::Unauthenticated;
            }
        };
        reconcile_cli_status(&String::from_utf8_lossy(&output.stdout))
    }
}

#[async_trait]
impl VaultApi for VaultClient {
    async fn status(&self, port: u16) -> ServerState {
        match self.http.get(self.url(port, "/status")).send().await {
            Ok(response) => match response.bytes().await {
                Ok(body) => parse_status_payload(&body),
                Err(err) => {
                    warn!(%err, "status body unreadable");
                    ServerState::Unauthenticated
                }
            },
            Err(err) => {
                debug!(%err, "status endpoint unreachable; asking the cli");
                self.cli_status().await
            }
        }
    }

    async fn unlock(&self, port: u16, password: &str) -> Result<(), VaultError> {
        let response = self
            .http
            .post(self.url(port, "/unlock"))
            .json(&serde_json::json!({ "password": password }))
            .send()
            .await?;
        Self::read::<serde_json::Value>(response).await?;
        Ok(())
    }

    async fn lock(&self, port: u16) -> Result<(), VaultError> {
        let response = self.http.post(self.url(port, "/lock")).send().await?;
        Self::read::<serde_json::Value>(response).await?;
        Ok(())
    }

    async fn one_time_code(&self, port: u16, item_id: &str) -> Result<String, VaultError> {
        let path = format!("/object/totp/{item_id}");
        let response = self.http.get(self.url(port, &path)).send().await?;
        Self::read::<Wrapped<String>>(response)
            .await?
            .map(|wrapped| wrapped.data)
            .ok_or_else(|| VaultError::Malformed("totp response has no code".to_string()))
    }

    async fn list_items(&self, port: u16) -> Result<Vec<VaultItem>, VaultError> {
        let response = self
            .http
            .get(self.url(port, "/list/object/items"))
            .send()
            .await?;
        Self::read::<Wrapped<Vec<VaultItem>>>(response)
            .await?
            .map(|wrapped| wrapped.data)
            .ok_or_else(|| VaultError::Malformed("item listing has no data".to_string()))
    }

    async fn sync(&self, port: u16) -> Result<(), VaultError> {
        let response = self.http.post(self.url(port, "/sync")).send().await?;
        Self::read::<serde_json::Value>(response).await?;
        Ok(())
    }

    async fn wait_until_ready(&self, port: u16, max_attempts: usize) -> bool {
        let mut delay = Duration::from_millis(100);
        for attempt in 0..max_attempts.max(1) {
            match self.http.get(self.url(port, "/status")).send().await {
                Ok(_) => return true,
                Err(err) => {
                    debug!(attempt, %err, "vault server not ready yet");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(2));
                }
            }
        }
        false
    }
}

/// Reads `data.template.status` out of a `/status` body. Anything malformed
/// is treated as unauthenticated.
pub fn parse_status_payload(body: &[u8]) -> ServerState {
    let parsed: Result<Envelope<StatusData>, _> = serde_json::from_slice(body);
    match parsed {
        Ok(envelope) => envelope
            .data
            .and_then(|data| data.template)
            .and_then(|template| template.status)
            .map(|status| ServerState::parse(&status))
            .unwrap_or(ServerState::Unauthenticated),
        Err(err) => {
            warn!(%err, "status payload is not valid json");
            ServerState::Unauthenticated
        }
    }
}

/// Interprets `bw status` output. The cli is only consulted when the server
/// is unreachable, and an unreachable server cannot search, so a cli
/// `unlocked` is reported as `Locked`.
pub fn reconcile_cli_status(stdout: &str) -> ServerState {
    let status = serde_json::from_str::<CliStatus>(stdout.trim())
        .ok()
        .and_then(|parsed| parsed.status)
        .map(|raw| ServerState::parse(&raw))
        .unwrap_or(ServerState::Unauthenticated);
    match status {
        ServerState::Unlocked => ServerState::Locked,
        other => other,
    }
}
