//! Agent transport
//!
//! HTTP client for each agent's in-container server, addressed by the
//! container DNS name. Responses are parsed defensively and oversized
//! payloads are truncated before they reach any log line.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use trinity_core::types::{CredentialFiles, TaskOutcome};

/// Readiness probe timeout
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
/// File read/write timeout
pub const FILE_TIMEOUT: Duration = Duration::from_secs(30);
/// One LLM turn; long by design
pub const TASK_TIMEOUT: Duration = Duration::from_secs(600);
/// Payloads beyond this are truncated before logging
pub const LOG_TRUNCATE_BYTES: usize = 15 * 1024;

const CONNECT_RETRIES: usize = 2;

/// Errors from agent communication
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("agent not reachable: {0}")]
    NotReachable(String),

    #[error("agent request timed out")]
    Timeout,

    #[error("agent returned {status}: {detail}")]
    RequestError { status: u16, detail: String },
}

impl From<TransportError> for trinity_core::Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotReachable(msg) => Self::AgentNotReachable(msg),
            TransportError::Timeout => Self::AgentNotReachable("request timed out".to_string()),
            TransportError::RequestError { status, detail } => {
                Self::Internal(format!("agent error {status}: {detail}"))
            }
        }
    }
}

/// Truncate a payload for logging, marking the cut
pub fn truncate_for_log(payload: &str) -> String {
    if payload.len() <= LOG_TRUNCATE_BYTES {
        return payload.to_string();
    }
    let mut cut = LOG_TRUNCATE_BYTES;
    while !payload.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…[truncated {} bytes]", &payload[..cut], payload.len() - cut)
}

/// Outbound interface to agent containers
///
/// The scheduler and lifecycle manager depend on this trait so tests can
/// swap in a scripted fake.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// `GET /health`, the readiness gate
    async fn health(&self, agent: &str) -> Result<bool, TransportError>;

    /// `POST /task` - one blocking LLM turn
    async fn task(
        &self,
        agent: &str,
        message: &str,
        execution_id: Option<&str>,
    ) -> Result<TaskOutcome, TransportError>;

    /// `POST /credentials/inject` - returns the files written
    async fn inject_files(
        &self,
        agent: &str,
        files: &CredentialFiles,
    ) -> Result<Vec<String>, TransportError>;

    /// `GET /credentials/read?paths=…` - only existing files come back
    async fn read_files(
        &self,
        agent: &str,
        paths: &[String],
    ) -> Result<CredentialFiles, TransportError>;

    /// Opaque JSON relay for dashboard/metrics/git endpoints
    async fn relay_get(&self, agent: &str, path: &str) -> Result<serde_json::Value, TransportError>;

    /// Opaque JSON relay, POST flavor
    async fn relay_post(
        &self,
        agent: &str,
        path: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError>;
}

#[derive(Serialize)]
struct TaskRequest<'a> {
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    execution_id: Option<&'a str>,
}

#[derive(Serialize)]
struct InjectRequest<'a> {
    files: &'a CredentialFiles,
}

/// Production transport over reqwest
pub struct HttpAgentTransport {
    client: reqwest::Client,
    /// Base URL with `{name}` standing for the agent, e.g.
    /// `http://agent-{name}:8000`. Tests point this at a mock server.
    base_template: String,
}

impl HttpAgentTransport {
    pub fn new() -> Self {
        Self::with_base_template("http://agent-{name}:8000")
    }

    pub fn with_base_template(base_template: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_template: base_template.into(),
        }
    }

    fn url(&self, agent: &str, path: &str) -> String {
        format!("{}{path}", self.base_template.replace("{name}", agent))
    }

    fn classify(err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::NotReachable(err.to_string())
        }
    }

    /// GET with bounded retries on connection-level failures only
    async fn get_with_retries(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<reqwest::Response, TransportError> {
        let mut last_err = None;
        for attempt in 0..=CONNECT_RETRIES {
            match self.client.get(url).timeout(timeout).send().await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_connect() && attempt < CONNECT_RETRIES => {
                    tracing::debug!(url, attempt, "connection reset, retrying");
                    last_err = Some(e);
                }
                Err(e) => return Err(Self::classify(e)),
            }
        }
        Err(Self::classify(last_err.expect("at least one attempt")))
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let detail = response.text().await.unwrap_or_default();
        Err(TransportError::RequestError {
            status: status.as_u16(),
            detail: truncate_for_log(&detail),
        })
    }
}

impl Default for HttpAgentTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentTransport for HttpAgentTransport {
    async fn health(&self, agent: &str) -> Result<bool, TransportError> {
        let url = self.url(agent, "/health");
        let response = self.get_with_retries(&url, HEALTH_TIMEOUT).await?;
        Ok(response.status().is_success())
    }

    async fn task(
        &self,
        agent: &str,
        message: &str,
        execution_id: Option<&str>,
    ) -> Result<TaskOutcome, TransportError> {
        let url = self.url(agent, "/task");
        let response = self
            .client
            .post(&url)
            .timeout(TASK_TIMEOUT)
            .json(&TaskRequest {
                message,
                execution_id,
            })
            .send()
            .await
            .map_err(Self::classify)?;
        let response = Self::check_status(response).await?;
        response
            .json::<TaskOutcome>()
            .await
            .map_err(|e| TransportError::RequestError {
                status: 200,
                detail: format!("unparseable task response: {e}"),
            })
    }

    async fn inject_files(
        &self,
        agent: &str,
        files: &CredentialFiles,
    ) -> Result<Vec<String>, TransportError> {
        let url = self.url(agent, "/credentials/inject");
        let response = self
            .client
            .post(&url)
            .timeout(FILE_TIMEOUT)
            .json(&InjectRequest { files })
            .send()
            .await
            .map_err(Self::classify)?;
        let response = Self::check_status(response).await?;
        let body: serde_json::Value =
            response.json().await.map_err(|e| TransportError::RequestError {
                status: 200,
                detail: format!("unparseable inject response: {e}"),
            })?;
        Ok(body
            .get("files_written")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn read_files(
        &self,
        agent: &str,
        paths: &[String],
    ) -> Result<CredentialFiles, TransportError> {
        let url = format!(
            "{}?paths={}",
            self.url(agent, "/credentials/read"),
            paths.join(",")
        );
        let response = self.get_with_retries(&url, FILE_TIMEOUT).await?;
        let response = Self::check_status(response).await?;
        let body: serde_json::Value =
            response.json().await.map_err(|e| TransportError::RequestError {
                status: 200,
                detail: format!("unparseable read response: {e}"),
            })?;
        let files = body
            .get("files")
            .and_then(|v| v.as_object())
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect::<HashMap<_, _>>()
            })
            .unwrap_or_default();
        Ok(files)
    }

    async fn relay_get(&self, agent: &str, path: &str) -> Result<serde_json::Value, TransportError> {
        let url = self.url(agent, path);
        let response = self.get_with_retries(&url, FILE_TIMEOUT).await?;
        let response = Self::check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| TransportError::RequestError {
                status: 200,
                detail: format!("unparseable relay response: {e}"),
            })
    }

    async fn relay_post(
        &self,
        agent: &str,
        path: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        let url = self.url(agent, path);
        let response = self
            .client
            .post(&url)
            .timeout(FILE_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(Self::classify)?;
        let response = Self::check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| TransportError::RequestError {
                status: 200,
                detail: format!("unparseable relay response: {e}"),
            })
    }
}
