//! Provisioning collaborators

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Provisioning errors
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// The request never got a response
    #[error("provisioning request failed: {0}")]
    Request(String),

    /// The provisioner answered with a non-success status
    #[error("provisioner rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The response could not be understood
    #[error("invalid provisioner response: {0}")]
    InvalidResponse(String),
}

/// Starts and stops worker nodes
#[async_trait]
pub trait Provisioner: Send + Sync + 'static {
    /// Request one new node; returns the id it will heartbeat with
    async fn provision(&self) -> Result<String, ProvisionError>;

    /// Stop a node
    async fn terminate(&self, node_id: &str) -> Result<(), ProvisionError>;
}

/// Logs scaling commands without acting on them
#[derive(Debug, Default)]
pub struct DryRunProvisioner {
    issued: AtomicU64,
}

impl DryRunProvisioner {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Provisioner for DryRunProvisioner {
    async fn provision(&self) -> Result<String, ProvisionError> {
        let n = self.issued.fetch_add(1, Ordering::Relaxed) + 1;
        let node_id = format!("dry-run-node-{n}");
        info!(%node_id, "dry run: would provision node");
        Ok(node_id)
    }

    async fn terminate(&self, node_id: &str) -> Result<(), ProvisionError> {
        info!(node_id, "dry run: would terminate node");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ProvisionResponse {
    node_id: String,
}

#[derive(Debug, Serialize)]
struct TerminateRequest<'a> {
    node_id: &'a str,
}

/// Drives an external provisioning webhook
///
/// - `POST {base_url}/provision` answers `{"node_id": "..."}`
/// - `POST {base_url}/terminate` with `{"node_id": "..."}`
#[derive(Debug, Clone)]
pub struct HttpProvisioner {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProvisioner {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ProvisionError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProvisionError::Request(e.to_string()))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ProvisionError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ProvisionError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl Provisioner for HttpProvisioner {
    async fn provision(&self) -> Result<String, ProvisionError> {
        let response = self
            .client
            .post(self.url("provision"))
            .send()
            .await
            .map_err(|e| ProvisionError::Request(e.to_string()))?;

        let parsed: ProvisionResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ProvisionError::InvalidResponse(e.to_string()))?;

        debug!(node_id = %parsed.node_id, "provisioner accepted request");
        Ok(parsed.node_id)
    }

    async fn terminate(&self, node_id: &str) -> Result<(), ProvisionError> {
        let response = self
            .client
            .post(self.url("terminate"))
            .json(&TerminateRequest { node_id })
            .send()
            .await
            .map_err(|e| ProvisionError::Request(e.to_string()))?;

        Self::check(response).await?;
        debug!(node_id, "provisioner accepted termination");
        Ok(())
    }
}
