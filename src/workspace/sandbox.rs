use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::models::{SessionKey, slugify};
use crate::errors::ServiceError;

/// Sandbox names double as DNS labels in preview URLs.
const MAX_SANDBOX_NAME: usize = 63;

/// Status reported by the provisioning service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Pending,
    Provisioning,
    Running,
    Error,
    #[serde(other)]
    Unknown,
}

/// What to launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceRequest {
    pub owner: String,
    pub repo: String,
    pub branch: String,
    /// Deterministic name; see [`sandbox_name`].
    pub name: String,
}

/// Response to a create call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreatedInstance {
    pub id: String,
    pub status: SandboxStatus,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Response to a status call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstanceStatus {
    pub status: SandboxStatus,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Ephemeral preview sandboxes.
#[async_trait]
pub trait SandboxService: Send + Sync {
    async fn create_instance(&self, request: &InstanceRequest)
    -> Result<CreatedInstance, ServiceError>;

    async fn get_status(&self, remote_id: &str) -> Result<InstanceStatus, ServiceError>;

    /// Best effort; callers log failures and move on.
    async fn destroy_instance(&self, remote_id: &str) -> Result<(), ServiceError>;
}

/// Deterministic sandbox name for a session and branch.
pub fn sandbox_name(key: &SessionKey, branch: &str) -> String {
    let name = slugify(
        &format!("{}-{}-{}", key.owner, key.repo, branch),
        MAX_SANDBOX_NAME,
    );
    if name.is_empty() {
        "preview".to_string()
    } else {
        name
    }
}

/// Substitute `{name}` in a preview URL template.
pub fn preview_url(template: &str, name: &str) -> String {
    template.replace("{name}", name)
}

/// HTTP implementation of [`SandboxService`].
///
/// ```text
/// POST   {api}/v1/previews        → CreatedInstance
/// GET    {api}/v1/previews/{id}   → InstanceStatus
/// DELETE {api}/v1/previews/{id}
/// ```
pub struct SandboxClient {
    http: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SandboxErrorBody {
    error: String,
}

async fn api_error(resp: reqwest::Response) -> ServiceError {
    let status = resp.status().as_u16();
    let message = match resp.text().await {
        Ok(body) => serde_json::from_str::<SandboxErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or(body),
        Err(e) => e.to_string(),
    };
    ServiceError::Api { status, message }
}

impl SandboxClient {
    pub fn new(api_url: &str, token: Option<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.header("Authorization", format!("Bearer {}", token)),
            None => req,
        }
    }

    fn instance_url(&self, remote_id: &str) -> String {
        format!("{}/v1/previews/{}", self.api_url, remote_id)
    }
}

#[async_trait]
impl SandboxService for SandboxClient {
    async fn create_instance(
        &self,
        request: &InstanceRequest,
    ) -> Result<CreatedInstance, ServiceError> {
        let resp = self
            .authorize(self.http.post(format!("{}/v1/previews", self.api_url)))
            .json(request)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }
        Ok(resp.json().await?)
    }

    async fn get_status(&self, remote_id: &str) -> Result<InstanceStatus, ServiceError> {
        let resp = self
            .authorize(self.http.get(self.instance_url(remote_id)))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }
        Ok(resp.json().await?)
    }

    async fn destroy_instance(&self, remote_id: &str) -> Result<(), ServiceError> {
        let resp = self
            .authorize(self.http.delete(self.instance_url(remote_id)))
            .send()
            .await?;
        if resp.status().is_success() || resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(api_error(resp).await)
    }
}
