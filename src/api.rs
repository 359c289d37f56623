use crate::{catalog::AvailableUi, model::ModelType};
use async_trait::async_trait;
use log::debug;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const MAX_ERROR_BODY_CHARS: usize = 300;

#[derive(Debug, Error)]
pub enum CommandError {
    /// The request was refused before any task was created.
    #[error("{0}")]
    Validation(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("backend error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("invalid endpoint: {0}")]
    InvalidUrl(String),
}

impl CommandError {
    pub fn is_validation(&self) -> bool {
        matches!(self, CommandError::Validation(_))
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelSource {
    HuggingFace,
    Civitai,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct DownloadRequest {
    pub source: ModelSource,
    pub repo_id: String,
    pub filename: String,
    pub model_type: ModelType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_sub_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

impl DownloadRequest {
    pub fn new(
        source: ModelSource,
        repo_id: impl Into<String>,
        filename: impl Into<String>,
        model_type: ModelType,
    ) -> Self {
        Self {
            source,
            repo_id: repo_id.into(),
            filename: filename.into(),
            model_type,
            custom_sub_path: None,
            revision: None,
        }
    }

    pub fn with_sub_path(mut self, sub_path: impl Into<String>) -> Self {
        self.custom_sub_path = Some(sub_path.into());
        self
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn validate(&self) -> Result<(), CommandError> {
        if self.repo_id.trim().is_empty() {
            return Err(CommandError::Validation(
                "A repository id is required.".to_string(),
            ));
        }
        if self.filename.trim().is_empty() {
            return Err(CommandError::Validation("A file name is required.".to_string()));
        }
        if self.model_type == ModelType::Unknown {
            return Err(CommandError::Validation(
                "Choose a model type for the download destination.".to_string(),
            ));
        }
        if let Some(sub_path) = &self.custom_sub_path {
            let escapes = sub_path
                .split(['/', '\\'])
                .any(|segment| segment == "..");
            if escapes || sub_path.starts_with('/') || sub_path.starts_with('\\') {
                return Err(CommandError::Validation(format!(
                    "Custom sub-path {sub_path:?} must stay inside the models folder."
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct UiInstallRequest {
    pub ui_name: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub set_as_active: bool,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct AdoptionTarget {
    pub ui_name: String,
    pub path: String,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct RepairRequest {
    pub ui_name: String,
    pub path: String,
    pub display_name: String,
    pub issues_to_fix: Vec<String>,
    pub set_as_active: bool,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct FinalizeAdoptionRequest {
    pub ui_name: String,
    pub path: String,
    pub display_name: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct UiTaskResponse {
    pub task_id: String,
    #[serde(default)]
    pub set_as_active_on_completion: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct CommandAck {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct AdoptionIssue {
    pub issue_type: String,
    pub message: String,
    #[serde(default)]
    pub is_fixable: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct AdoptionAnalysis {
    pub is_adoptable: bool,
    pub is_healthy: bool,
    #[serde(default)]
    pub issues: Vec<AdoptionIssue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_version: Option<String>,
}

impl AdoptionAnalysis {
    pub fn fixable_issue_types(&self) -> Vec<String> {
        self.issues
            .iter()
            .filter(|issue| issue.is_fixable)
            .map(|issue| issue.issue_type.clone())
            .collect()
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ManagedInstallation {
    pub installation_id: String,
    pub ui_name: String,
    pub display_name: String,
    pub install_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Switches the app's active UI selection.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ConfigurationUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_ui_installation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DownloadStarted {
    download_id: String,
}

#[derive(Debug, Deserialize)]
struct TaskIdResponse {
    task_id: String,
}

#[derive(Debug, Serialize)]
struct TaskHandle<'a> {
    task_id: &'a str,
}

/// Request/response commands understood by the launcher backend. Everything
/// that changes a task's state afterwards arrives over the task channel.
#[async_trait]
pub trait CommandApi: Send + Sync {
    async fn start_download(&self, request: &DownloadRequest) -> Result<String, CommandError>;
    async fn cancel_download(&self, task_id: &str) -> Result<CommandAck, CommandError>;
    /// Succeeds when the backend no longer knows the task.
    async fn dismiss(&self, task_id: &str) -> Result<(), CommandError>;
    async fn install_ui(&self, request: &UiInstallRequest) -> Result<UiTaskResponse, CommandError>;
    async fn run_ui(&self, installation_id: &str) -> Result<String, CommandError>;
    /// `task_id` is the process handle returned by `run_ui`.
    async fn stop_ui(&self, task_id: &str) -> Result<CommandAck, CommandError>;
    async fn cancel_ui_task(&self, task_id: &str) -> Result<CommandAck, CommandError>;
    async fn delete_ui(&self, installation_id: &str) -> Result<(), CommandError>;
    async fn analyze_adoption(
        &self,
        target: &AdoptionTarget,
    ) -> Result<AdoptionAnalysis, CommandError>;
    async fn repair_adoption(&self, request: &RepairRequest)
        -> Result<UiTaskResponse, CommandError>;
    async fn finalize_adoption(
        &self,
        request: &FinalizeAdoptionRequest,
    ) -> Result<ManagedInstallation, CommandError>;
    async fn update_configuration(&self, update: &ConfigurationUpdate) -> Result<(), CommandError>;
    async fn available_uis(&self) -> Result<Vec<AvailableUi>, CommandError>;
}

#[derive(Clone, Debug)]
pub struct HttpCommandApi {
    client: Client,
    base_url: Url,
}

impl HttpCommandApi {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, CommandError> {
        if base_url.cannot_be_a_base() {
            return Err(CommandError::InvalidUrl(base_url.to_string()));
        }
        let client = Client::builder()
            .user_agent(format!(
                "MALClient/{} ({})",
                env!("CARGO_PKG_VERSION"),
                env!("CARGO_PKG_NAME")
            ))
            .timeout(timeout)
            .tcp_nodelay(true)
            .pool_max_idle_per_host(4)
            .build()?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, CommandError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| CommandError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder, CommandError> {
        let url = self.endpoint(segments)?;
        debug!("{method} {url}");
        Ok(self.client.request(method, url))
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response, CommandError> {
        let response = request.send().await?;
        check_status(response).await
    }

    async fn execute_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, CommandError> {
        let response = self.execute(request).await?;
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|err| CommandError::Decode(err.to_string()))
    }

    async fn execute_ack(&self, request: RequestBuilder) -> Result<CommandAck, CommandError> {
        let ack: CommandAck = self.execute_json(request).await?;
        if ack.success {
            Ok(ack)
        } else {
            Err(CommandError::Rejected(ack.message))
        }
    }
}

#[async_trait]
impl CommandApi for HttpCommandApi {
    async fn start_download(&self, request: &DownloadRequest) -> Result<String, CommandError> {
        request.validate()?;
        let started: DownloadStarted = self
            .execute_json(self.request(Method::POST, &["downloads"])?.json(request))
            .await?;
        Ok(started.download_id)
    }

    async fn cancel_download(&self, task_id: &str) -> Result<CommandAck, CommandError> {
        self.execute_ack(self.request(Method::POST, &["downloads", task_id, "cancel"])?)
            .await
    }

    async fn dismiss(&self, task_id: &str) -> Result<(), CommandError> {
        let response = self
            .request(Method::DELETE, &["downloads", task_id])?
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("Dismiss of {task_id}: backend no longer tracks it");
            return Ok(());
        }
        check_status(response).await?;
        Ok(())
    }

    async fn install_ui(&self, request: &UiInstallRequest) -> Result<UiTaskResponse, CommandError> {
        self.execute_json(self.request(Method::POST, &["uis", "install"])?.json(request))
            .await
    }

    async fn run_ui(&self, installation_id: &str) -> Result<String, CommandError> {
        let started: TaskIdResponse = self
            .execute_json(self.request(Method::POST, &["uis", "run", installation_id])?)
            .await?;
        Ok(started.task_id)
    }

    async fn stop_ui(&self, task_id: &str) -> Result<CommandAck, CommandError> {
        self.execute_ack(
            self.request(Method::POST, &["uis", "stop"])?
                .json(&TaskHandle { task_id }),
        )
        .await
    }

    async fn cancel_ui_task(&self, task_id: &str) -> Result<CommandAck, CommandError> {
        self.execute_ack(
            self.request(Method::POST, &["uis", "cancel"])?
                .json(&TaskHandle { task_id }),
        )
        .await
    }

    async fn delete_ui(&self, installation_id: &str) -> Result<(), CommandError> {
        self.execute(self.request(Method::DELETE, &["uis", installation_id])?)
            .await?;
        Ok(())
    }

    async fn analyze_adoption(
        &self,
        target: &AdoptionTarget,
    ) -> Result<AdoptionAnalysis, CommandError> {
        self.execute_json(
            self.request(Method::POST, &["uis", "adopt", "analyze"])?
                .json(target),
        )
        .await
    }

    async fn repair_adoption(
        &self,
        request: &RepairRequest,
    ) -> Result<UiTaskResponse, CommandError> {
        self.execute_json(
            self.request(Method::POST, &["uis", "adopt", "repair"])?
                .json(request),
        )
        .await
    }

    async fn finalize_adoption(
        &self,
        request: &FinalizeAdoptionRequest,
    ) -> Result<ManagedInstallation, CommandError> {
        self.execute_json(
            self.request(Method::POST, &["uis", "adopt", "finalize"])?
                .json(request),
        )
        .await
    }

    async fn update_configuration(&self, update: &ConfigurationUpdate) -> Result<(), CommandError> {
        self.execute(self.request(Method::PUT, &["config"])?.json(update))
            .await?;
        Ok(())
    }

    async fn available_uis(&self) -> Result<Vec<AvailableUi>, CommandError> {
        self.execute_json(self.request(Method::GET, &["uis", "available"])?)
            .await
    }
}

async fn check_status(response: Response) -> Result<Response, CommandError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = error_detail(&body).unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    });
    if status.is_client_error() {
        Err(CommandError::Validation(message))
    } else {
        Err(CommandError::Server {
            status: status.as_u16(),
            message,
        })
    }
}

/// Human-readable reason from an error body: `detail` (string or list of
/// `{msg}` entries), then `message`, then the raw text.
fn error_detail(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        match value.get("detail") {
            Some(Value::String(detail)) => return Some(detail.clone()),
            Some(Value::Array(entries)) => {
                let messages: Vec<&str> = entries
                    .iter()
                    .filter_map(|entry| entry.get("msg").and_then(Value::as_str))
                    .collect();
                if !messages.is_empty() {
                    return Some(messages.join("; "));
                }
            }
            _ => {}
        }
        if let Some(message) = value.get("message").and_then(Value::as_str) {
            return Some(message.to_string());
        }
    }

    Some(trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect())
}
