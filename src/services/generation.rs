use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::services::credit_gate::OperationType;

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("generation service is not configured")]
    NotConfigured,
    #[error("generation request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("generation service returned {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("generation task {task_id} did not succeed: {status}")]
    TaskFailed { task_id: String, status: String },
    #[error("invalid generation response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub operation: OperationType,
    pub prompt: String,
    #[serde(default)]
    pub options: Value,
}

/// Confirmed output of a finished external task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    pub task_id: String,
    pub output_urls: Vec<String>,
}

/// External image/video generation collaborator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult, GenerationError>;
}

pub struct HttpGenerationClient {
    pub client: Client,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

impl HttpGenerationClient {
    pub fn new(client: Client, base_url: Option<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.map(|url| url.trim_end_matches('/').to_string()),
            api_key,
        }
    }
}

#[async_trait]
impl GenerationClient for HttpGenerationClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult, GenerationError> {
        let base_url = self.base_url.as_deref().ok_or(GenerationError::NotConfigured)?;

        let mut builder = self
            .client
            .post(format!("{base_url}/v1/generations"))
            .json(&json!({
                "type": request.operation.as_str(),
                "prompt": request.prompt,
                "options": request.options,
            }));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let res = builder.send().await?;
        let status = res.status();
        if !status.is_success() {
            let message = res.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), %message, "generation service rejected request");
            return Err(GenerationError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        let body: Value = res
            .json()
            .await
            .map_err(|err| GenerationError::InvalidResponse(err.to_string()))?;
        let data = body.get("data").unwrap_or(&body);

        let task_id = data["taskId"]
            .as_str()
            .ok_or_else(|| GenerationError::InvalidResponse("missing taskId".into()))?
            .to_string();
        let task_status = data["status"].as_str().unwrap_or("succeeded");
        if !matches!(task_status, "succeeded" | "success" | "completed") {
            return Err(GenerationError::TaskFailed {
                task_id,
                status: task_status.to_string(),
            });
        }

        let output_urls = data["outputUrls"]
            .as_array()
            .map(|urls| {
                urls.iter()
                    .filter_map(|u| u.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        debug!(%task_id, "generation task completed");
        Ok(GenerationResult {
            task_id,
            output_urls,
        })
    }
}
