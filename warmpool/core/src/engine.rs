//! Execution Engine
//!
//! The engine runs on the pooled instance; every call names the endpoint
//! returned by `PoolController::acquire`. [`ComfyEngine`] speaks the ComfyUI
//! HTTP API:
//!
//! - `POST /prompt`                  submit `{ prompt, client_id }`, returns `prompt_id`
//! - `GET  /history/{prompt_id}`     empty object until the job finishes
//! - `GET  /object_info/{loader}`    installed model lists

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::admission::{InventorySnapshot, Workflow};
use crate::config::EngineSettings;
use crate::error::EngineError;

/// State of a submitted job
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted, not finished
    Pending,
    /// Finished; output file names
    Completed {
        /// Output files
        outputs: Vec<String>,
    },
    /// Finished with an error
    Failed {
        /// Engine-reported reason
        message: String,
    },
}

impl JobStatus {
    /// Completed or failed
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Job runner on a pooled instance
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Queue a validated workflow
    async fn submit(&self, endpoint: &str, workflow: &Workflow) -> Result<String, EngineError>;

    /// Current job state
    async fn poll_status(&self, endpoint: &str, job_id: &str) -> Result<JobStatus, EngineError>;

    /// Models installed on the instance
    async fn inventory(&self, endpoint: &str) -> Result<InventorySnapshot, EngineError>;
}

/// ComfyUI HTTP client
#[derive(Clone, Debug)]
pub struct ComfyEngine {
    client_id: String,
    http_client: reqwest::Client,
}

impl ComfyEngine {
    /// Client from settings
    pub fn from_settings(settings: &EngineSettings) -> Result<Self, EngineError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| EngineError::Unreachable(format!("http client: {e}")))?;
        Ok(Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            http_client,
        })
    }

    async fn get_json(&self, url: String) -> Result<serde_json::Value, EngineError> {
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Unreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(EngineError::Unreachable(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| EngineError::Unreachable(format!("malformed response from {url}: {e}")))
    }
}

fn base(endpoint: &str) -> &str {
    endpoint.trim_end_matches('/')
}

/// First element of `{loader}.input.required.{field}`, which ComfyUI encodes
/// as `[[names...], {options}]`
fn loader_options(info: &serde_json::Value, loader: &str, field: &str) -> BTreeSet<String> {
    info.get(loader)
        .and_then(|l| l.pointer(&format!("/input/required/{field}/0")))
        .and_then(serde_json::Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(serde_json::Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Interpret one `/history/{id}` document
fn parse_history(history: &serde_json::Value, job_id: &str) -> JobStatus {
    let Some(entry) = history.get(job_id) else {
        return JobStatus::Pending;
    };

    let status = entry.get("status");
    let status_str = status
        .and_then(|s| s.get("status_str"))
        .and_then(serde_json::Value::as_str);
    if status_str == Some("error") {
        let message = status
            .and_then(|s| s.get("messages"))
            .map(ToString::to_string)
            .unwrap_or_else(|| "execution error".to_string());
        return JobStatus::Failed { message };
    }

    let completed = status
        .and_then(|s| s.get("completed"))
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(true);
    if !completed {
        return JobStatus::Pending;
    }

    let mut outputs = Vec::new();
    if let Some(nodes) = entry.get("outputs").and_then(serde_json::Value::as_object) {
        for node in nodes.values() {
            for key in ["images", "gifs", "videos"] {
                let files = node.get(key).and_then(serde_json::Value::as_array);
                for file in files.into_iter().flatten() {
                    if let Some(name) = file.get("filename").and_then(serde_json::Value::as_str) {
                        outputs.push(name.to_string());
                    }
                }
            }
        }
    }
    JobStatus::Completed { outputs }
}

#[async_trait]
impl ExecutionEngine for ComfyEngine {
    async fn submit(&self, endpoint: &str, workflow: &Workflow) -> Result<String, EngineError> {
        let body = serde_json::json!({
            "prompt": workflow.to_api_prompt(),
            "client_id": self.client_id,
        });
        let response = self
            .http_client
            .post(format!("{}/prompt", base(endpoint)))
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Unreachable(e.to_string()))?;

        let status = response.status();
        let payload: serde_json::Value = response.json().await.unwrap_or_default();
        if !status.is_success() {
            let reason = payload
                .get("error")
                .map(ToString::to_string)
                .unwrap_or_else(|| status.to_string());
            return Err(EngineError::Rejected(reason));
        }

        payload
            .get("prompt_id")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| EngineError::Rejected("response carried no prompt_id".to_string()))
    }

    async fn poll_status(&self, endpoint: &str, job_id: &str) -> Result<JobStatus, EngineError> {
        let history = self
            .get_json(format!("{}/history/{job_id}", base(endpoint)))
            .await?;
        Ok(parse_history(&history, job_id))
    }

    async fn inventory(&self, endpoint: &str) -> Result<InventorySnapshot, EngineError> {
        let checkpoints = self
            .get_json(format!("{}/object_info/CheckpointLoaderSimple", base(endpoint)))
            .await?;
        let loras = self
            .get_json(format!("{}/object_info/LoraLoader", base(endpoint)))
            .await?;
        Ok(InventorySnapshot {
            checkpoints: loader_options(&checkpoints, "CheckpointLoaderSimple", "ckpt_name"),
            loras: loader_options(&loras, "LoraLoader", "lora_name"),
        })
    }
}
