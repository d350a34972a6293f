//! Cloud Provider
//!
//! The control plane never talks to a GPU marketplace directly; it goes through
//! the [`CloudProvider`] trait. [`HttpCloudProvider`] is the REST adapter.
//!
//! # Provider API
//!
//! - `POST   {base}/instances`            create from an [`InstanceSpec`]
//! - `DELETE {base}/instances/{contract}` destroy
//! - `GET    {connection_url}/system_stats` readiness of the engine on the instance

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::admission::{ModelSet, ModelSetSelector, Tier};
use crate::config::ProviderSettings;
use crate::error::ProviderError;
use crate::pool::InstanceRecord;

/// Requirements sent to the provider
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    /// Tier the instance is sized for
    pub tier: Tier,
    /// Whether NSFW models are preloaded
    pub nsfw: bool,
    /// Minimum total GPU memory
    pub min_gpu_ram_gb: u32,
    /// Minimum disk
    pub min_disk_gb: u32,
    /// Maximum hourly price in dollars
    pub max_hourly_price: f64,
    /// Minimum download bandwidth
    pub min_download_mbps: u32,
    /// Models to preload
    pub models: ModelSet,
}

impl InstanceSpec {
    /// Requirements for a tier
    #[must_use]
    pub fn for_tier(tier: Tier, nsfw: bool) -> Self {
        let (min_gpu_ram_gb, max_hourly_price) = match tier {
            Tier::Basic => (8, 0.5),
            Tier::Medium => (16, 1.0),
            Tier::Ultra => (48, 5.0),
        };
        Self {
            tier,
            nsfw,
            min_gpu_ram_gb,
            min_disk_gb: 150,
            max_hourly_price,
            min_download_mbps: if nsfw { 800 } else { 50 },
            models: ModelSetSelector.select(tier, nsfw),
        }
    }
}

/// External provisioning API
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Rent an instance; it is returned in `provisioning` status
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<InstanceRecord, ProviderError>;

    /// Whether the instance's engine is serving
    async fn probe_ready(&self, _instance: &InstanceRecord) -> Result<bool, ProviderError> {
        Ok(true)
    }

    /// Release an instance
    async fn destroy_instance(&self, contract_id: &str) -> Result<(), ProviderError>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedInstance {
    contract_id: String,
    connection_url: String,
}

/// REST adapter
#[derive(Clone)]
pub struct HttpCloudProvider {
    base_url: String,
    api_key: Option<String>,
    request_timeout: Duration,
    http_client: reqwest::Client,
}

impl std::fmt::Debug for HttpCloudProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCloudProvider")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

fn classify_status(status: reqwest::StatusCode, body: String) -> ProviderError {
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        ProviderError::Transient(format!("{status}: {body}"))
    } else {
        ProviderError::Rejected(format!("{status}: {body}"))
    }
}

fn classify_transport(err: reqwest::Error, timeout: Duration) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(timeout)
    } else {
        ProviderError::Transient(err.to_string())
    }
}

impl HttpCloudProvider {
    /// Adapter from settings; the API key is read from `api_key_env`
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self, ProviderError> {
        let timeout = Duration::from_secs(settings.request_timeout_secs);
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Rejected(format!("http client: {e}")))?;
        Ok(Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: std::env::var(&settings.api_key_env).ok().filter(|k| !k.is_empty()),
            request_timeout: timeout,
            http_client,
        })
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let builder = self.http_client.request(method, url);
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

#[async_trait]
impl CloudProvider for HttpCloudProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<InstanceRecord, ProviderError> {
        let response = self
            .request(reqwest::Method::POST, format!("{}/instances", self.base_url))
            .json(spec)
            .send()
            .await
            .map_err(|e| classify_transport(e, self.request_timeout))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let created: CreatedInstance = response
            .json()
            .await
            .map_err(|e| ProviderError::Rejected(format!("malformed create response: {e}")))?;

        Ok(InstanceRecord::provisioning(
            created.contract_id,
            created.connection_url,
            Utc::now(),
        ))
    }

    async fn probe_ready(&self, instance: &InstanceRecord) -> Result<bool, ProviderError> {
        let url = format!(
            "{}/system_stats",
            instance.connection_url.trim_end_matches('/')
        );
        match self
            .http_client
            .get(url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => Ok(response.status().is_success()),
            // Not listening yet
            Err(_) => Ok(false),
        }
    }

    async fn destroy_instance(&self, contract_id: &str) -> Result<(), ProviderError> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                format!("{}/instances/{contract_id}", self.base_url),
            )
            .send()
            .await
            .map_err(|e| classify_transport(e, self.request_timeout))?;

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_status(status, body))
        }
    }
}
