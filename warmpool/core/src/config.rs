//! Controller Configuration
//!
//! One [`ControllerConfig`] is built at startup and shared by reference with
//! every component. Sources are layered:
//!
//! ```text
//! defaults -> TOML file -> WARMPOOL_* environment -> CLI overrides
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::admission::Tier;

/// Longest idle threshold accepted (one year)
pub const MAX_IDLE_MINUTES: u64 = 365 * 24 * 60;

/// Longest interval or timeout accepted for any wait (one week)
pub const MAX_WAIT_SECS: u64 = 7 * 24 * 60 * 60;

/// `now + wait` on the tokio clock, saturating at [`MAX_WAIT_SECS`]
#[must_use]
pub fn deadline_after(wait: Duration) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    now.checked_add(wait)
        .or_else(|| now.checked_add(Duration::from_secs(MAX_WAIT_SECS)))
        .unwrap_or(now)
}

fn bounded_secs(secs: u64) -> Duration {
    Duration::from_secs(secs.min(MAX_WAIT_SECS))
}

/// Errors while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read config {path:?}: {source}")]
    Read {
        /// Path that failed
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema
    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        /// Path that failed
        path: PathBuf,
        /// Underlying TOML error
        source: toml::de::Error,
    },

    /// A value is out of range
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Dotted field name
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

// ============================================================================
// Sections
// ============================================================================

/// Warm pool lifecycle settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Idle minutes before the reaper evicts a warm instance
    pub idle_minutes: u64,
    /// Reaper tick interval
    pub reaper_interval_secs: u64,
    /// Upper bound on how long `acquire` may suspend a caller
    pub acquire_timeout_secs: u64,
    /// Deadline for a single `CreateInstance` call
    pub provision_timeout_secs: u64,
    /// Deadline for a created instance to start serving
    pub ready_timeout_secs: u64,
    /// Poll interval while waiting for readiness
    pub ready_poll_interval_secs: u64,
    /// Activity within this window keeps the instance `running` instead of `idle`
    pub activity_window_secs: u64,
    /// Tier used to size instances provisioned without a request (Configure)
    pub default_tier: Tier,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            idle_minutes: 15,
            reaper_interval_secs: 60,
            acquire_timeout_secs: 900,
            provision_timeout_secs: 600,
            ready_timeout_secs: 900,
            ready_poll_interval_secs: 10,
            activity_window_secs: 60,
            default_tier: Tier::Medium,
        }
    }
}

impl PoolSettings {
    /// Idle threshold as a chrono duration
    #[must_use]
    pub fn idle_threshold(&self) -> chrono::Duration {
        i64::try_from(self.idle_minutes.min(MAX_IDLE_MINUTES))
            .ok()
            .and_then(chrono::Duration::try_minutes)
            .unwrap_or(chrono::Duration::MAX)
    }

    /// Activity window as a chrono duration
    #[must_use]
    pub fn activity_window(&self) -> chrono::Duration {
        i64::try_from(self.activity_window_secs.min(MAX_WAIT_SECS))
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    /// Reaper interval
    #[must_use]
    pub fn reaper_interval(&self) -> Duration {
        bounded_secs(self.reaper_interval_secs)
    }

    /// Acquire wait bound
    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        bounded_secs(self.acquire_timeout_secs)
    }

    /// Per-call provisioning deadline
    #[must_use]
    pub fn provision_timeout(&self) -> Duration {
        bounded_secs(self.provision_timeout_secs)
    }

    /// Readiness deadline
    #[must_use]
    pub fn ready_timeout(&self) -> Duration {
        bounded_secs(self.ready_timeout_secs)
    }

    /// Readiness poll interval
    #[must_use]
    pub fn ready_poll_interval(&self) -> Duration {
        bounded_secs(self.ready_poll_interval_secs)
    }
}

/// Retry configuration for provider calls
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Initial backoff delay
    pub initial_backoff_ms: u64,
    /// Maximum backoff delay
    pub max_backoff_ms: u64,
    /// Backoff multiplier
    pub backoff_multiplier: f32,
    /// Add jitter to backoff
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for attempt N (0-indexed)
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_backoff_ms as f64 * f64::from(self.backoff_multiplier).powi(exponent);
        let capped = base.min(self.max_backoff_ms as f64);

        let duration_ms = if self.use_jitter {
            // Add up to 25% jitter
            let jitter = rand::random::<f64>() * 0.25;
            (capped * (1.0 + jitter)) as u64
        } else {
            capped as u64
        };

        Duration::from_millis(duration_ms)
    }

    /// Total attempts including the first
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Admin credential settings
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminSettings {
    /// Shared admin key; when unset every admin call is forbidden
    pub api_key: Option<String>,
    /// Salt mixed into actor fingerprints
    pub audit_salt: String,
}

impl std::fmt::Debug for AdminSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminSettings")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("audit_salt", &"<redacted>")
            .finish()
    }
}

/// HTTP server settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Listen address for the admin surface
    pub listen_addr: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8787".to_string(),
        }
    }
}

/// Persistence settings
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Directory for the durable store (None = XDG data dir)
    pub data_dir: Option<PathBuf>,
    /// Keep state in memory only
    pub ephemeral: bool,
}

impl StorageSettings {
    /// Resolved data directory
    #[must_use]
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("warmpool")
        })
    }
}

/// Cloud provider endpoint settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Base URL of the provisioning API
    pub base_url: String,
    /// Environment variable holding the provider API key
    pub api_key_env: String,
    /// Per-request HTTP timeout
    pub request_timeout_secs: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9400/api/v0".to_string(),
            api_key_env: "WARMPOOL_PROVIDER_API_KEY".to_string(),
            request_timeout_secs: 30,
        }
    }
}

/// Execution engine client settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Per-request HTTP timeout
    pub request_timeout_secs: u64,
    /// Poll interval while a job runs
    pub poll_interval_ms: u64,
    /// Upper bound on a single job
    pub job_timeout_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            poll_interval_ms: 2_000,
            job_timeout_secs: 600,
        }
    }
}

impl EngineSettings {
    /// Poll interval
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.min(MAX_WAIT_SECS * 1000))
    }

    /// Job deadline
    #[must_use]
    pub fn job_timeout(&self) -> Duration {
        bounded_secs(self.job_timeout_secs)
    }
}

// ============================================================================
// Full configuration
// ============================================================================

/// Complete controller configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Pool lifecycle
    pub pool: PoolSettings,
    /// Provider retry policy
    pub retry: RetryConfig,
    /// Admin credentials
    pub admin: AdminSettings,
    /// HTTP surface
    pub server: ServerSettings,
    /// Persistence
    pub storage: StorageSettings,
    /// Provisioning API
    pub provider: ProviderSettings,
    /// Execution engine client
    pub engine: EngineSettings,
}

/// Default config file location
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("warmpool").join("controller.toml"))
}

impl ControllerConfig {
    /// Parse a TOML document
    pub fn from_toml_str(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from an explicit path
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw, path)
    }

    /// Load defaults, then the file (explicit or default location if present),
    /// then environment overrides, then validate.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::load_from_path(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::load_from_path(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `WARMPOOL_*` environment overrides
    pub fn apply_env(&mut self) {
        fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok().and_then(|v| v.parse().ok())
        }

        if let Some(v) = env_parse("WARMPOOL_IDLE_MINUTES") {
            self.pool.idle_minutes = v;
        }
        if let Some(v) = env_parse("WARMPOOL_REAPER_INTERVAL_SECS") {
            self.pool.reaper_interval_secs = v;
        }
        if let Some(v) = env_parse("WARMPOOL_ACQUIRE_TIMEOUT_SECS") {
            self.pool.acquire_timeout_secs = v;
        }
        if let Some(v) = env_parse("WARMPOOL_PROVISION_TIMEOUT_SECS") {
            self.pool.provision_timeout_secs = v;
        }
        if let Some(v) = env_parse("WARMPOOL_READY_TIMEOUT_SECS") {
            self.pool.ready_timeout_secs = v;
        }
        if let Some(v) = env_parse("WARMPOOL_MAX_RETRIES") {
            self.retry.max_retries = v;
        }
        if let Ok(key) = std::env::var("WARMPOOL_ADMIN_KEY") {
            if !key.is_empty() {
                self.admin.api_key = Some(key);
            }
        }
        if let Ok(salt) = std::env::var("WARMPOOL_AUDIT_SALT") {
            self.admin.audit_salt = salt;
        }
        if let Ok(addr) = std::env::var("WARMPOOL_LISTEN") {
            self.server.listen_addr = addr;
        }
        if let Ok(dir) = std::env::var("WARMPOOL_DATA_DIR") {
            self.storage.data_dir = Some(PathBuf::from(dir));
        }
        if let Ok(url) = std::env::var("WARMPOOL_PROVIDER_URL") {
            self.provider.base_url = url;
        }
    }

    /// Reject values the controller cannot operate with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("pool.idle_minutes", self.pool.idle_minutes),
            ("pool.reaper_interval_secs", self.pool.reaper_interval_secs),
            ("pool.acquire_timeout_secs", self.pool.acquire_timeout_secs),
            ("pool.provision_timeout_secs", self.pool.provision_timeout_secs),
            ("pool.ready_timeout_secs", self.pool.ready_timeout_secs),
            ("pool.ready_poll_interval_secs", self.pool.ready_poll_interval_secs),
            ("engine.poll_interval_ms", self.engine.poll_interval_ms),
            ("engine.job_timeout_secs", self.engine.job_timeout_secs),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        let bounded = [
            ("pool.idle_minutes", self.pool.idle_minutes, MAX_IDLE_MINUTES),
            ("pool.reaper_interval_secs", self.pool.reaper_interval_secs, MAX_WAIT_SECS),
            ("pool.acquire_timeout_secs", self.pool.acquire_timeout_secs, MAX_WAIT_SECS),
            ("pool.provision_timeout_secs", self.pool.provision_timeout_secs, MAX_WAIT_SECS),
            ("pool.ready_timeout_secs", self.pool.ready_timeout_secs, MAX_WAIT_SECS),
            ("pool.ready_poll_interval_secs", self.pool.ready_poll_interval_secs, MAX_WAIT_SECS),
            ("pool.activity_window_secs", self.pool.activity_window_secs, MAX_WAIT_SECS),
            ("engine.request_timeout_secs", self.engine.request_timeout_secs, MAX_WAIT_SECS),
            ("engine.poll_interval_ms", self.engine.poll_interval_ms, MAX_WAIT_SECS * 1000),
            ("engine.job_timeout_secs", self.engine.job_timeout_secs, MAX_WAIT_SECS),
            ("provider.request_timeout_secs", self.provider.request_timeout_secs, MAX_WAIT_SECS),
            ("retry.max_backoff_ms", self.retry.max_backoff_ms, MAX_WAIT_SECS * 1000),
        ];
        for (field, value, max) in bounded {
            if value > max {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{value} exceeds the maximum of {max}"),
                });
            }
        }

        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::Invalid {
                field: "retry.initial_backoff_ms",
                reason: format!(
                    "{} exceeds retry.max_backoff_ms {}",
                    self.retry.initial_backoff_ms, self.retry.max_backoff_ms
                ),
            });
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                field: "retry.backoff_multiplier",
                reason: "must be at least 1.0".to_string(),
            });
        }

        if matches!(self.admin.api_key.as_deref(), Some("")) {
            return Err(ConfigError::Invalid {
                field: "admin.api_key",
                reason: "must not be empty when set".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff() {
        let config = RetryConfig {
            initial_backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 1000,
            use_jitter: false,
            ..Default::default()
        };

        assert_eq!(config.backoff_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_millis(400));
        assert_eq!(config.backoff_for_attempt(3), Duration::from_millis(800));
        assert_eq!(config.backoff_for_attempt(4), Duration::from_millis(1000)); // Capped
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let raw = r#"
            [pool]
            idle_minutes = 30
            default_tier = "ultra"

            [admin]
            api_key = "s3cret"
        "#;
        let config = ControllerConfig::from_toml_str(raw, Path::new("test.toml")).unwrap();
        assert_eq!(config.pool.idle_minutes, 30);
        assert_eq!(config.pool.default_tier, Tier::Ultra);
        assert_eq!(config.pool.reaper_interval_secs, 60);
        assert_eq!(config.admin.api_key.as_deref(), Some("s3cret"));
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn test_validation_rejects_zero_interval() {
        let mut config = ControllerConfig::default();
        config.pool.reaper_interval_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "pool.reaper_interval_secs",
                ..
            })
        ));
    }

    #[test]
    fn test_validation_rejects_huge_idle_minutes() {
        let mut config = ControllerConfig::default();
        config.pool.idle_minutes = 1_000_000_000_000_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "pool.idle_minutes",
                ..
            })
        ));

        config.pool.idle_minutes = MAX_IDLE_MINUTES;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_huge_acquire_timeout() {
        let mut config = ControllerConfig::default();
        config.pool.acquire_timeout_secs = u64::MAX;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "pool.acquire_timeout_secs",
                ..
            })
        ));
    }

    #[test]
    fn test_unvalidated_durations_saturate() {
        let pool = PoolSettings {
            idle_minutes: u64::MAX,
            activity_window_secs: u64::MAX,
            acquire_timeout_secs: u64::MAX,
            ..Default::default()
        };
        assert_eq!(
            pool.idle_threshold(),
            chrono::Duration::try_minutes(MAX_IDLE_MINUTES as i64).unwrap()
        );
        assert_eq!(
            pool.activity_window(),
            chrono::Duration::try_seconds(MAX_WAIT_SECS as i64).unwrap()
        );
        assert_eq!(pool.acquire_timeout(), Duration::from_secs(MAX_WAIT_SECS));
    }

    #[tokio::test]
    async fn test_deadline_after_never_overflows() {
        let before = tokio::time::Instant::now();
        let deadline = deadline_after(Duration::MAX);
        assert!(deadline >= before + Duration::from_secs(MAX_WAIT_SECS));
    }

    #[test]
    fn test_validation_rejects_inverted_backoff() {
        let mut config = ControllerConfig::default();
        config.retry.initial_backoff_ms = 5_000;
        config.retry.max_backoff_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_admin_debug_redacts_key() {
        let admin = AdminSettings {
            api_key: Some("topsecret".to_string()),
            audit_salt: "salt".to_string(),
        };
        let rendered = format!("{admin:?}");
        assert!(!rendered.contains("topsecret"));
        assert!(!rendered.contains("salt\""));
    }
}
