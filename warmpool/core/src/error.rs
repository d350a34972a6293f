//! Error Taxonomy
//!
//! Every failure that leaves the control plane carries a stable taxonomy code
//! so callers can tell "try again later" apart from "this request is invalid".
//!
//! # Propagation
//!
//! ```text
//! ProviderError (transient) --retry w/ backoff--> exhausted --> NoGpuAvailable
//! StoreError ------------------------------------------------> StateStoreIo (fatal)
//! Violation* ------------------------------------------------> ValidationFailed
//! ```

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::admission::Violation;

/// Errors raised by a [`crate::store::StateStore`]
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying file or device failure
    #[error("state store I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted data could not be encoded or decoded
    #[error("state store data corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Errors raised by a [`crate::provider::CloudProvider`]
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Network hiccup, rate limit, 5xx: worth retrying
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// The provider refused the request outright
    #[error("provider rejected request: {0}")]
    Rejected(String),

    /// A single call did not finish within its deadline
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),
}

impl ProviderError {
    /// Whether the call should be retried with backoff
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Errors raised by an [`crate::engine::ExecutionEngine`]
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The engine could not be reached
    #[error("execution engine unreachable: {0}")]
    Unreachable(String),

    /// The engine refused the workflow
    #[error("execution engine rejected workflow: {0}")]
    Rejected(String),

    /// The job ran and failed
    #[error("job {job_id} failed: {message}")]
    JobFailed {
        /// Engine-assigned job id
        job_id: String,
        /// Engine-reported failure
        message: String,
    },

    /// The job did not finish within the configured deadline
    #[error("job {0} did not complete in time")]
    JobTimeout(String),
}

/// Kind of model identifier referenced by a workflow node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// Base checkpoint
    Checkpoint,
    /// LoRA adapter
    Lora,
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Checkpoint => write!(f, "checkpoint"),
            Self::Lora => write!(f, "lora"),
        }
    }
}

/// Top-level control plane error
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Provisioning failed, was abandoned, or the bounded wait expired
    #[error("no GPU available: {reason}")]
    NoGpuAvailable {
        /// Human-readable cause (last provider error, timeout, ...)
        reason: String,
        /// Suggested wait before retrying
        retry_after: Duration,
    },

    /// A provisioning call exceeded its deadline on every attempt
    #[error("provisioning timed out after {0:?}")]
    ProvisioningTimeout(Duration),

    /// The workflow graph or its parameters are invalid
    #[error("workflow validation failed: {}", join_violations(.0))]
    ValidationFailed(Vec<Violation>),

    /// A referenced model is not installed
    #[error("{kind} '{name}' not found")]
    ModelNotFound {
        /// Checkpoint or LoRA
        kind: ModelKind,
        /// The missing identifier
        name: String,
    },

    /// Unknown template name
    #[error("template '{0}' not found")]
    TemplateNotFound(String),

    /// A template parameter is outside its documented range
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter {
        /// Parameter name as it appears in requests
        name: &'static str,
        /// Range or type that was violated
        reason: String,
    },

    /// Missing or invalid admin credential
    #[error("forbidden")]
    Forbidden,

    /// The persisted state record is unreliable; the process must restart
    #[error("state store failure: {0}")]
    StateStoreIo(#[from] StoreError),

    /// The execution engine failed after dispatch
    #[error(transparent)]
    Engine(#[from] EngineError),
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ControllerError {
    /// Stable taxonomy code surfaced to callers
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoGpuAvailable { .. } => "NO_GPU_AVAILABLE",
            Self::ProvisioningTimeout(_) => "PROVISIONING_TIMEOUT",
            Self::ValidationFailed(_) => "WORKFLOW_VALIDATION_FAILED",
            Self::ModelNotFound {
                kind: ModelKind::Checkpoint,
                ..
            } => "CHECKPOINT_NOT_FOUND",
            Self::ModelNotFound {
                kind: ModelKind::Lora,
                ..
            } => "LORA_NOT_FOUND",
            Self::TemplateNotFound(_) => "TEMPLATE_NOT_FOUND",
            Self::InvalidParameter { .. } => "INVALID_PARAMETER",
            Self::Forbidden => "FORBIDDEN",
            Self::StateStoreIo(_) => "STATE_STORE_IO",
            Self::Engine(_) => "EXECUTION_FAILED",
        }
    }

    /// How long the caller should wait before retrying, if retrying makes sense
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::NoGpuAvailable { retry_after, .. } => Some(*retry_after),
            Self::ProvisioningTimeout(_) => Some(Duration::from_secs(60)),
            _ => None,
        }
    }

    /// Whether the controller must stop operating on its state record
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StateStoreIo(_))
    }

    /// Whether the request itself was refused (as opposed to failing while running)
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::ValidationFailed(_)
                | Self::ModelNotFound { .. }
                | Self::TemplateNotFound(_)
                | Self::InvalidParameter { .. }
                | Self::Forbidden
        )
    }

    /// Structured details for error responses
    #[must_use]
    pub fn details(&self) -> serde_json::Value {
        match self {
            Self::ValidationFailed(violations) => serde_json::json!({
                "violations": violations.iter().map(ToString::to_string).collect::<Vec<_>>(),
            }),
            Self::ModelNotFound { kind, name } => serde_json::json!({ "kind": kind, "name": name }),
            Self::NoGpuAvailable { retry_after, .. } => {
                serde_json::json!({ "retryAfterSecs": retry_after.as_secs() })
            }
            Self::TemplateNotFound(name) => serde_json::json!({ "template": name }),
            Self::InvalidParameter { name, reason } => {
                serde_json::json!({ "parameter": name, "reason": reason })
            }
            _ => serde_json::json!({}),
        }
    }

    pub(crate) fn no_gpu(reason: impl Into<String>) -> Self {
        Self::NoGpuAvailable {
            reason: reason.into(),
            retry_after: Duration::from_secs(120),
        }
    }
}

/// Result alias for control plane operations
pub type Result<T, E = ControllerError> = std::result::Result<T, E>;
