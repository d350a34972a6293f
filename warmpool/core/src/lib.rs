//! Warmpool Core - Warm GPU Pool Control Plane
//!
//! Keeps at most one rented GPU instance warm for a generation service and
//! gates which requests may use it. The pool record lives in a [`StateStore`]
//! and every transition goes through compare-and-swap, so concurrent callers
//! never provision twice.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       Admin HTTP (axum)                          │
//! │   GET/POST /pool    POST /pool/terminate    GET /logs  /usage    │
//! └───────────────┬──────────────────────────────────┬───────────────┘
//!                 │                                  │
//! ┌───────────────▼───────────────┐       ┌──────────▼──────────┐
//! │        PoolController         │──────▶│     AuditLogger     │
//! │  configure / acquire /        │       │  append / query     │
//! │  mark_activity / terminate    │       └──────────┬──────────┘
//! └──────┬──────────────┬─────────┘                  │
//!        │              │                            │
//!   ┌────▼────┐   ┌─────▼──────┐          ┌──────────▼──────────┐
//!   │IdleReaper│  │CloudProvider│         │     StateStore      │
//!   └─────────┘   └────────────┘          │  memory | file      │
//!                                          └─────────────────────┘
//!
//! GenerationRequest ─▶ AdmissionGate ─▶ GenerationPipeline ─▶ ExecutionEngine
//!                      (classify, hydrate, validate)
//! ```
//!
//! # Module Overview
//!
//! - [`pool`]: pool record, controller state machine, idle reaper
//! - [`admission`]: classifier, model sets, workflow templates and validation
//! - [`audit`]: audit and usage rows with paginated queries
//! - [`store`]: the persisted state seam and its two implementations
//! - [`provider`]: GPU rental seam
//! - [`engine`]: ComfyUI-style execution engine seam
//! - [`pipeline`]: admission, acquire and execution wired together
//! - [`api`]: admin HTTP surface
//! - [`config`]: TOML + environment configuration
//! - [`error`]: error taxonomy

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod admission;
pub mod api;
pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod pool;
pub mod provider;
pub mod store;

pub use admission::{
    AdmissionGate, AdmittedJob, Classification, ComplexityClassifier, GenerationRequest,
    InventorySnapshot, MediaKind, ModelInventory, ModelSet, ModelSetSelector, TemplateParams,
    Tier, Violation, Workflow, WorkflowTemplateEngine,
};
pub use api::{router, serve, ApiState};
pub use audit::{AuditLogEntry, AuditLogger, LogFilter, Outcome, Page, UsageEvent};
pub use config::{default_config_path, ConfigError, ControllerConfig, RetryConfig};
pub use engine::{ComfyEngine, ExecutionEngine, JobStatus};
pub use error::{ControllerError, EngineError, ProviderError, Result, StoreError};
pub use pipeline::{GenerationPipeline, GenerationResult};
pub use pool::{
    IdleReaper, InstanceRecord, InstanceStatus, PoolController, PoolPhase, PoolRecord,
    ReapOutcome, TerminateOutcome,
};
pub use provider::{CloudProvider, HttpCloudProvider, InstanceSpec};
pub use store::{CasOutcome, FileStateStore, MemoryStateStore, StateStore, StoredPool};
