//! Generation pipeline
//!
//! End-to-end path of one request:
//!
//! ```text
//! admit ─▶ acquire_for(tier, nsfw) ─▶ [live inventory check] ─▶ submit ─▶ poll ─▶ usage row
//!                                                                   │
//!                                                   mark_activity ◀─┘ (every poll)
//! ```
//!
//! Exactly one usage row is written per request, whatever the outcome.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;

use crate::admission::{AdmissionGate, GenerationRequest, Tier, Violation};
use crate::audit::{Outcome, UsageEvent};
use crate::config::{deadline_after, EngineSettings};
use crate::engine::{ExecutionEngine, JobStatus};
use crate::error::{ControllerError, EngineError, Result};
use crate::pool::PoolController;

/// A finished generation
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    /// Request id
    pub request_id: String,
    /// Engine job id
    pub job_id: String,
    /// Tier the request ran at
    pub tier: Tier,
    /// Output files
    pub outputs: Vec<String>,
    /// Wall-clock time
    pub duration_ms: u64,
}

/// Admission, pooling and execution wired together
pub struct GenerationPipeline {
    gate: Arc<AdmissionGate>,
    controller: PoolController,
    engine: Arc<dyn ExecutionEngine>,
    settings: EngineSettings,
    verify_inventory: bool,
}

impl GenerationPipeline {
    /// Create a pipeline
    pub fn new(
        gate: Arc<AdmissionGate>,
        controller: PoolController,
        engine: Arc<dyn ExecutionEngine>,
    ) -> Self {
        let settings = controller.config().engine.clone();
        Self {
            gate,
            controller,
            engine,
            settings,
            verify_inventory: true,
        }
    }

    /// Skip the live inventory check before submit
    #[must_use]
    pub fn without_inventory_check(mut self) -> Self {
        self.verify_inventory = false;
        self
    }

    /// Run one request to completion
    pub async fn run(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        let started = Instant::now();
        let classification = self.gate.classify(&request.prompt);

        let result = self.execute(request, started).await;

        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(err) if err.is_rejection() => Outcome::Denied,
            Err(_) => Outcome::Error,
        };
        self.controller.audit().record_usage(UsageEvent {
            ts: Utc::now(),
            request_id: request.request_id.clone(),
            tier: classification.tier,
            nsfw: classification.nsfw,
            duration_ms: elapsed_ms(started),
            outcome,
        })?;

        result
    }

    async fn execute(&self, request: &GenerationRequest, started: Instant) -> Result<GenerationResult> {
        let job = self.gate.admit(request)?;
        let tier = job.classification.tier;
        let endpoint = self
            .controller
            .acquire_for(&request.request_id, tier, job.classification.nsfw)
            .await?;

        if self.verify_inventory {
            let live = self.engine.inventory(&endpoint).await?;
            let violations = job.workflow.violations(&live);
            if let Some(Violation::MissingModel { model, name, .. }) = violations
                .iter()
                .find(|v| matches!(v, Violation::MissingModel { .. }))
            {
                return Err(ControllerError::ModelNotFound {
                    kind: *model,
                    name: name.clone(),
                });
            }
            if !violations.is_empty() {
                return Err(ControllerError::ValidationFailed(violations));
            }
        }

        let job_id = self.engine.submit(&endpoint, &job.workflow).await?;
        tracing::info!(request_id = %request.request_id, job_id = %job_id, %tier, "Job submitted");
        self.controller.mark_activity(&request.request_id)?;

        let deadline = deadline_after(self.settings.job_timeout());
        let outputs = loop {
            tokio::time::sleep(self.settings.poll_interval()).await;
            let status = self.engine.poll_status(&endpoint, &job_id).await?;
            self.controller.mark_activity(&request.request_id)?;
            match status {
                JobStatus::Completed { outputs } => break outputs,
                JobStatus::Failed { message } => {
                    return Err(EngineError::JobFailed { job_id, message }.into());
                }
                JobStatus::Pending if tokio::time::Instant::now() >= deadline => {
                    return Err(EngineError::JobTimeout(job_id).into());
                }
                JobStatus::Pending => {}
            }
        };

        tracing::info!(
            request_id = %request.request_id,
            job_id = %job_id,
            outputs = outputs.len(),
            "Job completed"
        );
        Ok(GenerationResult {
            request_id: request.request_id.clone(),
            job_id,
            tier,
            outputs,
            duration_ms: elapsed_ms(started),
        })
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
