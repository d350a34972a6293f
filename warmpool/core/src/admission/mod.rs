//! Admission Gate
//!
//! Decides whether a generation request may consume the pool. Everything here
//! is synchronous and side-effect free except the rejection audit row.
//!
//! ```text
//! GenerationRequest
//!       │
//!       ▼
//! ComplexityClassifier ──▶ (tier, nsfw, media)
//!       │                        │
//!       │                        ▼
//!       │                 ModelSetSelector ──▶ ModelSet (what to preload)
//!       ▼
//! WorkflowTemplateEngine::hydrate ──▶ Workflow
//!       │
//!       ▼
//! WorkflowTemplateEngine::validate(inventory)
//!       │
//!   ok ─┴─ err ──▶ audit(admission_rejected, denied) ──▶ caller
//!   │
//!   ▼
//! AdmittedJob
//! ```

pub mod classifier;
pub mod models;
pub mod template;
pub mod workflow;

pub use classifier::{Classification, ComplexityClassifier, MediaKind, Tier};
pub use models::{InventorySnapshot, ModelInventory, ModelSet, ModelSetSelector};
pub use template::{
    ParamKey, TemplateParams, TemplateRegistry, WorkflowTemplate, WorkflowTemplateEngine,
};
pub use workflow::{GraphBuilder, Link, Node, NodeInput, NodeOutput, Violation, Workflow};

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::audit::{AuditLogEntry, AuditLogger, Outcome};
use crate::error::{ControllerError, Result};

/// An inbound generation request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    /// Caller-chosen id, echoed in usage rows
    pub request_id: String,
    /// Free-text prompt; classified and used as the positive prompt
    pub prompt: String,
    /// Explicit template; chosen from the classification when absent
    #[serde(default)]
    pub template: Option<String>,
    /// Parameter overrides
    #[serde(default)]
    pub params: TemplateParams,
}

impl GenerationRequest {
    /// Request with just a prompt
    pub fn new(request_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            prompt: prompt.into(),
            template: None,
            params: TemplateParams::default(),
        }
    }

    /// Pin a template
    #[must_use]
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    /// Override parameters
    #[must_use]
    pub fn with_params(mut self, params: TemplateParams) -> Self {
        self.params = params;
        self
    }
}

/// A request that passed the gate
#[derive(Clone, Debug)]
pub struct AdmittedJob {
    /// Request id
    pub request_id: String,
    /// Classifier output
    pub classification: Classification,
    /// Models the instance needs
    pub models: ModelSet,
    /// Template used
    pub template: String,
    /// Hydrated, validated graph
    pub workflow: Workflow,
}

/// Classification + hydration + validation
pub struct AdmissionGate {
    classifier: ComplexityClassifier,
    selector: ModelSetSelector,
    templates: WorkflowTemplateEngine,
    inventory: Arc<dyn ModelInventory>,
    audit: Option<AuditLogger>,
}

impl AdmissionGate {
    /// Gate over a template engine and an inventory snapshot
    pub fn new(templates: WorkflowTemplateEngine, inventory: Arc<dyn ModelInventory>) -> Self {
        Self {
            classifier: ComplexityClassifier,
            selector: ModelSetSelector,
            templates,
            inventory,
            audit: None,
        }
    }

    /// Audit rejections
    #[must_use]
    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = Some(audit);
        self
    }

    /// The template engine
    #[must_use]
    pub fn templates(&self) -> &WorkflowTemplateEngine {
        &self.templates
    }

    /// Classify only
    #[must_use]
    pub fn classify(&self, prompt: &str) -> Classification {
        self.classifier.classify(prompt)
    }

    /// Run the gate
    pub fn admit(&self, request: &GenerationRequest) -> Result<AdmittedJob> {
        let classification = self.classifier.classify(&request.prompt);
        match self.evaluate(request, &classification) {
            Ok(job) => {
                tracing::debug!(
                    request_id = %request.request_id,
                    tier = %job.classification.tier,
                    template = %job.template,
                    "Admitted request"
                );
                Ok(job)
            }
            Err(err) => {
                tracing::warn!(
                    request_id = %request.request_id,
                    code = err.code(),
                    error = %err,
                    "Admission rejected"
                );
                self.audit_rejection(request, &classification, &err)?;
                Err(err)
            }
        }
    }

    fn evaluate(
        &self,
        request: &GenerationRequest,
        classification: &Classification,
    ) -> Result<AdmittedJob> {
        let template = request.template.clone().unwrap_or_else(|| {
            self.templates
                .registry()
                .default_for(classification.media, classification.nsfw)
                .to_string()
        });

        let mut params = request.params.clone();
        if params.prompt.is_none() {
            params.prompt = Some(request.prompt.clone());
        }

        let workflow = self.templates.hydrate(&template, &params)?;
        self.templates.validate(&workflow, self.inventory.as_ref())?;

        Ok(AdmittedJob {
            request_id: request.request_id.clone(),
            classification: classification.clone(),
            models: self.selector.select(classification.tier, classification.nsfw),
            template,
            workflow,
        })
    }

    fn audit_rejection(
        &self,
        request: &GenerationRequest,
        classification: &Classification,
        err: &ControllerError,
    ) -> Result<()> {
        let Some(audit) = &self.audit else {
            return Ok(());
        };
        audit.append(
            AuditLogEntry::new("admission_rejected", Outcome::Denied)
                .with_route("admission")
                .with_details(serde_json::json!({
                    "requestId": request.request_id,
                    "tier": classification.tier,
                    "code": err.code(),
                    "message": err.to_string(),
                    "details": err.details(),
                })),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::LogFilter;
    use crate::store::MemoryStateStore;

    fn gate() -> (AdmissionGate, AuditLogger) {
        let audit = AuditLogger::new(Arc::new(MemoryStateStore::new()), "salt");
        let inventory = Arc::new(InventorySnapshot::from_model_set(&ModelSetSelector.full()));
        let gate = AdmissionGate::new(WorkflowTemplateEngine::default(), inventory)
            .with_audit(audit.clone());
        (gate, audit)
    }

    #[test]
    fn test_admits_plain_request() {
        let (gate, audit) = gate();
        let job = gate.admit(&GenerationRequest::new("r1", "a red fox")).unwrap();
        assert_eq!(job.template, template::IMAGE_TEMPLATE);
        assert_eq!(job.classification.tier, Tier::Basic);
        assert_eq!(job.workflow.node(6).unwrap().widgets["text"], "a red fox");
        assert_eq!(audit.query(&LogFilter::default()).unwrap().total, 0);
    }

    #[test]
    fn test_picks_template_from_classification() {
        let (gate, _) = gate();
        let video = gate.admit(&GenerationRequest::new("r2", "video of a storm")).unwrap();
        assert_eq!(video.template, template::VIDEO_TEMPLATE);
        assert_eq!(video.classification.tier, Tier::Ultra);

        let lora = gate.admit(&GenerationRequest::new("r3", "nsfw pinup")).unwrap();
        assert_eq!(lora.template, template::LORA_IMAGE_TEMPLATE);
        assert!(lora.models.loras.contains(models::NSFW_LORA));
    }

    #[test]
    fn test_rejection_is_audited() {
        let (gate, audit) = gate();
        let request = GenerationRequest::new("r4", "a boat").with_params(TemplateParams {
            checkpoint: Some("ghost.safetensors".into()),
            ..Default::default()
        });
        let err = gate.admit(&request).unwrap_err();
        assert_eq!(err.code(), "WORKFLOW_VALIDATION_FAILED");

        let page = audit
            .query(&LogFilter {
                action: Some("admission_rejected".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.rows[0].outcome, Outcome::Denied);
        assert_eq!(page.rows[0].details["requestId"], "r4");
        assert_eq!(page.rows[0].details["code"], "WORKFLOW_VALIDATION_FAILED");
    }
}
