//! Admission and generation pipeline tests

mod common;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;

use common::{controller, StubProvider};
use warmpool_core::admission::models::{BASE_CHECKPOINT, NSFW_LORA};
use warmpool_core::admission::{Link, Node, NodeOutput};
use warmpool_core::{
    AdmissionGate, AuditLogger, ComplexityClassifier, ControllerError, EngineError,
    ExecutionEngine, GenerationPipeline, GenerationRequest, InventorySnapshot, JobStatus,
    LogFilter, ModelSetSelector, Outcome, PoolController, Tier, Workflow, WorkflowTemplateEngine,
};

// =============================================================================
// Classifier
// =============================================================================

#[test]
fn test_classification_is_deterministic() {
    let prompts = [
        "a cat on a sofa",
        "cinematic 8k portrait, ultra detailed, dramatic lighting",
        "animated video of waves crashing, slow motion",
        "simple sketch of a tree",
        "explicit nsfw pinup, 4k",
    ];
    let classifier = ComplexityClassifier;
    for prompt in prompts {
        let first = classifier.classify(prompt);
        for _ in 0..50 {
            assert_eq!(ComplexityClassifier.classify(prompt), first);
        }
    }
}

#[test]
fn test_heavier_prompts_never_rank_lower() {
    let classifier = ComplexityClassifier;
    let light = classifier.classify("a lighthouse");
    let heavy = classifier.classify("a lighthouse, 8k, ultra detailed, cinematic, video");
    assert!(heavy.tier >= light.tier);
    assert_eq!(heavy.tier, Tier::Ultra);
}

#[test]
fn test_selector_covers_lighter_tiers() {
    let selector = ModelSetSelector;
    let basic = selector.select(Tier::Basic, false);
    let ultra = selector.select(Tier::Ultra, false);
    assert!(ultra.covers(&basic));
    assert!(!basic.loras.contains(NSFW_LORA));
    assert!(selector.select(Tier::Basic, true).loras.contains(NSFW_LORA));
}

// =============================================================================
// Validation
// =============================================================================

#[test]
fn test_unregistered_target_link_is_reported() {
    let workflow = Workflow {
        nodes: vec![
            Node {
                id: 1,
                class_type: "CheckpointLoaderSimple".into(),
                inputs: Vec::new(),
                outputs: vec![NodeOutput {
                    name: "MODEL".into(),
                    kind: "MODEL".into(),
                    links: vec![5],
                }],
                widgets: BTreeMap::new(),
            },
            Node {
                id: 2,
                class_type: "KSampler".into(),
                inputs: Vec::new(),
                outputs: Vec::new(),
                widgets: BTreeMap::new(),
            },
        ],
        links: vec![Link {
            id: 5,
            src: 1,
            src_slot: 0,
            tgt: 2,
            tgt_slot: 0,
            kind: "MODEL".into(),
        }],
    };

    let inventory = InventorySnapshot::new([BASE_CHECKPOINT], Vec::<String>::new());
    let err = WorkflowTemplateEngine::default()
        .validate(&workflow, &inventory)
        .unwrap_err();

    let ControllerError::ValidationFailed(violations) = &err else {
        panic!("expected validation failure, got {err:?}");
    };
    let messages: Vec<String> = violations.iter().map(ToString::to_string).collect();
    assert_eq!(messages, vec!["link 5 not referenced in target node 2 inputs"]);
    assert_eq!(err.code(), "WORKFLOW_VALIDATION_FAILED");
}

// =============================================================================
// Pipeline
// =============================================================================

struct StubEngine {
    inventory: InventorySnapshot,
    pending_polls: usize,
    fail_job: bool,
    submits: AtomicUsize,
    polls: AtomicUsize,
}

impl StubEngine {
    fn new(inventory: InventorySnapshot) -> Self {
        Self {
            inventory,
            pending_polls: 2,
            fail_job: false,
            submits: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ExecutionEngine for StubEngine {
    async fn submit(&self, _endpoint: &str, workflow: &Workflow) -> Result<String, EngineError> {
        assert!(!workflow.nodes.is_empty());
        let n = self.submits.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("job-{n}"))
    }

    async fn poll_status(&self, _endpoint: &str, _job_id: &str) -> Result<JobStatus, EngineError> {
        let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.pending_polls {
            return Ok(JobStatus::Pending);
        }
        if self.fail_job {
            return Ok(JobStatus::Failed {
                message: "out of memory".into(),
            });
        }
        Ok(JobStatus::Completed {
            outputs: vec!["out_00001_.png".into()],
        })
    }

    async fn inventory(&self, _endpoint: &str) -> Result<InventorySnapshot, EngineError> {
        Ok(self.inventory.clone())
    }
}

fn full_inventory() -> InventorySnapshot {
    InventorySnapshot::from_model_set(&ModelSetSelector.full())
}

fn pipeline(engine: Arc<StubEngine>) -> (GenerationPipeline, PoolController, Arc<StubProvider>) {
    let provider = StubProvider::new(Duration::ZERO);
    let controller = controller(provider.clone());
    let gate = AdmissionGate::new(WorkflowTemplateEngine::default(), Arc::new(full_inventory()))
        .with_audit(controller.audit().clone());
    let pipeline = GenerationPipeline::new(Arc::new(gate), controller.clone(), engine);
    (pipeline, controller, provider)
}

fn usage(audit: &AuditLogger) -> Vec<warmpool_core::UsageEvent> {
    audit.query_usage(&LogFilter::default()).unwrap().rows
}

#[tokio::test]
async fn test_pipeline_runs_job_and_records_usage() {
    let engine = Arc::new(StubEngine::new(full_inventory()));
    let (pipeline, controller, provider) = pipeline(engine.clone());

    let result = pipeline
        .run(&GenerationRequest::new("req-1", "a red fox in the snow"))
        .await
        .unwrap();

    assert_eq!(result.request_id, "req-1");
    assert_eq!(result.job_id, "job-1");
    assert_eq!(result.outputs, vec!["out_00001_.png".to_string()]);
    assert_eq!(provider.creates(), 1);
    assert_eq!(engine.polls.load(Ordering::SeqCst), 3);

    let rows = usage(controller.audit());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].request_id, "req-1");
    assert_eq!(rows[0].outcome, Outcome::Success);
    assert_eq!(rows[0].tier, result.tier);
}

#[tokio::test]
async fn test_missing_model_on_instance_is_not_dispatched() {
    let engine = Arc::new(StubEngine::new(InventorySnapshot::new(
        ["something_else.safetensors"],
        Vec::<String>::new(),
    )));
    let (pipeline, controller, _) = pipeline(engine.clone());

    let err = pipeline
        .run(&GenerationRequest::new("req-2", "a red fox"))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "CHECKPOINT_NOT_FOUND");
    assert!(err.to_string().contains(BASE_CHECKPOINT));
    assert_eq!(engine.submits.load(Ordering::SeqCst), 0);

    let rows = usage(controller.audit());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].outcome, Outcome::Denied);
}

#[tokio::test]
async fn test_gate_rejection_skips_the_pool() {
    let engine = Arc::new(StubEngine::new(full_inventory()));
    let (pipeline, controller, provider) = pipeline(engine);

    let err = pipeline
        .run(&GenerationRequest::new("req-3", "a red fox").with_template("no_such_template"))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "TEMPLATE_NOT_FOUND");
    assert_eq!(provider.creates(), 0);

    let rejected = controller
        .audit()
        .query(&LogFilter {
            action: Some("admission_rejected".into()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(rejected.total, 1);
    assert_eq!(rejected.rows[0].outcome, Outcome::Denied);
    assert_eq!(usage(controller.audit())[0].outcome, Outcome::Denied);
}

#[tokio::test]
async fn test_failed_job_is_an_error_outcome() {
    let mut engine = StubEngine::new(full_inventory());
    engine.fail_job = true;
    let (pipeline, controller, _) = pipeline(Arc::new(engine));

    let err = pipeline
        .run(&GenerationRequest::new("req-4", "a red fox"))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "EXECUTION_FAILED");
    assert_eq!(usage(controller.audit())[0].outcome, Outcome::Error);
}
