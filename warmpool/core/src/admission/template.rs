//! Workflow templates
//!
//! A template is a complete graph plus a list of [`Binding`]s naming which
//! node widget receives which [`ParamKey`]. Hydration writes typed JSON values
//! into those widgets; nothing is spliced into serialized text.
//!
//! ```text
//! TemplateParams ──resolve(defaults)──▶ ResolvedParams ──check()──▶ bind ──▶ Workflow
//!   (caller, sparse)                      (total, typed)      ranges     widgets
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use super::classifier::MediaKind;
use super::models::{ModelInventory, BASE_CHECKPOINT, MOTION_MODULE, NSFW_CHECKPOINT, NSFW_LORA};
use super::workflow::{GraphBuilder, Workflow};
use crate::error::{ControllerError, Result};

/// Built-in txt2img template
pub const IMAGE_TEMPLATE: &str = "image";
/// Built-in txt2img template with a LoRA stage
pub const LORA_IMAGE_TEMPLATE: &str = "image_lora";
/// Built-in AnimateDiff template
pub const VIDEO_TEMPLATE: &str = "video_animatediff";

// ============================================================================
// Parameters
// ============================================================================

/// A typed placeholder
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKey {
    /// Positive prompt text
    Prompt,
    /// Negative prompt text
    NegativePrompt,
    /// Output width
    Width,
    /// Output height
    Height,
    /// Sampler steps
    Steps,
    /// Classifier-free guidance scale
    Cfg,
    /// Sampler seed
    Seed,
    /// Sampler name
    Sampler,
    /// Noise schedule
    Scheduler,
    /// Checkpoint file
    Checkpoint,
    /// LoRA file
    LoraName,
    /// LoRA strength (model and clip)
    LoraStrength,
    /// Video frame count
    Frames,
    /// Video frame rate
    Fps,
}

/// Caller-supplied parameters; anything omitted falls back to the template defaults
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TemplateParams {
    /// Positive prompt
    pub prompt: Option<String>,
    /// Negative prompt
    pub negative_prompt: Option<String>,
    /// Width in pixels
    pub width: Option<u32>,
    /// Height in pixels
    pub height: Option<u32>,
    /// Sampler steps
    pub steps: Option<u32>,
    /// Guidance scale
    pub cfg: Option<f32>,
    /// Seed (random when omitted)
    pub seed: Option<u64>,
    /// Sampler name
    pub sampler: Option<String>,
    /// Scheduler
    pub scheduler: Option<String>,
    /// Checkpoint
    pub checkpoint: Option<String>,
    /// LoRA file
    pub lora_name: Option<String>,
    /// LoRA strength
    pub lora_strength: Option<f32>,
    /// Frame count
    pub frames: Option<u32>,
    /// Frame rate
    pub fps: Option<u32>,
}

impl TemplateParams {
    /// Set the prompt
    #[must_use]
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    /// Set the seed
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Fill gaps from `defaults`
    #[must_use]
    pub fn resolve(&self, defaults: &ParamDefaults) -> ResolvedParams {
        ResolvedParams {
            prompt: self.prompt.clone().unwrap_or_else(|| defaults.prompt.clone()),
            negative_prompt: self
                .negative_prompt
                .clone()
                .unwrap_or_else(|| defaults.negative_prompt.clone()),
            width: self.width.unwrap_or(defaults.width),
            height: self.height.unwrap_or(defaults.height),
            steps: self.steps.unwrap_or(defaults.steps),
            cfg: self.cfg.unwrap_or(defaults.cfg),
            seed: self.seed.unwrap_or_else(|| u64::from(rand::random::<u32>())),
            sampler: self.sampler.clone().unwrap_or_else(|| defaults.sampler.clone()),
            scheduler: self
                .scheduler
                .clone()
                .unwrap_or_else(|| defaults.scheduler.clone()),
            checkpoint: self
                .checkpoint
                .clone()
                .unwrap_or_else(|| defaults.checkpoint.clone()),
            lora_name: self
                .lora_name
                .clone()
                .unwrap_or_else(|| defaults.lora_name.clone()),
            lora_strength: self.lora_strength.unwrap_or(defaults.lora_strength),
            frames: self.frames.unwrap_or(defaults.frames),
            fps: self.fps.unwrap_or(defaults.fps),
        }
    }
}

/// Documented defaults for one template
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParamDefaults {
    /// Prompt
    pub prompt: String,
    /// Negative prompt
    pub negative_prompt: String,
    /// Width
    pub width: u32,
    /// Height
    pub height: u32,
    /// Steps
    pub steps: u32,
    /// Guidance scale
    pub cfg: f32,
    /// Sampler
    pub sampler: String,
    /// Scheduler
    pub scheduler: String,
    /// Checkpoint
    pub checkpoint: String,
    /// LoRA
    pub lora_name: String,
    /// LoRA strength
    pub lora_strength: f32,
    /// Frames
    pub frames: u32,
    /// Frame rate
    pub fps: u32,
}

impl Default for ParamDefaults {
    fn default() -> Self {
        Self {
            prompt: "beautiful fantasy".to_string(),
            negative_prompt: "ugly, deformed, bad anatomy".to_string(),
            width: 512,
            height: 768,
            steps: 25,
            cfg: 7.0,
            sampler: "euler_ancestral".to_string(),
            scheduler: "normal".to_string(),
            checkpoint: BASE_CHECKPOINT.to_string(),
            lora_name: NSFW_LORA.to_string(),
            lora_strength: 0.8,
            frames: 16,
            fps: 8,
        }
    }
}

impl ParamDefaults {
    fn lora() -> Self {
        Self {
            checkpoint: NSFW_CHECKPOINT.to_string(),
            ..Self::default()
        }
    }

    fn video() -> Self {
        Self {
            width: 512,
            height: 512,
            steps: 30,
            ..Self::default()
        }
    }
}

/// Every parameter, concrete
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedParams {
    /// Prompt
    pub prompt: String,
    /// Negative prompt
    pub negative_prompt: String,
    /// Width
    pub width: u32,
    /// Height
    pub height: u32,
    /// Steps
    pub steps: u32,
    /// Guidance scale
    pub cfg: f32,
    /// Seed
    pub seed: u64,
    /// Sampler
    pub sampler: String,
    /// Scheduler
    pub scheduler: String,
    /// Checkpoint
    pub checkpoint: String,
    /// LoRA
    pub lora_name: String,
    /// LoRA strength
    pub lora_strength: f32,
    /// Frames
    pub frames: u32,
    /// Frame rate
    pub fps: u32,
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ControllerError {
    ControllerError::InvalidParameter {
        name,
        reason: reason.into(),
    }
}

impl ResolvedParams {
    /// Range checks; first failure wins
    pub fn check(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(invalid("prompt", "must not be empty"));
        }
        for (name, value) in [("width", self.width), ("height", self.height)] {
            if !(64..=2048).contains(&value) || value % 8 != 0 {
                return Err(invalid(
                    name,
                    format!("{value} must be a multiple of 8 between 64 and 2048"),
                ));
            }
        }
        if !(1..=150).contains(&self.steps) {
            return Err(invalid("steps", format!("{} outside 1..=150", self.steps)));
        }
        if !(1.0..=30.0).contains(&self.cfg) {
            return Err(invalid("cfg", format!("{} outside 1.0..=30.0", self.cfg)));
        }
        if !(0.0..=2.0).contains(&self.lora_strength) {
            return Err(invalid(
                "loraStrength",
                format!("{} outside 0.0..=2.0", self.lora_strength),
            ));
        }
        if !(1..=120).contains(&self.frames) {
            return Err(invalid("frames", format!("{} outside 1..=120", self.frames)));
        }
        if !(1..=60).contains(&self.fps) {
            return Err(invalid("fps", format!("{} outside 1..=60", self.fps)));
        }
        Ok(())
    }

    /// JSON value for a placeholder
    #[must_use]
    pub fn value(&self, key: ParamKey) -> serde_json::Value {
        match key {
            ParamKey::Prompt => json!(self.prompt),
            ParamKey::NegativePrompt => json!(self.negative_prompt),
            ParamKey::Width => json!(self.width),
            ParamKey::Height => json!(self.height),
            ParamKey::Steps => json!(self.steps),
            ParamKey::Cfg => json!(self.cfg),
            ParamKey::Seed => json!(self.seed),
            ParamKey::Sampler => json!(self.sampler),
            ParamKey::Scheduler => json!(self.scheduler),
            ParamKey::Checkpoint => json!(self.checkpoint),
            ParamKey::LoraName => json!(self.lora_name),
            ParamKey::LoraStrength => json!(self.lora_strength),
            ParamKey::Frames => json!(self.frames),
            ParamKey::Fps => json!(self.fps),
        }
    }
}

// ============================================================================
// Templates
// ============================================================================

/// Placeholder location
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    /// Node id
    pub node: u32,
    /// Widget on that node
    pub widget: String,
    /// Parameter written there
    pub param: ParamKey,
}

fn bind(node: u32, widget: &str, param: ParamKey) -> Binding {
    Binding {
        node,
        widget: widget.to_string(),
        param,
    }
}

/// A named graph with typed placeholders
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    /// Registry name
    pub name: String,
    /// Output medium
    pub media: MediaKind,
    /// Preferred for NSFW requests
    #[serde(default)]
    pub nsfw: bool,
    /// Graph with placeholder widgets
    pub graph: Workflow,
    /// Where parameters go
    pub bindings: Vec<Binding>,
    /// Fallback values
    #[serde(default)]
    pub defaults: ParamDefaults,
}

impl WorkflowTemplate {
    /// Every binding points at an existing node
    fn unbound_nodes(&self) -> Vec<u32> {
        self.bindings
            .iter()
            .map(|b| b.node)
            .filter(|id| self.graph.node(*id).is_none())
            .collect()
    }

    /// Substitute parameters
    pub fn hydrate(&self, params: &TemplateParams) -> Result<Workflow> {
        let resolved = params.resolve(&self.defaults);
        resolved.check()?;

        let mut graph = self.graph.clone();
        for binding in &self.bindings {
            if let Some(node) = graph.node_mut(binding.node) {
                node.widgets
                    .insert(binding.widget.clone(), resolved.value(binding.param));
            }
        }
        Ok(graph)
    }
}

fn sampler_bindings() -> Vec<Binding> {
    vec![
        bind(4, "ckpt_name", ParamKey::Checkpoint),
        bind(6, "text", ParamKey::Prompt),
        bind(7, "text", ParamKey::NegativePrompt),
        bind(5, "width", ParamKey::Width),
        bind(5, "height", ParamKey::Height),
        bind(3, "seed", ParamKey::Seed),
        bind(3, "steps", ParamKey::Steps),
        bind(3, "cfg", ParamKey::Cfg),
        bind(3, "sampler_name", ParamKey::Sampler),
        bind(3, "scheduler", ParamKey::Scheduler),
    ]
}

fn sampler_widgets() -> serde_json::Value {
    json!({
        "seed": 0,
        "steps": 0,
        "cfg": 0,
        "sampler_name": "",
        "scheduler": "",
        "denoise": 1.0,
    })
}

fn checkpoint_outputs() -> [(&'static str, &'static str); 3] {
    [("MODEL", "MODEL"), ("CLIP", "CLIP"), ("VAE", "VAE")]
}

/// Plain txt2img
fn image_template() -> WorkflowTemplate {
    let graph = GraphBuilder::new()
        .node(4, "CheckpointLoaderSimple", &checkpoint_outputs(), json!({"ckpt_name": ""}))
        .node(6, "CLIPTextEncode", &[("CONDITIONING", "CONDITIONING")], json!({"text": ""}))
        .node(7, "CLIPTextEncode", &[("CONDITIONING", "CONDITIONING")], json!({"text": ""}))
        .node(5, "EmptyLatentImage", &[("LATENT", "LATENT")], json!({"width": 0, "height": 0, "batch_size": 1}))
        .node(3, "KSampler", &[("LATENT", "LATENT")], sampler_widgets())
        .node(8, "VAEDecode", &[("IMAGE", "IMAGE")], json!({}))
        .node(9, "SaveImage", &[], json!({"filename_prefix": "warmpool"}))
        .wire(4, 0, 3, "model")
        .wire(4, 1, 6, "clip")
        .wire(4, 1, 7, "clip")
        .wire(6, 0, 3, "positive")
        .wire(7, 0, 3, "negative")
        .wire(5, 0, 3, "latent_image")
        .wire(3, 0, 8, "samples")
        .wire(4, 2, 8, "vae")
        .wire(8, 0, 9, "images")
        .build();

    WorkflowTemplate {
        name: IMAGE_TEMPLATE.to_string(),
        media: MediaKind::Image,
        nsfw: false,
        graph,
        bindings: sampler_bindings(),
        defaults: ParamDefaults::default(),
    }
}

/// txt2img with a LoRA between the checkpoint and everything downstream
fn lora_image_template() -> WorkflowTemplate {
    let graph = GraphBuilder::new()
        .node(4, "CheckpointLoaderSimple", &checkpoint_outputs(), json!({"ckpt_name": ""}))
        .node(
            10,
            "LoraLoader",
            &[("MODEL", "MODEL"), ("CLIP", "CLIP")],
            json!({"lora_name": "", "strength_model": 0, "strength_clip": 0}),
        )
        .node(6, "CLIPTextEncode", &[("CONDITIONING", "CONDITIONING")], json!({"text": ""}))
        .node(7, "CLIPTextEncode", &[("CONDITIONING", "CONDITIONING")], json!({"text": ""}))
        .node(5, "EmptyLatentImage", &[("LATENT", "LATENT")], json!({"width": 0, "height": 0, "batch_size": 1}))
        .node(3, "KSampler", &[("LATENT", "LATENT")], sampler_widgets())
        .node(8, "VAEDecode", &[("IMAGE", "IMAGE")], json!({}))
        .node(9, "SaveImage", &[], json!({"filename_prefix": "warmpool"}))
        .wire(4, 0, 10, "model")
        .wire(4, 1, 10, "clip")
        .wire(10, 0, 3, "model")
        .wire(10, 1, 6, "clip")
        .wire(10, 1, 7, "clip")
        .wire(6, 0, 3, "positive")
        .wire(7, 0, 3, "negative")
        .wire(5, 0, 3, "latent_image")
        .wire(3, 0, 8, "samples")
        .wire(4, 2, 8, "vae")
        .wire(8, 0, 9, "images")
        .build();

    let mut bindings = sampler_bindings();
    bindings.push(bind(10, "lora_name", ParamKey::LoraName));
    bindings.push(bind(10, "strength_model", ParamKey::LoraStrength));
    bindings.push(bind(10, "strength_clip", ParamKey::LoraStrength));

    WorkflowTemplate {
        name: LORA_IMAGE_TEMPLATE.to_string(),
        media: MediaKind::Image,
        nsfw: true,
        graph,
        bindings,
        defaults: ParamDefaults::lora(),
    }
}

/// AnimateDiff: frames become the latent batch, output is an encoded video
fn video_template() -> WorkflowTemplate {
    let graph = GraphBuilder::new()
        .node(4, "CheckpointLoaderSimple", &checkpoint_outputs(), json!({"ckpt_name": ""}))
        .node(
            10,
            "AnimateDiffLoader",
            &[("MODEL", "MODEL")],
            json!({"model_name": MOTION_MODULE, "beta_schedule": "sqrt_linear (AnimateDiff)"}),
        )
        .node(6, "CLIPTextEncode", &[("CONDITIONING", "CONDITIONING")], json!({"text": ""}))
        .node(7, "CLIPTextEncode", &[("CONDITIONING", "CONDITIONING")], json!({"text": ""}))
        .node(5, "EmptyLatentImage", &[("LATENT", "LATENT")], json!({"width": 0, "height": 0, "batch_size": 0}))
        .node(3, "KSampler", &[("LATENT", "LATENT")], sampler_widgets())
        .node(8, "VAEDecode", &[("IMAGE", "IMAGE")], json!({}))
        .node(
            11,
            "VHS_VideoCombine",
            &[],
            json!({"frame_rate": 0, "format": "video/h264-mp4", "loop_count": 0, "filename_prefix": "warmpool"}),
        )
        .wire(4, 0, 10, "model")
        .wire(10, 0, 3, "model")
        .wire(4, 1, 6, "clip")
        .wire(4, 1, 7, "clip")
        .wire(6, 0, 3, "positive")
        .wire(7, 0, 3, "negative")
        .wire(5, 0, 3, "latent_image")
        .wire(3, 0, 8, "samples")
        .wire(4, 2, 8, "vae")
        .wire(8, 0, 11, "images")
        .build();

    let mut bindings = sampler_bindings();
    bindings.push(bind(5, "batch_size", ParamKey::Frames));
    bindings.push(bind(11, "frame_rate", ParamKey::Fps));

    WorkflowTemplate {
        name: VIDEO_TEMPLATE.to_string(),
        media: MediaKind::Video,
        nsfw: false,
        graph,
        bindings,
        defaults: ParamDefaults::video(),
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Errors loading templates from disk
#[derive(Debug, Error)]
pub enum TemplateLoadError {
    /// Directory or file unreadable
    #[error("failed to read template {path:?}: {source}")]
    Io {
        /// Offending path
        path: PathBuf,
        /// Cause
        source: std::io::Error,
    },
    /// Not a template document
    #[error("failed to parse template {path:?}: {source}")]
    Parse {
        /// Offending path
        path: PathBuf,
        /// Cause
        source: serde_json::Error,
    },
    /// A binding names a node the graph does not have
    #[error("template '{template}' binds missing nodes {nodes:?}")]
    UnboundNodes {
        /// Template name
        template: String,
        /// Missing node ids
        nodes: Vec<u32>,
    },
}

/// Named templates
#[derive(Clone, Debug, Default)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, WorkflowTemplate>,
}

impl TemplateRegistry {
    /// Registry with the shipped templates
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        for template in [image_template(), lora_image_template(), video_template()] {
            registry.templates.insert(template.name.clone(), template);
        }
        registry
    }

    /// Add or replace a template
    pub fn insert(&mut self, template: WorkflowTemplate) -> std::result::Result<(), TemplateLoadError> {
        let missing = template.unbound_nodes();
        if !missing.is_empty() {
            return Err(TemplateLoadError::UnboundNodes {
                template: template.name,
                nodes: missing,
            });
        }
        self.templates.insert(template.name.clone(), template);
        Ok(())
    }

    /// Load every `*.json` file in `dir`; returns how many were added
    pub fn load_dir(&mut self, dir: &Path) -> std::result::Result<usize, TemplateLoadError> {
        let io_err = |source| TemplateLoadError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(io_err)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            let raw = std::fs::read_to_string(&path).map_err(|source| TemplateLoadError::Io {
                path: path.clone(),
                source,
            })?;
            let template: WorkflowTemplate =
                serde_json::from_str(&raw).map_err(|source| TemplateLoadError::Parse {
                    path: path.clone(),
                    source,
                })?;
            tracing::info!(template = %template.name, path = %path.display(), "Loaded template");
            self.insert(template)?;
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Look up by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&WorkflowTemplate> {
        self.templates.get(name)
    }

    /// Registered names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    /// Default template for a request shape
    #[must_use]
    pub fn default_for(&self, media: MediaKind, nsfw: bool) -> &'static str {
        match (media, nsfw) {
            (MediaKind::Video, _) => VIDEO_TEMPLATE,
            (MediaKind::Image, true) => LORA_IMAGE_TEMPLATE,
            (MediaKind::Image, false) => IMAGE_TEMPLATE,
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Registry + hydration + validation
#[derive(Clone, Debug)]
pub struct WorkflowTemplateEngine {
    registry: TemplateRegistry,
}

impl Default for WorkflowTemplateEngine {
    fn default() -> Self {
        Self::new(TemplateRegistry::builtin())
    }
}

impl WorkflowTemplateEngine {
    /// Engine over a registry
    #[must_use]
    pub fn new(registry: TemplateRegistry) -> Self {
        Self { registry }
    }

    /// The registry
    #[must_use]
    pub fn registry(&self) -> &TemplateRegistry {
        &self.registry
    }

    /// Build a concrete workflow from a named template
    pub fn hydrate(&self, template: &str, params: &TemplateParams) -> Result<Workflow> {
        let template = self
            .registry
            .get(template)
            .ok_or_else(|| ControllerError::TemplateNotFound(template.to_string()))?;
        template.hydrate(params)
    }

    /// Full-pass integrity check; every violation is returned together
    pub fn validate(&self, workflow: &Workflow, inventory: &dyn ModelInventory) -> Result<()> {
        let violations = workflow.violations(inventory);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ControllerError::ValidationFailed(violations))
        }
    }
}
