//! Workflow graphs and integrity checks
//!
//! A workflow is a directed graph of engine nodes joined by typed links. Every
//! link is registered twice: in the `links` list of its source node's output
//! slot and as the `link` of its target node's input slot. [`Workflow::violations`]
//! checks all of that in a single pass and reports every problem it finds.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::models::ModelInventory;
use crate::error::ModelKind;

/// Node input slot
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeInput {
    /// Input name as the engine knows it
    pub name: String,
    /// Value type carried (`MODEL`, `CLIP`, ...)
    #[serde(rename = "type")]
    pub kind: String,
    /// Incoming link id
    pub link: Option<u32>,
}

/// Node output slot
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    /// Output name
    pub name: String,
    /// Value type produced
    #[serde(rename = "type")]
    pub kind: String,
    /// Outgoing link ids
    #[serde(default)]
    pub links: Vec<u32>,
}

/// One engine node
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Graph-unique id
    pub id: u32,
    /// Engine node class (`KSampler`, `CheckpointLoaderSimple`, ...)
    pub class_type: String,
    /// Linked inputs, by slot
    #[serde(default)]
    pub inputs: Vec<NodeInput>,
    /// Outputs, by slot
    #[serde(default)]
    pub outputs: Vec<NodeOutput>,
    /// Literal inputs
    #[serde(default)]
    pub widgets: BTreeMap<String, serde_json::Value>,
}

impl Node {
    fn widget_str(&self, name: &str) -> Option<&str> {
        self.widgets.get(name).and_then(serde_json::Value::as_str)
    }
}

/// A typed edge between two node slots
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    /// Graph-unique link id
    pub id: u32,
    /// Source node id
    pub src: u32,
    /// Source output slot
    pub src_slot: usize,
    /// Target node id
    pub tgt: u32,
    /// Target input slot
    pub tgt_slot: usize,
    /// Value type carried
    #[serde(rename = "type")]
    pub kind: String,
}

/// A problem found in a workflow graph
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// The link's source node does not exist
    MissingSourceNode {
        /// Link id
        link: u32,
        /// Referenced node id
        node: u32,
    },
    /// The link's target node does not exist
    MissingTargetNode {
        /// Link id
        link: u32,
        /// Referenced node id
        node: u32,
    },
    /// The source node's output slot does not list the link
    UnregisteredAtSource {
        /// Link id
        link: u32,
        /// Source node id
        node: u32,
    },
    /// The target node's input slot does not reference the link
    UnregisteredAtTarget {
        /// Link id
        link: u32,
        /// Target node id
        node: u32,
    },
    /// A node slot references a link id absent from the links list
    DanglingLink {
        /// Node id
        node: u32,
        /// Unknown link id
        link: u32,
    },
    /// A node loads a model that is not installed
    MissingModel {
        /// Node id
        node: u32,
        /// Checkpoint or LoRA
        model: ModelKind,
        /// Missing identifier
        name: String,
    },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingSourceNode { link, node } => {
                write!(f, "link {link}: source node {node} not found")
            }
            Self::MissingTargetNode { link, node } => {
                write!(f, "link {link}: target node {node} not found")
            }
            Self::UnregisteredAtSource { link, node } => {
                write!(f, "link {link} not referenced in source node {node} outputs")
            }
            Self::UnregisteredAtTarget { link, node } => {
                write!(f, "link {link} not referenced in target node {node} inputs")
            }
            Self::DanglingLink { node, link } => {
                write!(f, "node {node} references link {link} which is not in links array")
            }
            Self::MissingModel { node, model, name } => {
                write!(f, "node {node}: {model} '{name}' not in inventory")
            }
        }
    }
}

/// Engine node classes that load models, and the widget naming the file
const MODEL_LOADERS: &[(&str, &str, ModelKind)] = &[
    ("CheckpointLoaderSimple", "ckpt_name", ModelKind::Checkpoint),
    ("CheckpointLoader", "ckpt_name", ModelKind::Checkpoint),
    ("LoraLoader", "lora_name", ModelKind::Lora),
    ("LoraLoaderModelOnly", "lora_name", ModelKind::Lora),
];

/// A workflow graph
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Nodes
    pub nodes: Vec<Node>,
    /// Links
    #[serde(default)]
    pub links: Vec<Link>,
}

impl Workflow {
    /// Look up a node
    #[must_use]
    pub fn node(&self, id: u32) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Mutable node lookup
    pub fn node_mut(&mut self, id: u32) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    /// Models the graph loads
    #[must_use]
    pub fn referenced_models(&self) -> Vec<(u32, ModelKind, String)> {
        let mut refs = Vec::new();
        for node in &self.nodes {
            for (class, widget, kind) in MODEL_LOADERS {
                if node.class_type == *class {
                    if let Some(name) = node.widget_str(widget) {
                        refs.push((node.id, *kind, name.to_string()));
                    }
                }
            }
        }
        refs
    }

    /// Every integrity problem, in a stable order
    #[must_use]
    pub fn violations(&self, inventory: &dyn ModelInventory) -> Vec<Violation> {
        let nodes: HashMap<u32, &Node> = self.nodes.iter().map(|n| (n.id, n)).collect();
        let link_ids: HashSet<u32> = self.links.iter().map(|l| l.id).collect();
        let mut violations = Vec::new();

        for link in &self.links {
            match nodes.get(&link.src) {
                None => violations.push(Violation::MissingSourceNode {
                    link: link.id,
                    node: link.src,
                }),
                Some(src) => {
                    let registered = src
                        .outputs
                        .get(link.src_slot)
                        .is_some_and(|o| o.links.contains(&link.id));
                    if !registered {
                        violations.push(Violation::UnregisteredAtSource {
                            link: link.id,
                            node: link.src,
                        });
                    }
                }
            }

            match nodes.get(&link.tgt) {
                None => violations.push(Violation::MissingTargetNode {
                    link: link.id,
                    node: link.tgt,
                }),
                Some(tgt) => {
                    let registered = tgt
                        .inputs
                        .get(link.tgt_slot)
                        .is_some_and(|i| i.link == Some(link.id));
                    if !registered {
                        violations.push(Violation::UnregisteredAtTarget {
                            link: link.id,
                            node: link.tgt,
                        });
                    }
                }
            }
        }

        for node in &self.nodes {
            let referenced = node
                .inputs
                .iter()
                .filter_map(|i| i.link)
                .chain(node.outputs.iter().flat_map(|o| o.links.iter().copied()));
            for link in referenced {
                if !link_ids.contains(&link) {
                    violations.push(Violation::DanglingLink {
                        node: node.id,
                        link,
                    });
                }
            }
        }

        let checkpoints = inventory.checkpoints();
        let loras = inventory.loras();
        for (node, model, name) in self.referenced_models() {
            let installed = match model {
                ModelKind::Checkpoint => checkpoints.contains(&name),
                ModelKind::Lora => loras.contains(&name),
            };
            if !installed {
                violations.push(Violation::MissingModel { node, model, name });
            }
        }

        violations
    }

    /// Engine submission format: `{ "<id>": { class_type, inputs } }`, with
    /// linked inputs as `["<src id>", src_slot]`
    #[must_use]
    pub fn to_api_prompt(&self) -> serde_json::Value {
        let links: HashMap<u32, &Link> = self.links.iter().map(|l| (l.id, l)).collect();
        let mut prompt = serde_json::Map::new();

        for node in &self.nodes {
            let mut inputs: serde_json::Map<String, serde_json::Value> = node
                .widgets
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            for input in &node.inputs {
                if let Some(link) = input.link.and_then(|id| links.get(&id)) {
                    inputs.insert(
                        input.name.clone(),
                        serde_json::json!([link.src.to_string(), link.src_slot]),
                    );
                }
            }
            prompt.insert(
                node.id.to_string(),
                serde_json::json!({ "class_type": node.class_type, "inputs": inputs }),
            );
        }

        serde_json::Value::Object(prompt)
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builds graphs whose links are registered on both ends
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
    links: Vec<Link>,
}

impl GraphBuilder {
    /// Empty builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with its output slots (`(name, type)`) and literal widgets
    #[must_use]
    pub fn node(
        mut self,
        id: u32,
        class_type: &str,
        outputs: &[(&str, &str)],
        widgets: serde_json::Value,
    ) -> Self {
        let widgets = match widgets {
            serde_json::Value::Object(map) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        };
        self.nodes.push(Node {
            id,
            class_type: class_type.to_string(),
            inputs: Vec::new(),
            outputs: outputs
                .iter()
                .map(|(name, kind)| NodeOutput {
                    name: (*name).to_string(),
                    kind: (*kind).to_string(),
                    links: Vec::new(),
                })
                .collect(),
            widgets,
        });
        self
    }

    /// Link `src` output slot to a new named input on `tgt`
    #[must_use]
    pub fn wire(mut self, src: u32, src_slot: usize, tgt: u32, input: &str) -> Self {
        let id = u32::try_from(self.links.len() + 1).unwrap_or(u32::MAX);
        let kind = self
            .nodes
            .iter()
            .find(|n| n.id == src)
            .and_then(|n| n.outputs.get(src_slot))
            .map(|o| o.kind.clone())
            .unwrap_or_default();

        if let Some(source) = self.nodes.iter_mut().find(|n| n.id == src) {
            if let Some(output) = source.outputs.get_mut(src_slot) {
                output.links.push(id);
            }
        }
        let mut tgt_slot = 0;
        if let Some(target) = self.nodes.iter_mut().find(|n| n.id == tgt) {
            tgt_slot = target.inputs.len();
            target.inputs.push(NodeInput {
                name: input.to_string(),
                kind: kind.clone(),
                link: Some(id),
            });
        }

        self.links.push(Link {
            id,
            src,
            src_slot,
            tgt,
            tgt_slot,
            kind,
        });
        self
    }

    /// Finish
    #[must_use]
    pub fn build(self) -> Workflow {
        Workflow {
            nodes: self.nodes,
            links: self.links,
        }
    }
}
