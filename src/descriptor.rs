//! Version descriptors
//!
//! A descriptor is the declarative input to every lifecycle operation: the
//! product and version it names, the pipeline configuration, the entrypoint
//! and the workflows with their nodes and edges. Descriptors arrive as JSON
//! over the RPC surface or as JSON/YAML files for `verso render`.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

/// Logical name of the entrypoint; reserved, no node may use it
pub const ENTRYPOINT_NAME: &str = "entrypoint";

/// One pipeline configuration key/value pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
}

impl ConfigEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// The ingress-facing workload of a version
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entrypoint {
    pub image: String,
    /// Source bundle reference
    #[serde(default)]
    pub src: String,
    /// Protocol definition served by the entrypoint
    #[serde(default)]
    pub proto_file: String,
}

/// One processing step of a workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub src: String,
}

/// Directed link between two nodes of a workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub from_node: String,
    pub to_node: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub name: String,
    /// Node receiving traffic from the entrypoint
    #[serde(default)]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Workflow {
    /// Upstream nodes of `node`
    pub fn inputs_of(&self, node: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|e| e.to_node == node)
            .map(|e| e.from_node.clone())
            .collect()
    }

    /// Downstream nodes of `node`
    pub fn outputs_of(&self, node: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|e| e.from_node == node)
            .map(|e| e.to_node.clone())
            .collect()
    }

    /// Node that receives entrypoint traffic: the declared one, otherwise
    /// the first node without inputs
    pub fn entry_node(&self) -> Option<&str> {
        if let Some(name) = &self.entrypoint {
            return Some(name.as_str());
        }
        self.nodes
            .iter()
            .find(|n| self.inputs_of(&n.name).is_empty())
            .map(|n| n.name.as_str())
    }
}

/// Complete description of one version of a product
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionDescriptor {
    pub product_id: String,
    pub version_name: String,
    /// Target namespace; the configured default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub config: Vec<ConfigEntry>,
    pub entrypoint: Entrypoint,
    #[serde(default)]
    pub workflows: Vec<Workflow>,
}

/// Identity of one workload: a node within its workflow, or the entrypoint.
/// Node names are only unique per workflow, so both parts are needed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeKey {
    /// `None` for the entrypoint
    pub workflow: Option<String>,
    pub node: String,
}

impl NodeKey {
    pub fn entrypoint() -> Self {
        Self {
            workflow: None,
            node: ENTRYPOINT_NAME.to_string(),
        }
    }

    pub fn node(workflow: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            workflow: Some(workflow.into()),
            node: node.into(),
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.workflow {
            Some(workflow) => write!(f, "{}/{}", workflow, self.node),
            None => f.write_str(&self.node),
        }
    }
}

/// Workloads whose pods must be ready for a version to be ready
pub fn expected_nodes(workflows: &[Workflow]) -> BTreeSet<NodeKey> {
    let mut keys: BTreeSet<NodeKey> = workflows
        .iter()
        .flat_map(|w| w.nodes.iter().map(|n| NodeKey::node(&w.name, &n.name)))
        .collect();
    keys.insert(NodeKey::entrypoint());
    keys
}

// ============================================================================
// Parsing and validation (pure, no I/O)
// ============================================================================

impl VersionDescriptor {
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| OrchestratorError::invalid(e.to_string()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| OrchestratorError::invalid(e.to_string()))
    }

    /// Namespace the version lives in
    pub fn namespace_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default)
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        require_non_empty("product id", &self.product_id)?;
        require_non_empty("version name", &self.version_name)?;
        if self.entrypoint.image.trim().is_empty() {
            return Err(OrchestratorError::invalid(
                "entrypoint has no image reference",
            ));
        }

        let mut workflow_names = HashSet::new();
        for workflow in &self.workflows {
            require_non_empty("workflow name", &workflow.name)?;
            if !workflow_names.insert(workflow.name.as_str()) {
                return Err(OrchestratorError::invalid(format!(
                    "duplicate workflow '{}'",
                    workflow.name
                )));
            }
            validate_workflow(workflow)?;
        }

        Ok(())
    }
}

fn require_non_empty(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(OrchestratorError::invalid(format!("{} is empty", what)));
    }
    Ok(())
}

fn validate_workflow(workflow: &Workflow) -> Result<()> {
    let mut node_names = HashSet::new();
    for node in &workflow.nodes {
        require_non_empty("node name", &node.name)?;
        if node.name == ENTRYPOINT_NAME {
            return Err(OrchestratorError::invalid(format!(
                "workflow '{}': node name '{}' is reserved",
                workflow.name, ENTRYPOINT_NAME
            )));
        }
        if node.image.trim().is_empty() {
            return Err(OrchestratorError::invalid(format!(
                "workflow '{}': node '{}' has no image reference",
                workflow.name, node.name
            )));
        }
        if !node_names.insert(node.name.as_str()) {
            return Err(OrchestratorError::invalid(format!(
                "workflow '{}': duplicate node '{}'",
                workflow.name, node.name
            )));
        }
    }

    for edge in &workflow.edges {
        for end in [&edge.from_node, &edge.to_node] {
            if !node_names.contains(end.as_str()) {
                return Err(OrchestratorError::invalid(format!(
                    "workflow '{}': edge references unknown node '{}'",
                    workflow.name, end
                )));
            }
        }
    }

    if let Some(entry) = &workflow.entrypoint {
        if !node_names.contains(entry.as_str()) {
            return Err(OrchestratorError::invalid(format!(
                "workflow '{}': entrypoint node '{}' is not defined",
                workflow.name, entry
            )));
        }
    }

    Ok(())
}
