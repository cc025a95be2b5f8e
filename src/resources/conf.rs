//! Per-node conf files mounted into every workload

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::names;
use crate::descriptor::{NodeKey, VersionDescriptor, Workflow, ENTRYPOINT_NAME};
use crate::error::{OrchestratorError, Result};

/// Key of the entrypoint's file inside the conf-files config map
pub const ENTRYPOINT_CONF_FILE: &str = "entrypoint.yaml";

/// What a node needs to know about its place in the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConf {
    pub product_id: String,
    pub version_name: String,
    pub workflow: String,
    pub node: String,
    pub src: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    /// Receives traffic from the entrypoint
    pub is_entry: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrypointConf {
    pub product_id: String,
    pub version_name: String,
    pub src: String,
    pub proto_file: String,
    /// Workflow name to entry node
    pub workflows: BTreeMap<String, String>,
}

/// File name to YAML content, one file per node plus the entrypoint. Two
/// nodes whose names map to the same file are rejected.
pub fn conf_files(descriptor: &VersionDescriptor) -> Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();
    let mut owners: BTreeMap<String, NodeKey> =
        BTreeMap::from([(ENTRYPOINT_CONF_FILE.to_string(), NodeKey::entrypoint())]);

    for workflow in &descriptor.workflows {
        for node in &workflow.nodes {
            let file = names::node_conf_file(&workflow.name, &node.name);
            let owner = NodeKey::node(&workflow.name, &node.name);
            if let Some(previous) = owners.get(&file) {
                return Err(OrchestratorError::invalid(format!(
                    "nodes '{}' and '{}' both map to conf file '{}'",
                    previous, owner, file
                )));
            }
            owners.insert(file.clone(), owner);

            let conf = node_conf(descriptor, workflow, &node.name, &node.src);
            files.insert(file, to_yaml(&conf)?);
        }
    }

    let entrypoint = EntrypointConf {
        product_id: descriptor.product_id.clone(),
        version_name: descriptor.version_name.clone(),
        src: descriptor.entrypoint.src.clone(),
        proto_file: descriptor.entrypoint.proto_file.clone(),
        workflows: descriptor
            .workflows
            .iter()
            .filter_map(|w| w.entry_node().map(|n| (w.name.clone(), n.to_string())))
            .collect(),
    };
    files.insert(ENTRYPOINT_CONF_FILE.to_string(), to_yaml(&entrypoint)?);

    Ok(files)
}

/// Path of a workload's own conf file inside its container
pub fn conf_file_path(conf_dir: &str, workflow: Option<&str>, node: &str) -> String {
    let file = match workflow {
        Some(workflow) if node != ENTRYPOINT_NAME => names::node_conf_file(workflow, node),
        _ => ENTRYPOINT_CONF_FILE.to_string(),
    };
    format!("{}/{}", conf_dir.trim_end_matches('/'), file)
}

fn node_conf(descriptor: &VersionDescriptor, workflow: &Workflow, node: &str, src: &str) -> NodeConf {
    NodeConf {
        product_id: descriptor.product_id.clone(),
        version_name: descriptor.version_name.clone(),
        workflow: workflow.name.clone(),
        node: node.to_string(),
        src: src.to_string(),
        inputs: workflow.inputs_of(node),
        outputs: workflow.outputs_of(node),
        is_entry: workflow.entry_node() == Some(node),
    }
}

fn to_yaml<T: Serialize>(value: &T) -> Result<String> {
    serde_yaml::to_string(value).map_err(|e| OrchestratorError::invalid(e.to_string()))
}
