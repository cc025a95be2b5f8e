//! # Resource builder
//!
//! Pure translation of a [`VersionDescriptor`] into the cluster objects that
//! run it. Nothing here performs I/O; the same descriptor and settings always
//! produce the same objects, names and spec hashes.
//!
//! Every object carries the `product-id`, `version-name` and `type` labels
//! that the gateway and the readiness watch select on, plus a
//! `verso.io/spec-hash` annotation used to tell an identical existing object
//! from a conflicting one.

pub mod conf;
pub mod names;
pub mod network;
pub mod volumes;

use std::collections::{BTreeMap, HashMap};

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapEnvSource, Container, ContainerPort, EnvFromSource, EnvVar, PodSpec,
    PodTemplateSpec, Probe, Service, TCPSocketAction,
};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector as K8sLabelSelector, ObjectMeta,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Resource;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::cluster::{ClusterError, LabelSelector};
use crate::config::{IngressSettings, WorkloadSettings};
use crate::descriptor::{ConfigEntry, NodeKey, VersionDescriptor, Workflow, ENTRYPOINT_NAME};
use crate::error::{OrchestratorError, Result};

pub const LABEL_PRODUCT: &str = "product-id";
pub const LABEL_VERSION: &str = "version-name";
pub const LABEL_TYPE: &str = "type";
pub const LABEL_NODE: &str = "node-name";
pub const LABEL_WORKFLOW: &str = "workflow";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGER: &str = "verso";
pub const SPEC_HASH_ANNOTATION: &str = "verso.io/spec-hash";

/// Named container port of the entrypoint
pub const ENTRYPOINT_PORT_NAME: &str = "grpc";

/// Value of the `type` label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Node,
    Entrypoint,
    Config,
    EntrypointService,
    ActiveEntrypoint,
    Ingress,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Node => "node",
            ObjectType::Entrypoint => "entrypoint",
            ObjectType::Config => "config",
            ObjectType::EntrypointService => "entrypoint-service",
            ObjectType::ActiveEntrypoint => "active-entrypoint",
            ObjectType::Ingress => "ingress",
        }
    }
}

/// Standard labels; `version_name` is omitted for product-scoped objects
pub fn object_labels(
    product_id: &str,
    version_name: Option<&str>,
    object_type: ObjectType,
) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        (LABEL_PRODUCT.to_string(), product_id.to_string()),
        (LABEL_TYPE.to_string(), object_type.as_str().to_string()),
        (LABEL_MANAGED_BY.to_string(), MANAGER.to_string()),
    ]);
    if let Some(version) = version_name {
        labels.insert(LABEL_VERSION.to_string(), version.to_string());
    }
    labels
}

/// Config maps of one version
pub fn config_selector(product_id: &str, version_name: &str) -> LabelSelector {
    LabelSelector::matching(LABEL_PRODUCT, product_id)
        .with_label(LABEL_VERSION, version_name)
        .with_label(LABEL_TYPE, ObjectType::Config.as_str())
}

/// Workloads of one version, and the pods they run
pub fn workload_selector(product_id: &str, version_name: &str) -> LabelSelector {
    LabelSelector::matching(LABEL_PRODUCT, product_id)
        .with_label(LABEL_VERSION, version_name)
        .with_label_in(
            LABEL_TYPE,
            [ObjectType::Node.as_str(), ObjectType::Entrypoint.as_str()],
        )
}

/// Annotate `object` with the SHA-256 of its serialized form. An object
/// that cannot be serialized is an error, never left unstamped.
pub fn stamp_spec_hash<K: Resource + Serialize>(object: &mut K) -> Result<()> {
    let meta = object.meta_mut();
    if let Some(annotations) = meta.annotations.as_mut() {
        annotations.remove(SPEC_HASH_ANNOTATION);
    }
    if meta.annotations.as_ref().is_some_and(BTreeMap::is_empty) {
        meta.annotations = None;
    }
    let bytes = serde_json::to_vec(&*object)
        .map_err(|e| ClusterError::Serialization(format!("spec hash: {}", e)))?;
    let digest = format!("{:x}", Sha256::digest(&bytes));
    object
        .meta_mut()
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(SPEC_HASH_ANNOTATION.to_string(), digest);
    Ok(())
}

/// Reject a version whose private service would take the name of the
/// product's active service; publishing it would delete its own binding
pub fn check_version_name(product_id: &str, version_name: &str) -> Result<()> {
    let service = names::version_service(product_id, version_name);
    if service == names::active_service(product_id) {
        return Err(OrchestratorError::invalid(format!(
            "version name '{}' is reserved: its service name '{}' is the active service of product '{}'",
            version_name, service, product_id
        )));
    }
    Ok(())
}

pub fn spec_hash<K: Resource>(object: &K) -> Option<&str> {
    object
        .meta()
        .annotations
        .as_ref()?
        .get(SPEC_HASH_ANNOTATION)
        .map(String::as_str)
}

/// Desired cluster objects of one version
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterResourceSet {
    /// Pipeline config first, then conf files
    pub config_maps: Vec<ConfigMap>,
    pub node_workloads: Vec<Deployment>,
    pub entrypoint_workload: Deployment,
    pub entrypoint_service: Service,
}

impl ClusterResourceSet {
    /// Node workloads followed by the entrypoint workload
    pub fn workloads(&self) -> impl Iterator<Item = &Deployment> {
        self.node_workloads
            .iter()
            .chain(std::iter::once(&self.entrypoint_workload))
    }

    /// Multi-document YAML, in creation order
    pub fn to_yaml(&self) -> Result<String> {
        let mut documents = Vec::new();
        for config_map in &self.config_maps {
            documents.push(to_yaml(config_map)?);
        }
        for workload in self.workloads() {
            documents.push(to_yaml(workload)?);
        }
        documents.push(to_yaml(&self.entrypoint_service)?);
        Ok(documents.join("---\n"))
    }
}

fn to_yaml<T: Serialize>(value: &T) -> Result<String> {
    serde_yaml::to_string(value).map_err(|e| OrchestratorError::invalid(e.to_string()))
}

/// Builds cluster objects from descriptors
#[derive(Debug, Clone, Default)]
pub struct ResourceBuilder {
    workloads: WorkloadSettings,
    ingress: IngressSettings,
}

impl ResourceBuilder {
    pub fn new(workloads: WorkloadSettings, ingress: IngressSettings) -> Self {
        Self { workloads, ingress }
    }

    /// Validate a descriptor and compute every object it needs
    pub fn build(&self, descriptor: &VersionDescriptor) -> Result<ClusterResourceSet> {
        descriptor.validate()?;
        let product = descriptor.product_id.as_str();
        let version = descriptor.version_name.as_str();
        check_version_name(product, version)?;

        let config_maps = vec![
            self.pipeline_config_map(product, version, &descriptor.config)?,
            self.conf_files_config_map(descriptor)?,
        ];

        // Sanitizing and joining can map distinct nodes to one name
        let mut owners: HashMap<String, NodeKey> = HashMap::new();
        let mut node_workloads = Vec::new();
        for workflow in &descriptor.workflows {
            for node in &workflow.nodes {
                let workload = self.workload(descriptor, Some(workflow), &node.name, &node.image)?;
                claim_name(&mut owners, &workload, NodeKey::node(&workflow.name, &node.name))?;
                node_workloads.push(workload);
            }
        }

        let entrypoint_workload =
            self.workload(descriptor, None, ENTRYPOINT_NAME, &descriptor.entrypoint.image)?;
        claim_name(&mut owners, &entrypoint_workload, NodeKey::entrypoint())?;

        Ok(ClusterResourceSet {
            config_maps,
            node_workloads,
            entrypoint_workload,
            entrypoint_service: self.version_service(product, version)?,
        })
    }

    /// Config map holding exactly `entries`, exposed to containers as env
    pub fn pipeline_config_map(
        &self,
        product_id: &str,
        version_name: &str,
        entries: &[ConfigEntry],
    ) -> Result<ConfigMap> {
        let data: BTreeMap<String, String> = entries
            .iter()
            .map(|e| (e.key.clone(), e.value.clone()))
            .collect();
        let mut config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(names::pipeline_config_map(product_id, version_name)),
                labels: Some(object_labels(
                    product_id,
                    Some(version_name),
                    ObjectType::Config,
                )),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };
        stamp_spec_hash(&mut config_map)?;
        Ok(config_map)
    }

    pub fn conf_files_config_map(&self, descriptor: &VersionDescriptor) -> Result<ConfigMap> {
        let product = descriptor.product_id.as_str();
        let version = descriptor.version_name.as_str();
        let mut config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(names::conf_files_config_map(product, version)),
                labels: Some(object_labels(product, Some(version), ObjectType::Config)),
                ..Default::default()
            },
            data: Some(conf::conf_files(descriptor)?),
            ..Default::default()
        };
        stamp_spec_hash(&mut config_map)?;
        Ok(config_map)
    }

    pub fn version_service(&self, product_id: &str, version_name: &str) -> Result<Service> {
        network::version_service(product_id, version_name, &self.workloads)
    }

    pub fn active_service(&self, product_id: &str, version_name: &str) -> Result<Service> {
        network::active_service(product_id, version_name, &self.workloads)
    }

    pub fn ingress(&self, product_id: &str) -> Result<Ingress> {
        network::ingress(product_id, &self.workloads, &self.ingress)
    }

    /// One single-replica Deployment; `workflow` is `None` for the entrypoint
    fn workload(
        &self,
        descriptor: &VersionDescriptor,
        workflow: Option<&Workflow>,
        node_name: &str,
        image: &str,
    ) -> Result<Deployment> {
        let product = descriptor.product_id.as_str();
        let version = descriptor.version_name.as_str();
        let workflow_name = workflow.map(|w| w.name.as_str());

        let (name, object_type) = match workflow_name {
            Some(w) => (names::node_workload(product, version, w, node_name), ObjectType::Node),
            None => (names::entrypoint_workload(product, version), ObjectType::Entrypoint),
        };

        let mut selector_labels = BTreeMap::from([
            (LABEL_PRODUCT.to_string(), product.to_string()),
            (LABEL_VERSION.to_string(), version.to_string()),
            (LABEL_NODE.to_string(), node_name.to_string()),
        ]);
        if let Some(w) = workflow_name {
            selector_labels.insert(LABEL_WORKFLOW.to_string(), w.to_string());
        }
        let mut labels = object_labels(product, Some(version), object_type);
        labels.extend(selector_labels.clone());

        let container = self.container(descriptor, workflow_name, node_name, image);
        let mut deployment = Deployment {
            metadata: ObjectMeta {
                name: Some(name),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: K8sLabelSelector {
                    match_labels: Some(selector_labels),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        volumes: Some(volumes::common_volumes(&names::conf_files_config_map(
                            product, version,
                        ))),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        stamp_spec_hash(&mut deployment)?;
        Ok(deployment)
    }

    fn container(
        &self,
        descriptor: &VersionDescriptor,
        workflow: Option<&str>,
        node_name: &str,
        image: &str,
    ) -> Container {
        let settings = &self.workloads;
        let mut env = vec![
            env_var("VERSO_PRODUCT_ID", &descriptor.product_id),
            env_var("VERSO_VERSION_NAME", &descriptor.version_name),
            env_var("VERSO_NODE_NAME", node_name),
        ];
        if let Some(w) = workflow {
            env.push(env_var("VERSO_WORKFLOW", w));
        }
        env.extend([
            env_var(
                "VERSO_NODE_CONF",
                &conf::conf_file_path(&settings.conf_path, workflow, node_name),
            ),
            env_var("VERSO_PIPELINE_FILES_PATH", &settings.pipeline_files_path),
            env_var("VERSO_LOG_PATH", &settings.log_path),
        ]);

        let config_map =
            names::pipeline_config_map(&descriptor.product_id, &descriptor.version_name);
        let mut container = Container {
            name: names::sanitize(node_name),
            image: Some(image.to_string()),
            image_pull_policy: Some(settings.image_pull_policy.clone()),
            env: Some(env),
            env_from: Some(vec![EnvFromSource {
                config_map_ref: Some(ConfigMapEnvSource {
                    name: config_map.into(),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            volume_mounts: Some(volumes::common_volume_mounts(settings)),
            ..Default::default()
        };

        if workflow.is_none() {
            container.ports = Some(vec![ContainerPort {
                name: Some(ENTRYPOINT_PORT_NAME.to_string()),
                container_port: i32::from(settings.entrypoint_port),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]);
            container.readiness_probe = Some(Probe {
                tcp_socket: Some(TCPSocketAction {
                    port: IntOrString::String(ENTRYPOINT_PORT_NAME.to_string()),
                    ..Default::default()
                }),
                initial_delay_seconds: Some(5),
                period_seconds: Some(10),
                ..Default::default()
            });
        }

        container
    }
}

fn claim_name(
    owners: &mut HashMap<String, NodeKey>,
    workload: &Deployment,
    owner: NodeKey,
) -> Result<()> {
    let name = workload.metadata.name.clone().unwrap_or_default();
    if let Some(previous) = owners.get(&name) {
        return Err(OrchestratorError::invalid(format!(
            "nodes '{}' and '{}' both map to workload name '{}'",
            previous, owner, name
        )));
    }
    owners.insert(name, owner);
    Ok(())
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}
