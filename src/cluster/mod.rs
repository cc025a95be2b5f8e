//! # Cluster access
//!
//! The orchestrator talks to the container orchestrator through the
//! [`ClusterApi`] trait. It exposes namespaced CRUD for any namespaced
//! Kubernetes kind plus a pod watch, which is everything the lifecycle
//! operations need.
//!
//! Two implementations exist:
//!
//! - [`KubeCluster`]: a real API server, via `kube`.
//! - [`MemoryCluster`]: an in-process cluster that stores objects and
//!   simulates pods for every Deployment. Used by `verso serve --backend
//!   memory` and by the test suite.

pub mod kubernetes;
pub mod memory;
pub mod selector;

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub use kubernetes::KubeCluster;
pub use memory::MemoryCluster;
pub use selector::LabelSelector;

/// Errors returned by cluster calls
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClusterError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("API error {code} ({reason}): {message}")]
    Api {
        code: u16,
        reason: String,
        message: String,
    },

    #[error("Cluster unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Pod watch closed")]
    WatchClosed,
}

impl ClusterError {
    /// Errors worth retrying a single call for
    pub fn is_transient(&self) -> bool {
        match self {
            ClusterError::Unavailable(_) => true,
            ClusterError::Api { code, .. } => *code == 429 || *code >= 500,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }
}

/// Any namespaced Kubernetes object the orchestrator can manage
pub trait KubeObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> KubeObject for T where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Kind name of a managed object type, e.g. "ConfigMap"
pub fn kind_of<K: KubeObject>() -> String {
    K::kind(&()).to_string()
}

/// The parts of a pod the readiness logic cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodObservation {
    pub name: String,
    pub uid: String,
    pub labels: BTreeMap<String, String>,
    pub ready: bool,
}

impl PodObservation {
    /// A pod is ready when it is `Running` and its `Ready` condition is `True`
    pub fn from_pod(pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        let running = status.and_then(|s| s.phase.as_deref()) == Some("Running");
        let ready_condition = status
            .and_then(|s| s.conditions.as_ref())
            .map(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .unwrap_or(false);

        Self {
            name: pod.metadata.name.clone().unwrap_or_default(),
            uid: pod.metadata.uid.clone().unwrap_or_default(),
            labels: pod.metadata.labels.clone().unwrap_or_default(),
            ready: running && ready_condition,
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Pod lifecycle event delivered by a watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodEvent {
    /// Pod was added or updated
    Applied(PodObservation),
    /// Pod was deleted
    Deleted(PodObservation),
}

impl PodEvent {
    pub fn pod(&self) -> &PodObservation {
        match self {
            PodEvent::Applied(pod) | PodEvent::Deleted(pod) => pod,
        }
    }
}

/// Stream of pod events; dropping it ends the subscription
pub type PodEventStream = BoxStream<'static, Result<PodEvent, ClusterError>>;

/// Namespaced access to the container orchestrator
#[async_trait]
pub trait ClusterApi: Send + Sync + 'static {
    /// Fetch an object, `None` if absent
    async fn get<K: KubeObject>(&self, namespace: &str, name: &str)
        -> Result<Option<K>, ClusterError>;

    /// List objects matching a selector
    async fn list<K: KubeObject>(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<K>, ClusterError>;

    /// Create an object; fails with `AlreadyExists` if the name is taken
    async fn create<K: KubeObject>(&self, namespace: &str, object: &K) -> Result<K, ClusterError>;

    /// Create or fully update an object (server-side apply)
    async fn apply<K: KubeObject>(&self, namespace: &str, object: &K) -> Result<K, ClusterError>;

    /// JSON merge patch an existing object
    async fn patch_merge<K: KubeObject>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K, ClusterError>;

    /// Delete an object; fails with `NotFound` if absent
    async fn delete<K: KubeObject>(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    /// Subscribe to pod events. Existing pods are delivered first as
    /// `Applied` events.
    async fn watch_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<PodEventStream, ClusterError>;

    /// Current pods matching a selector
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<PodObservation>, ClusterError> {
        let pods: Vec<Pod> = self.list(namespace, selector).await?;
        Ok(pods.iter().map(PodObservation::from_pod).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(phase: &str, ready: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("p1-v1-entrypoint-abc".to_string()),
                uid: Some("uid-1".to_string()),
                labels: Some(BTreeMap::from([(
                    "node-name".to_string(),
                    "entrypoint".to_string(),
                )])),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: ready.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_running_and_ready_pod() {
        let obs = PodObservation::from_pod(&pod("Running", "True"));
        assert!(obs.ready);
        assert_eq!(obs.uid, "uid-1");
        assert_eq!(obs.label("node-name"), Some("entrypoint"));
    }

    #[test]
    fn test_running_but_not_ready_pod() {
        assert!(!PodObservation::from_pod(&pod("Running", "False")).ready);
    }

    #[test]
    fn test_pending_pod_is_not_ready() {
        assert!(!PodObservation::from_pod(&pod("Pending", "True")).ready);
    }

    #[test]
    fn test_pod_without_status() {
        let obs = PodObservation::from_pod(&Pod::default());
        assert!(!obs.ready);
        assert!(obs.name.is_empty());
    }

    #[test]
    fn test_transient_errors() {
        assert!(ClusterError::Unavailable("connection refused".into()).is_transient());
        assert!(ClusterError::Api {
            code: 503,
            reason: "ServiceUnavailable".into(),
            message: "etcd".into()
        }
        .is_transient());
        assert!(!ClusterError::Api {
            code: 403,
            reason: "Forbidden".into(),
            message: "no".into()
        }
        .is_transient());
        assert!(!ClusterError::WatchClosed.is_transient());
    }

    #[test]
    fn test_kind_of() {
        assert_eq!(kind_of::<Pod>(), "Pod");
        assert_eq!(
            kind_of::<k8s_openapi::api::core::v1::ConfigMap>(),
            "ConfigMap"
        );
    }
}
