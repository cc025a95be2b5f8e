//! `ClusterApi` backed by a real Kubernetes API server

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use tracing::{debug, warn};

use super::{
    kind_of, ClusterApi, ClusterError, KubeObject, LabelSelector, PodEvent, PodEventStream,
    PodObservation,
};

/// Field manager used for server-side apply
pub const DEFAULT_FIELD_MANAGER: &str = "verso";

/// Cluster access through `kube::Client`
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    field_manager: String,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
        }
    }

    /// Connect using the in-cluster config or the local kubeconfig
    pub async fn try_default() -> Result<Self, ClusterError> {
        let client = Client::try_default()
            .await
            .map_err(|e| ClusterError::Unavailable(e.to_string()))?;
        Ok(Self::new(client))
    }

    pub fn with_field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.field_manager = field_manager.into();
        self
    }

    fn api<K: KubeObject>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn apply_params(&self) -> PatchParams {
        PatchParams::apply(&self.field_manager).force()
    }
}

/// Translate a `kube` error, naming the object for 404/409 responses
fn map_error<K: KubeObject>(err: kube::Error, name: &str) -> ClusterError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound {
            kind: kind_of::<K>(),
            name: name.to_string(),
        },
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            ClusterError::AlreadyExists {
                kind: kind_of::<K>(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(ae) => ClusterError::Api {
            code: ae.code,
            reason: ae.reason,
            message: ae.message,
        },
        kube::Error::SerdeError(e) => ClusterError::Serialization(e.to_string()),
        other => ClusterError::Unavailable(other.to_string()),
    }
}

fn object_name<K: KubeObject>(object: &K) -> Result<String, ClusterError> {
    object.meta().name.clone().ok_or_else(|| {
        ClusterError::Serialization(format!("{} without metadata.name", kind_of::<K>()))
    })
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get<K: KubeObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, ClusterError> {
        self.api::<K>(namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_error::<K>(e, name))
    }

    async fn list<K: KubeObject>(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<K>, ClusterError> {
        let params = ListParams::default().labels(&selector.to_string());
        let list = self
            .api::<K>(namespace)
            .list(&params)
            .await
            .map_err(|e| map_error::<K>(e, &selector.to_string()))?;
        Ok(list.items)
    }

    async fn create<K: KubeObject>(&self, namespace: &str, object: &K) -> Result<K, ClusterError> {
        let name = object_name(object)?;
        debug!("Creating {} {}/{}", kind_of::<K>(), namespace, name);
        self.api::<K>(namespace)
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| map_error::<K>(e, &name))
    }

    async fn apply<K: KubeObject>(&self, namespace: &str, object: &K) -> Result<K, ClusterError> {
        let name = object_name(object)?;
        debug!("Applying {} {}/{}", kind_of::<K>(), namespace, name);
        self.api::<K>(namespace)
            .patch(&name, &self.apply_params(), &Patch::Apply(object))
            .await
            .map_err(|e| map_error::<K>(e, &name))
    }

    async fn patch_merge<K: KubeObject>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K, ClusterError> {
        debug!("Patching {} {}/{}", kind_of::<K>(), namespace, name);
        self.api::<K>(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_error::<K>(e, name))
    }

    async fn delete<K: KubeObject>(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        debug!("Deleting {} {}/{}", kind_of::<K>(), namespace, name);
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..DeleteParams::foreground()
        };
        self.api::<K>(namespace)
            .delete(name, &params)
            .await
            .map(|_| ())
            .map_err(|e| map_error::<K>(e, name))
    }

    async fn watch_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<PodEventStream, ClusterError> {
        let api: Api<Pod> = self.api(namespace);
        let config = watcher::Config::default().labels(&selector.to_string());
        debug!("Watching pods in {} with selector {}", namespace, selector);

        let stream = watcher(api, config)
            .default_backoff()
            .map_err(|e| {
                warn!("Pod watch error: {}", e);
                ClusterError::Unavailable(e.to_string())
            })
            .filter_map(|event| async move {
                match event {
                    Ok(watcher::Event::Apply(pod)) | Ok(watcher::Event::InitApply(pod)) => {
                        Some(Ok(PodEvent::Applied(PodObservation::from_pod(&pod))))
                    }
                    Ok(watcher::Event::Delete(pod)) => {
                        debug!("Pod {} deleted", pod.name_any());
                        Some(Ok(PodEvent::Deleted(PodObservation::from_pod(&pod))))
                    }
                    Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => None,
                    Err(e) => Some(Err(e)),
                }
            });

        Ok(stream.boxed())
    }
}
