//! Namespace-scoped access to the objects of a version
//!
//! The gateway turns raw cluster calls into the guarantees the lifecycle
//! operations rely on:
//! - creates tolerate an identical existing object and reject a different one
//! - deletes treat an absent object as deleted
//! - "sync" operations return only once their effect is observable, or fail
//!   with `ResourceSyncTimeout` when the deadline passes
//! - transient cluster failures are retried with exponential backoff

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::api::networking::v1::Ingress;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cluster::{kind_of, ClusterApi, ClusterError, KubeObject, LabelSelector, PodObservation};
use crate::config::Settings;
use crate::error::{OrchestratorError, Result};
use crate::resources::{self, names, spec_hash};

/// Pod template annotation that forces a rollout
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Timing of sync operations and retries
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayOptions {
    pub sync_timeout: Duration,
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for GatewayOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            sync_timeout: settings.timeouts.sync(),
            poll_interval: settings.timeouts.poll_interval(),
            max_attempts: settings.retry.max_attempts.max(1),
            backoff: settings.retry.backoff(),
        }
    }
}

pub struct ResourceGateway<C: ClusterApi> {
    cluster: Arc<C>,
    namespace: String,
    options: GatewayOptions,
}

impl<C: ClusterApi> ResourceGateway<C> {
    pub fn new(cluster: Arc<C>, namespace: impl Into<String>, options: GatewayOptions) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            options,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Create every config map of a version
    pub async fn create_config(&self, config_maps: &[ConfigMap]) -> Result<()> {
        for config_map in config_maps {
            self.ensure(config_map).await?;
        }
        Ok(())
    }

    pub async fn create_workloads(&self, workloads: &[Deployment]) -> Result<()> {
        for workload in workloads {
            self.ensure(workload).await?;
        }
        Ok(())
    }

    /// Create a version-scoped service; also restores it after unpublish
    pub async fn create_entrypoint_service(&self, service: &Service) -> Result<()> {
        self.ensure(service).await
    }

    /// Create or update the product ingress
    pub async fn upsert_ingress(&self, ingress: &Ingress) -> Result<()> {
        self.apply(ingress).await
    }

    /// Create the active service or re-point the existing one
    pub async fn bind_active_service(&self, service: &Service) -> Result<()> {
        self.apply(service).await
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get_active_service(&self, product_id: &str) -> Result<Option<Service>> {
        let name = names::active_service(product_id);
        self.get(&name).await
    }

    pub async fn get_entrypoint_service(
        &self,
        product_id: &str,
        version_name: &str,
    ) -> Result<Option<Service>> {
        let name = names::version_service(product_id, version_name);
        self.get(&name).await
    }

    pub async fn list_workloads(
        &self,
        product_id: &str,
        version_name: &str,
    ) -> Result<Vec<Deployment>> {
        let selector = resources::workload_selector(product_id, version_name);
        let selector = &selector;
        let ns = self.namespace.as_str();
        let cluster = self.cluster.as_ref();
        Ok(self
            .call("list workloads", move || cluster.list::<Deployment>(ns, selector))
            .await?)
    }

    pub async fn list_version_pods(
        &self,
        product_id: &str,
        version_name: &str,
    ) -> Result<Vec<PodObservation>> {
        let selector = resources::workload_selector(product_id, version_name);
        let selector = &selector;
        let ns = self.namespace.as_str();
        let cluster = self.cluster.as_ref();
        Ok(self
            .call("list pods", move || cluster.list_pods(ns, selector))
            .await?)
    }

    async fn list_config_maps(&self, product_id: &str, version_name: &str) -> Result<Vec<ConfigMap>> {
        let selector = resources::config_selector(product_id, version_name);
        let selector = &selector;
        let ns = self.namespace.as_str();
        let cluster = self.cluster.as_ref();
        Ok(self
            .call("list config maps", move || cluster.list::<ConfigMap>(ns, selector))
            .await?)
    }

    // =========================================================================
    // Deletion
    // =========================================================================

    /// Delete every config map of a version and wait until they are gone
    pub async fn delete_config(&self, product_id: &str, version_name: &str) -> Result<()> {
        for config_map in self.list_config_maps(product_id, version_name).await? {
            if let Some(name) = config_map.metadata.name.as_deref() {
                self.remove::<ConfigMap>(name).await?;
            }
        }

        let operation = format!("deletion of config maps of {}/{}", product_id, version_name);
        self.wait_until(&operation, move || async move {
            Ok(self.list_config_maps(product_id, version_name).await?.is_empty())
        })
        .await
    }

    /// Delete one config map and wait until it is gone
    pub async fn delete_config_map(&self, name: &str) -> Result<()> {
        self.remove::<ConfigMap>(name).await?;

        let operation = format!("deletion of config map {}", name);
        self.wait_until(&operation, move || async move {
            Ok(self.get::<ConfigMap>(name).await?.is_none())
        })
        .await
    }

    /// Delete every workload of a version and wait until their pods are gone
    pub async fn delete_workloads(&self, product_id: &str, version_name: &str) -> Result<()> {
        for workload in self.list_workloads(product_id, version_name).await? {
            if let Some(name) = workload.metadata.name.as_deref() {
                self.remove::<Deployment>(name).await?;
            }
        }

        let operation = format!("deletion of pods of {}/{}", product_id, version_name);
        self.wait_until(&operation, move || async move {
            Ok(self.list_version_pods(product_id, version_name).await?.is_empty())
        })
        .await
    }

    pub async fn delete_entrypoint_service(&self, product_id: &str, version_name: &str) -> Result<()> {
        self.remove::<Service>(&names::version_service(product_id, version_name))
            .await
    }

    pub async fn delete_ingress(&self, product_id: &str) -> Result<()> {
        self.remove::<Ingress>(&names::ingress(product_id)).await
    }

    pub async fn delete_active_service(&self, product_id: &str) -> Result<()> {
        self.remove::<Service>(&names::active_service(product_id))
            .await
    }

    // =========================================================================
    // Restart
    // =========================================================================

    /// Roll every workload of a version and wait until no pre-restart pod
    /// remains and each workload has a pod again
    pub async fn restart_workloads(&self, product_id: &str, version_name: &str) -> Result<()> {
        let workloads = self.list_workloads(product_id, version_name).await?;
        if workloads.is_empty() {
            debug!("No workloads to restart for {}/{}", product_id, version_name);
            return Ok(());
        }

        let old_uids: HashSet<String> = self
            .list_version_pods(product_id, version_name)
            .await?
            .into_iter()
            .map(|pod| pod.uid)
            .collect();

        let patch = json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": {
                            RESTARTED_AT_ANNOTATION: chrono::Utc::now().to_rfc3339()
                        }
                    }
                }
            }
        });

        let ns = self.namespace.as_str();
        let cluster = self.cluster.as_ref();
        let patch = &patch;
        for workload in &workloads {
            let Some(name) = workload.metadata.name.as_deref() else {
                continue;
            };
            self.call("restart workload", move || {
                cluster.patch_merge::<Deployment>(ns, name, patch)
            })
            .await?;
        }
        info!(
            "Restarted {} workloads of {}/{}",
            workloads.len(),
            product_id,
            version_name
        );

        let selectors: Vec<LabelSelector> = workloads.iter().filter_map(pod_selector).collect();
        let selectors = &selectors;
        let old_uids = &old_uids;
        let operation = format!("restart of workloads of {}/{}", product_id, version_name);
        self.wait_until(&operation, move || async move {
            let pods = self.list_version_pods(product_id, version_name).await?;
            let replaced = pods.iter().all(|pod| !old_uids.contains(&pod.uid));
            let covered = selectors
                .iter()
                .all(|selector| pods.iter().any(|pod| selector.matches(&pod.labels)));
            Ok(replaced && covered)
        })
        .await
    }

    // =========================================================================
    // Primitives
    // =========================================================================

    async fn get<K: KubeObject>(&self, name: &str) -> Result<Option<K>> {
        let ns = self.namespace.as_str();
        let cluster = self.cluster.as_ref();
        Ok(self.call("get", move || cluster.get::<K>(ns, name)).await?)
    }

    async fn apply<K: KubeObject>(&self, object: &K) -> Result<()> {
        let ns = self.namespace.as_str();
        let cluster = self.cluster.as_ref();
        self.call("apply", move || cluster.apply(ns, object)).await?;
        Ok(())
    }

    /// Create `object`, accepting an existing object with the same spec hash
    async fn ensure<K: KubeObject>(&self, object: &K) -> Result<()> {
        let kind = kind_of::<K>();
        let name = object.meta().name.clone().unwrap_or_default();
        let ns = self.namespace.as_str();
        let cluster = self.cluster.as_ref();

        match self.call("create", move || cluster.create(ns, object)).await {
            Ok(_) => {
                debug!("Created {} {}/{}", kind, ns, name);
                Ok(())
            }
            Err(ClusterError::AlreadyExists { .. }) => match self.get::<K>(&name).await? {
                Some(existing) if spec_hash(&existing) == spec_hash(object) => {
                    debug!("{} {}/{} already exists", kind, ns, name);
                    Ok(())
                }
                Some(_) => Err(OrchestratorError::ResourceConflict { kind, name }),
                // Deleted in between, try once more
                None => {
                    self.call("create", move || cluster.create(ns, object))
                        .await?;
                    Ok(())
                }
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Delete `name`, treating an absent object as deleted
    async fn remove<K: KubeObject>(&self, name: &str) -> Result<()> {
        let ns = self.namespace.as_str();
        let cluster = self.cluster.as_ref();
        match self.call("delete", move || cluster.delete::<K>(ns, name)).await {
            Ok(()) => {
                debug!("Deleted {} {}/{}", kind_of::<K>(), ns, name);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!("{} {}/{} already absent", kind_of::<K>(), ns, name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run one cluster call, retrying transient failures
    async fn call<T, F, Fut>(&self, what: &str, op: F) -> std::result::Result<T, ClusterError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, ClusterError>>,
    {
        let mut attempt = 1;
        let mut delay = self.options.backoff;
        loop {
            match op().await {
                Err(e) if e.is_transient() && attempt < self.options.max_attempts => {
                    warn!(
                        "Cluster call '{}' failed (attempt {}/{}): {}, retrying in {:?}",
                        what, attempt, self.options.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    delay *= 2;
                }
                result => return result,
            }
        }
    }

    /// Poll `check` until it holds or the sync deadline passes
    async fn wait_until<F, Fut>(&self, operation: &str, check: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let deadline = self.options.sync_timeout;
        let poll = async {
            loop {
                if check().await? {
                    return Ok(());
                }
                tokio::time::sleep(self.options.poll_interval).await;
            }
        };

        match tokio::time::timeout(deadline, poll).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Timed out after {:?} waiting for {}", deadline, operation);
                Err(OrchestratorError::ResourceSyncTimeout {
                    operation: operation.to_string(),
                    waited: deadline,
                })
            }
        }
    }
}

/// Pods a workload owns, from its `matchLabels`
fn pod_selector(workload: &Deployment) -> Option<LabelSelector> {
    let labels = workload.spec.as_ref()?.selector.match_labels.as_ref()?;
    Some(labels.iter().fold(LabelSelector::new(), |selector, (key, value)| {
        selector.with_label(key.as_str(), value.as_str())
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::Verb;
    use crate::cluster::MemoryCluster;
    use crate::descriptor::tests::sample_descriptor;
    use crate::resources::ResourceBuilder;

    const NS: &str = "test";

    fn fast_options() -> GatewayOptions {
        GatewayOptions {
            sync_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
            max_attempts: 3,
            backoff: Duration::from_millis(1),
        }
    }

    fn gateway(cluster: &MemoryCluster) -> ResourceGateway<MemoryCluster> {
        ResourceGateway::new(Arc::new(cluster.clone()), NS, fast_options())
    }

    #[tokio::test]
    async fn test_create_config_is_idempotent() {
        let cluster = MemoryCluster::new();
        let gw = gateway(&cluster);
        let set = ResourceBuilder::default().build(&sample_descriptor()).unwrap();

        gw.create_config(&set.config_maps).await.unwrap();
        gw.create_config(&set.config_maps).await.unwrap();
        assert_eq!(cluster.object_names("ConfigMap", NS).len(), 2);
    }

    #[tokio::test]
    async fn test_create_with_different_spec_conflicts() {
        let cluster = MemoryCluster::new();
        let gw = gateway(&cluster);
        let builder = ResourceBuilder::default();

        let first = builder.pipeline_config_map("p1", "v1", &[]).unwrap();
        gw.create_config(&[first]).await.unwrap();

        let second = builder
            .pipeline_config_map(
                "p1",
                "v1",
                &[crate::descriptor::ConfigEntry::new("K", "changed")],
            )
            .unwrap();
        let err = gw.create_config(&[second]).await.unwrap_err();
        assert_eq!(
            err,
            OrchestratorError::ResourceConflict {
                kind: "ConfigMap".to_string(),
                name: "p1-v1-config".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let cluster = MemoryCluster::new();
        cluster.inject_fault(
            Verb::Create,
            "ConfigMap",
            ClusterError::Unavailable("connection reset".into()),
            2,
        );
        let gw = gateway(&cluster);
        let cm = ResourceBuilder::default()
            .pipeline_config_map("p1", "v1", &[])
            .unwrap();
        gw.create_config(&[cm]).await.unwrap();
        assert_eq!(cluster.object_names("ConfigMap", NS), vec!["p1-v1-config"]);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let cluster = MemoryCluster::new();
        cluster.inject_fault(
            Verb::Create,
            "ConfigMap",
            ClusterError::Unavailable("down".into()),
            3,
        );
        let gw = gateway(&cluster);
        let cm = ResourceBuilder::default()
            .pipeline_config_map("p1", "v1", &[])
            .unwrap();
        let err = gw.create_config(&[cm]).await.unwrap_err();
        assert_eq!(
            err,
            OrchestratorError::Cluster(ClusterError::Unavailable("down".into()))
        );
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let cluster = MemoryCluster::new();
        let forbidden = ClusterError::Api {
            code: 403,
            reason: "Forbidden".into(),
            message: "denied".into(),
        };
        cluster.inject_fault(Verb::Create, "ConfigMap", forbidden.clone(), 1);
        let gw = gateway(&cluster);
        let cm = ResourceBuilder::default()
            .pipeline_config_map("p1", "v1", &[])
            .unwrap();
        assert_eq!(
            gw.create_config(&[cm]).await.unwrap_err(),
            OrchestratorError::Cluster(forbidden)
        );
    }

    #[tokio::test]
    async fn test_deletes_tolerate_absence() {
        let cluster = MemoryCluster::new();
        let gw = gateway(&cluster);
        gw.delete_config("p1", "v1").await.unwrap();
        gw.delete_config_map("p1-v1-config").await.unwrap();
        gw.delete_workloads("p1", "v1").await.unwrap();
        gw.delete_entrypoint_service("p1", "v1").await.unwrap();
        gw.delete_ingress("p1").await.unwrap();
        gw.delete_active_service("p1").await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_workloads_waits_for_pods() {
        let cluster = MemoryCluster::with_auto_ready();
        let gw = gateway(&cluster);
        let set = ResourceBuilder::default().build(&sample_descriptor()).unwrap();
        gw.create_workloads(&set.node_workloads).await.unwrap();
        assert_eq!(gw.list_version_pods("p1", "v1").await.unwrap().len(), 2);

        gw.delete_workloads("p1", "v1").await.unwrap();
        assert!(gw.list_version_pods("p1", "v1").await.unwrap().is_empty());
        assert!(cluster.object_names("Deployment", NS).is_empty());
    }

    #[tokio::test]
    async fn test_stuck_deletion_times_out() {
        let cluster = MemoryCluster::new();
        cluster.set_pod_deletion_stuck(true);
        let gw = gateway(&cluster);
        let set = ResourceBuilder::default().build(&sample_descriptor()).unwrap();
        gw.create_workloads(&set.node_workloads).await.unwrap();

        let err = gw.delete_workloads("p1", "v1").await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::ResourceSyncTimeout { waited, .. } if waited == Duration::from_millis(500)
        ));
    }

    #[tokio::test]
    async fn test_restart_replaces_every_pod() {
        let cluster = MemoryCluster::new();
        let gw = gateway(&cluster);
        let set = ResourceBuilder::default().build(&sample_descriptor()).unwrap();
        gw.create_workloads(&set.node_workloads).await.unwrap();
        gw.create_workloads(std::slice::from_ref(&set.entrypoint_workload))
            .await
            .unwrap();

        let before: HashSet<String> = gw
            .list_version_pods("p1", "v1")
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.uid)
            .collect();

        gw.restart_workloads("p1", "v1").await.unwrap();

        let after = gw.list_version_pods("p1", "v1").await.unwrap();
        assert_eq!(after.len(), 3);
        assert!(after.iter().all(|p| !before.contains(&p.uid)));
    }

    #[tokio::test]
    async fn test_restart_waits_for_a_pod_of_each_workload() {
        let cluster = MemoryCluster::new();
        let gw = gateway(&cluster);
        let mut set = ResourceBuilder::default().build(&sample_descriptor()).unwrap();
        // n1 runs extra pods while n2 is scaled to zero
        set.node_workloads[0].spec.as_mut().unwrap().replicas = Some(3);
        set.node_workloads[1].spec.as_mut().unwrap().replicas = Some(0);
        gw.create_workloads(&set.node_workloads).await.unwrap();
        gw.create_workloads(std::slice::from_ref(&set.entrypoint_workload))
            .await
            .unwrap();
        assert_eq!(gw.list_version_pods("p1", "v1").await.unwrap().len(), 4);

        let err = gw.restart_workloads("p1", "v1").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ResourceSyncTimeout { .. }));
    }

    #[test]
    fn test_pod_selector_matches_only_own_pods() {
        let set = ResourceBuilder::default().build(&sample_descriptor()).unwrap();
        let n1 = pod_selector(&set.node_workloads[0]).unwrap();
        let labels_of = |workload: &Deployment| {
            let template = &workload.spec.as_ref().unwrap().template;
            template.metadata.as_ref().unwrap().labels.clone().unwrap()
        };
        assert!(n1.matches(&labels_of(&set.node_workloads[0])));
        assert!(!n1.matches(&labels_of(&set.node_workloads[1])));
        assert!(!n1.matches(&labels_of(&set.entrypoint_workload)));
    }

    #[tokio::test]
    async fn test_bind_active_service_repoints_in_place() {
        let cluster = MemoryCluster::new();
        let gw = gateway(&cluster);
        let builder = ResourceBuilder::default();

        gw.bind_active_service(&builder.active_service("p1", "v1").unwrap())
            .await
            .unwrap();
        gw.bind_active_service(&builder.active_service("p1", "v2").unwrap())
            .await
            .unwrap();

        let active = gw.get_active_service("p1").await.unwrap().unwrap();
        assert_eq!(resources::network::bound_version(&active), Some("v2"));
        assert_eq!(
            cluster.object_names("Service", NS),
            vec!["p1-active-entrypoint"]
        );
    }

    #[tokio::test]
    async fn test_list_version_pods_scoped_to_version() {
        let cluster = MemoryCluster::new();
        let gw = gateway(&cluster);
        let set = ResourceBuilder::default().build(&sample_descriptor()).unwrap();
        gw.create_workloads(&set.node_workloads).await.unwrap();

        assert_eq!(gw.list_version_pods("p1", "v1").await.unwrap().len(), 2);
        assert!(gw.list_version_pods("p1", "v2").await.unwrap().is_empty());
        assert_eq!(
            cluster.set_pods_ready(NS, &LabelSelector::matching("node-name", "n1"), true),
            1
        );
    }
}
