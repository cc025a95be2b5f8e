//! # Version orchestrator
//!
//! Facade over the lifecycle operations. A version moves through
//!
//! ```text
//! Absent --start--> Starting --pods ready--> Started --publish--> Published
//!                                              ^                      |
//!                                              +------unpublish-------+
//! Started/Starting --stop--> Absent
//! ```
//!
//! The state is never stored: it is whatever the cluster currently holds,
//! see [`VersionOrchestrator::version_status`]. Each operation runs its steps
//! in order and stops at the first failure without compensating; every
//! operation is safe to retry. Operations on the same version are not
//! serialized against each other.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cluster::ClusterApi;
use crate::config::Settings;
use crate::descriptor::{expected_nodes, ConfigEntry, VersionDescriptor, Workflow};
use crate::error::Result;
use crate::gateway::{GatewayOptions, ResourceGateway};
use crate::readiness::{ReadinessTracker, WaitOutcome};
use crate::resources::network::bound_version;
use crate::resources::{names, ResourceBuilder};
use crate::traffic::TrafficSwitch;

/// Lifecycle phase derived from cluster contents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionPhase {
    Absent,
    Starting,
    Started,
    Published,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionStatus {
    pub product_id: String,
    pub version_name: String,
    pub namespace: String,
    pub phase: VersionPhase,
    pub workloads: usize,
    pub ready_pods: usize,
    pub total_pods: usize,
}

pub struct VersionOrchestrator<C: ClusterApi> {
    cluster: Arc<C>,
    builder: ResourceBuilder,
    gateway_options: GatewayOptions,
    readiness_timeout: Duration,
    default_namespace: String,
}

impl<C: ClusterApi> VersionOrchestrator<C> {
    pub fn new(cluster: Arc<C>, settings: &Settings) -> Self {
        Self {
            cluster,
            builder: ResourceBuilder::new(settings.workloads.clone(), settings.ingress.clone()),
            gateway_options: GatewayOptions::from(settings),
            readiness_timeout: settings.timeouts.readiness(),
            default_namespace: settings.cluster.namespace.clone(),
        }
    }

    pub fn with_gateway_options(mut self, options: GatewayOptions) -> Self {
        self.gateway_options = options;
        self
    }

    pub fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = timeout;
        self
    }

    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    pub fn builder(&self) -> &ResourceBuilder {
        &self.builder
    }

    fn gateway(&self, namespace: &str) -> ResourceGateway<C> {
        ResourceGateway::new(
            self.cluster.clone(),
            namespace,
            self.gateway_options.clone(),
        )
    }

    /// Create every object of a version. Does not wait for pods.
    pub async fn start(&self, descriptor: &VersionDescriptor) -> Result<()> {
        let set = self.builder.build(descriptor)?;
        let namespace = descriptor.namespace_or(&self.default_namespace);
        let product = descriptor.product_id.as_str();
        let version = descriptor.version_name.as_str();
        let gateway = self.gateway(namespace);

        info!("Starting version {}/{} in {}", product, version, namespace);
        gateway.create_config(&set.config_maps).await?;
        gateway.create_workloads(&set.node_workloads).await?;
        gateway
            .create_workloads(std::slice::from_ref(&set.entrypoint_workload))
            .await?;
        gateway
            .create_entrypoint_service(&set.entrypoint_service)
            .await?;

        info!(
            "Version {}/{} started with {} node workloads",
            product,
            version,
            set.node_workloads.len()
        );
        Ok(())
    }

    /// Block until the entrypoint and every node of `workflows` run a ready pod
    pub async fn wait_for_version_pods(
        &self,
        product_id: &str,
        version_name: &str,
        namespace: &str,
        workflows: &[Workflow],
        cancel: CancellationToken,
    ) -> Result<WaitOutcome> {
        ReadinessTracker::new(self.cluster.clone(), self.readiness_timeout)
            .wait(
                namespace,
                product_id,
                version_name,
                expected_nodes(workflows),
                cancel,
            )
            .await
    }

    /// Remove every object of a version; succeeds on partial or absent state
    pub async fn stop(&self, product_id: &str, version_name: &str, namespace: &str) -> Result<()> {
        let gateway = self.gateway(namespace);

        info!("Stopping version {}/{} in {}", product_id, version_name, namespace);
        gateway.delete_config(product_id, version_name).await?;
        gateway
            .delete_entrypoint_service(product_id, version_name)
            .await?;
        gateway.delete_workloads(product_id, version_name).await?;

        info!("Version {}/{} stopped", product_id, version_name);
        Ok(())
    }

    pub async fn publish(&self, product_id: &str, version_name: &str, namespace: &str) -> Result<()> {
        let gateway = self.gateway(namespace);
        TrafficSwitch::new(&gateway, &self.builder)
            .publish(product_id, version_name)
            .await
    }

    pub async fn unpublish(&self, product_id: &str, version_name: &str, namespace: &str) -> Result<()> {
        let gateway = self.gateway(namespace);
        TrafficSwitch::new(&gateway, &self.builder)
            .unpublish(product_id, version_name)
            .await
    }

    /// Replace the pipeline config map with exactly `entries` and restart
    /// every workload so the new values are read
    pub async fn update_config(
        &self,
        product_id: &str,
        version_name: &str,
        namespace: &str,
        entries: &[ConfigEntry],
    ) -> Result<()> {
        let gateway = self.gateway(namespace);
        let config_map = self
            .builder
            .pipeline_config_map(product_id, version_name, entries)?;

        info!(
            "Updating config of {}/{} ({} entries)",
            product_id,
            version_name,
            entries.len()
        );
        gateway
            .delete_config_map(&names::pipeline_config_map(product_id, version_name))
            .await?;
        gateway.create_config(&[config_map]).await?;
        gateway.restart_workloads(product_id, version_name).await?;

        info!("Config of {}/{} updated", product_id, version_name);
        Ok(())
    }

    /// Derive the lifecycle phase of a version from what the cluster holds
    pub async fn version_status(
        &self,
        product_id: &str,
        version_name: &str,
        namespace: &str,
    ) -> Result<VersionStatus> {
        let gateway = self.gateway(namespace);
        let workloads = gateway.list_workloads(product_id, version_name).await?.len();
        let pods = gateway.list_version_pods(product_id, version_name).await?;
        let ready_pods = pods.iter().filter(|pod| pod.ready).count();
        let published = gateway
            .get_active_service(product_id)
            .await?
            .is_some_and(|svc| bound_version(&svc) == Some(version_name));

        let phase = if workloads == 0 {
            VersionPhase::Absent
        } else if published {
            VersionPhase::Published
        } else if ready_pods >= workloads && ready_pods == pods.len() {
            VersionPhase::Started
        } else {
            VersionPhase::Starting
        };

        Ok(VersionStatus {
            product_id: product_id.to_string(),
            version_name: version_name.to_string(),
            namespace: namespace.to_string(),
            phase,
            workloads,
            ready_pods,
            total_pods: pods.len(),
        })
    }
}
