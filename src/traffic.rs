//! Publish/unpublish cutover
//!
//! A product's ingress always targets `<product>-active-entrypoint`. Publishing
//! re-points that service at a version's entrypoint pods; the version's own
//! private service is then removed so the entrypoint has exactly one route.
//! Unpublishing reverses this.

use tracing::{info, warn};

use crate::cluster::ClusterApi;
use crate::error::Result;
use crate::gateway::ResourceGateway;
use crate::resources::network::bound_version;
use crate::resources::{check_version_name, ResourceBuilder};

pub struct TrafficSwitch<'a, C: ClusterApi> {
    gateway: &'a ResourceGateway<C>,
    builder: &'a ResourceBuilder,
}

impl<'a, C: ClusterApi> TrafficSwitch<'a, C> {
    pub fn new(gateway: &'a ResourceGateway<C>, builder: &'a ResourceBuilder) -> Self {
        Self { gateway, builder }
    }

    /// Make `version_name` the active version of `product_id`
    pub async fn publish(&self, product_id: &str, version_name: &str) -> Result<()> {
        check_version_name(product_id, version_name)?;
        self.gateway
            .upsert_ingress(&self.builder.ingress(product_id)?)
            .await?;

        // The version losing the binding must stay addressable
        if let Some(active) = self.gateway.get_active_service(product_id).await? {
            match bound_version(&active) {
                Some(previous) if previous != version_name => {
                    info!(
                        "Restoring service of previously active version {}/{}",
                        product_id, previous
                    );
                    let service = self.builder.version_service(product_id, previous)?;
                    self.gateway.create_entrypoint_service(&service).await?;
                }
                _ => {}
            }
        }

        self.gateway
            .bind_active_service(&self.builder.active_service(product_id, version_name)?)
            .await?;
        self.gateway
            .delete_entrypoint_service(product_id, version_name)
            .await?;

        info!("Published {}/{}", product_id, version_name);
        Ok(())
    }

    /// Remove `version_name` from the traffic path and restore its private
    /// service
    pub async fn unpublish(&self, product_id: &str, version_name: &str) -> Result<()> {
        check_version_name(product_id, version_name)?;
        self.gateway.delete_ingress(product_id).await?;

        if let Some(active) = self.gateway.get_active_service(product_id).await? {
            if let Some(bound) = bound_version(&active) {
                if bound != version_name {
                    warn!(
                        "Active service of {} targets {}, not {}; removing it anyway",
                        product_id, bound, version_name
                    );
                }
            }
        }
        self.gateway.delete_active_service(product_id).await?;

        self.gateway
            .create_entrypoint_service(&self.builder.version_service(product_id, version_name)?)
            .await?;

        info!("Unpublished {}/{}", product_id, version_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryCluster;
    use crate::error::OrchestratorError;
    use crate::gateway::GatewayOptions;
    use std::sync::Arc;

    const NS: &str = "test";

    fn setup() -> (MemoryCluster, ResourceGateway<MemoryCluster>, ResourceBuilder) {
        let cluster = MemoryCluster::new();
        let gateway = ResourceGateway::new(Arc::new(cluster.clone()), NS, GatewayOptions::default());
        (cluster, gateway, ResourceBuilder::default())
    }

    #[tokio::test]
    async fn test_publish_binds_and_removes_version_service() {
        let (cluster, gateway, builder) = setup();
        gateway
            .create_entrypoint_service(&builder.version_service("p1", "v1").unwrap())
            .await
            .unwrap();

        TrafficSwitch::new(&gateway, &builder)
            .publish("p1", "v1")
            .await
            .unwrap();

        assert_eq!(
            cluster.object_names("Service", NS),
            vec!["p1-active-entrypoint"]
        );
        assert_eq!(
            cluster.object_names("Ingress", NS),
            vec!["p1-entrypoint-ingress"]
        );
    }

    #[tokio::test]
    async fn test_publish_twice_is_idempotent() {
        let (cluster, gateway, builder) = setup();
        let switch = TrafficSwitch::new(&gateway, &builder);
        switch.publish("p1", "v1").await.unwrap();
        switch.publish("p1", "v1").await.unwrap();

        assert_eq!(
            cluster.object_names("Service", NS),
            vec!["p1-active-entrypoint"]
        );
    }

    #[tokio::test]
    async fn test_unpublish_restores_version_service() {
        let (cluster, gateway, builder) = setup();
        let switch = TrafficSwitch::new(&gateway, &builder);
        switch.publish("p1", "v1").await.unwrap();
        switch.unpublish("p1", "v1").await.unwrap();

        assert_eq!(cluster.object_names("Service", NS), vec!["p1-v1-entrypoint"]);
        assert!(cluster.object_names("Ingress", NS).is_empty());
    }

    #[tokio::test]
    async fn test_version_named_like_active_service_is_refused() {
        let (cluster, gateway, builder) = setup();
        let switch = TrafficSwitch::new(&gateway, &builder);
        switch.publish("p1", "v1").await.unwrap();

        for result in [
            switch.publish("p1", "active").await,
            switch.unpublish("p1", "Active").await,
        ] {
            assert!(matches!(result, Err(OrchestratorError::InvalidDescriptor(_))));
        }

        // The existing binding and ingress are untouched
        assert_eq!(bound_version_of(&gateway).await.as_deref(), Some("v1"));
        assert_eq!(
            cluster.object_names("Ingress", NS),
            vec!["p1-entrypoint-ingress"]
        );
    }

    async fn bound_version_of(gateway: &ResourceGateway<MemoryCluster>) -> Option<String> {
        let active = gateway.get_active_service("p1").await.unwrap()?;
        bound_version(&active).map(str::to_string)
    }

    #[tokio::test]
    async fn test_unpublish_of_inactive_version_still_clears_binding() {
        let (cluster, gateway, builder) = setup();
        let switch = TrafficSwitch::new(&gateway, &builder);
        switch.publish("p1", "v1").await.unwrap();
        switch.unpublish("p1", "v2").await.unwrap();

        assert_eq!(cluster.object_names("Service", NS), vec!["p1-v2-entrypoint"]);
    }
}
