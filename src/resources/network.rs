//! Services and ingress routing for entrypoints

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::{
    names, object_labels, stamp_spec_hash, ObjectType, ENTRYPOINT_PORT_NAME, LABEL_PRODUCT,
    LABEL_TYPE, LABEL_VERSION,
};
use crate::config::{IngressSettings, WorkloadSettings};
use crate::error::Result;

/// Pods a service routes to: the entrypoint of one version
fn entrypoint_selector(product_id: &str, version_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_PRODUCT.to_string(), product_id.to_string()),
        (LABEL_VERSION.to_string(), version_name.to_string()),
        (LABEL_TYPE.to_string(), ObjectType::Entrypoint.as_str().to_string()),
    ])
}

fn grpc_service(
    name: String,
    labels: BTreeMap<String, String>,
    product_id: &str,
    version_name: &str,
    workloads: &WorkloadSettings,
) -> Result<Service> {
    let mut service = Service {
        metadata: ObjectMeta {
            name: Some(name),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(entrypoint_selector(product_id, version_name)),
            ports: Some(vec![ServicePort {
                name: Some(ENTRYPOINT_PORT_NAME.to_string()),
                port: i32::from(workloads.entrypoint_port),
                target_port: Some(IntOrString::String(ENTRYPOINT_PORT_NAME.to_string())),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };
    stamp_spec_hash(&mut service)?;
    Ok(service)
}

/// Private service addressing one version's entrypoint
pub fn version_service(
    product_id: &str,
    version_name: &str,
    workloads: &WorkloadSettings,
) -> Result<Service> {
    grpc_service(
        names::version_service(product_id, version_name),
        object_labels(product_id, Some(version_name), ObjectType::EntrypointService),
        product_id,
        version_name,
        workloads,
    )
}

/// Product-scoped service bound to `version_name`. Its `version-name` label
/// records which version is active.
pub fn active_service(
    product_id: &str,
    version_name: &str,
    workloads: &WorkloadSettings,
) -> Result<Service> {
    grpc_service(
        names::active_service(product_id),
        object_labels(product_id, Some(version_name), ObjectType::ActiveEntrypoint),
        product_id,
        version_name,
        workloads,
    )
}

/// Routes `<product>.<base_domain>` to the product's active service
pub fn ingress(
    product_id: &str,
    workloads: &WorkloadSettings,
    settings: &IngressSettings,
) -> Result<Ingress> {
    let host = format!("{}.{}", names::sanitize(product_id), settings.base_domain);
    let backend = IngressBackend {
        service: Some(IngressServiceBackend {
            name: names::active_service(product_id),
            port: Some(ServiceBackendPort {
                number: Some(i32::from(workloads.entrypoint_port)),
                ..Default::default()
            }),
        }),
        ..Default::default()
    };

    let tls = settings.tls_secret.as_ref().map(|secret| {
        vec![IngressTLS {
            hosts: Some(vec![host.clone()]),
            secret_name: Some(secret.clone()),
        }]
    });
    let annotations = if settings.annotations.is_empty() {
        None
    } else {
        Some(settings.annotations.clone())
    };

    let mut ingress = Ingress {
        metadata: ObjectMeta {
            name: Some(names::ingress(product_id)),
            labels: Some(object_labels(product_id, None, ObjectType::Ingress)),
            annotations,
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: settings.class_name.clone(),
            tls,
            rules: Some(vec![IngressRule {
                host: Some(host),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend,
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };
    stamp_spec_hash(&mut ingress)?;
    Ok(ingress)
}

/// Version an active service currently routes to
pub fn bound_version(service: &Service) -> Option<&str> {
    service
        .metadata
        .labels
        .as_ref()?
        .get(LABEL_VERSION)
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::spec_hash;

    #[test]
    fn test_version_service_targets_entrypoint_pods() {
        let svc = version_service("p1", "v1", &WorkloadSettings::default()).unwrap();
        assert_eq!(svc.metadata.name.as_deref(), Some("p1-v1-entrypoint"));
        let spec = svc.spec.as_ref().unwrap();
        let selector = spec.selector.as_ref().unwrap();
        assert_eq!(selector.get("version-name").map(String::as_str), Some("v1"));
        assert_eq!(selector.get("type").map(String::as_str), Some("entrypoint"));
        assert_eq!(spec.ports.as_ref().unwrap()[0].port, 9000);
        assert!(spec_hash(&svc).is_some());
    }

    #[test]
    fn test_active_service_records_bound_version() {
        let svc = active_service("p1", "v2", &WorkloadSettings::default()).unwrap();
        assert_eq!(svc.metadata.name.as_deref(), Some("p1-active-entrypoint"));
        assert_eq!(bound_version(&svc), Some("v2"));
        let labels = svc.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get("type").map(String::as_str), Some("active-entrypoint"));
    }

    #[test]
    fn test_ingress_routes_host_to_active_service() {
        let settings = IngressSettings {
            base_domain: "example.com".to_string(),
            class_name: Some("nginx".to_string()),
            tls_secret: Some("wildcard".to_string()),
            ..Default::default()
        };
        let ing = ingress("P1", &WorkloadSettings::default(), &settings).unwrap();
        assert_eq!(ing.metadata.name.as_deref(), Some("p1-entrypoint-ingress"));

        let spec = ing.spec.as_ref().unwrap();
        assert_eq!(spec.ingress_class_name.as_deref(), Some("nginx"));
        let rule = &spec.rules.as_ref().unwrap()[0];
        assert_eq!(rule.host.as_deref(), Some("p1.example.com"));
        let path = &rule.http.as_ref().unwrap().paths[0];
        let backend = path.backend.service.as_ref().unwrap();
        assert_eq!(backend.name, "p1-active-entrypoint");
        assert_eq!(spec.tls.as_ref().unwrap()[0].secret_name.as_deref(), Some("wildcard"));
    }

    #[test]
    fn test_same_inputs_same_hash() {
        let a = ingress("p1", &WorkloadSettings::default(), &IngressSettings::default()).unwrap();
        let b = ingress("p1", &WorkloadSettings::default(), &IngressSettings::default()).unwrap();
        assert_eq!(spec_hash(&a), spec_hash(&b));
    }
}
