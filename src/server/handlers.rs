use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::cluster::ClusterApi;
use crate::descriptor::{ConfigEntry, VersionDescriptor, Workflow};
use crate::orchestrator::VersionStatus;
use crate::readiness::WaitOutcome;
use crate::server::error::ApiResult;
use crate::server::state::AppState;

/// Identifies one version
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionRequest {
    pub product_id: String,
    pub version_name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitRequest {
    pub product_id: String,
    pub version_name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub workflows: Vec<Workflow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateConfigRequest {
    pub product_id: String,
    pub version_name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub config: Vec<ConfigEntry>,
}

/// Acknowledgement of a lifecycle operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationStatus {
    /// Success or failure
    pub success: bool,

    /// Status message
    pub message: String,

    /// How a wait ended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<WaitOutcome>,
}

impl OperationStatus {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            outcome: None,
        }
    }

    pub fn with_outcome(mut self, outcome: WaitOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }
}

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

async fn start_version<C: ClusterApi>(
    State(state): State<AppState<C>>,
    Json(mut descriptor): Json<VersionDescriptor>,
) -> ApiResult<Json<OperationStatus>> {
    let namespace = state.namespace(&descriptor.namespace).to_string();
    descriptor.namespace = Some(namespace);
    state.orchestrator.start(&descriptor).await?;
    Ok(Json(OperationStatus::success(format!(
        "Version {}/{} started",
        descriptor.product_id, descriptor.version_name
    ))))
}

async fn wait_for_version_pods<C: ClusterApi>(
    State(state): State<AppState<C>>,
    Json(request): Json<WaitRequest>,
) -> ApiResult<Json<OperationStatus>> {
    let namespace = state.namespace(&request.namespace);
    let outcome = state
        .orchestrator
        .wait_for_version_pods(
            &request.product_id,
            &request.version_name,
            namespace,
            &request.workflows,
            state.shutdown.child_token(),
        )
        .await?;

    let message = match outcome {
        WaitOutcome::Satisfied => format!(
            "Pods of version {}/{} are ready",
            request.product_id, request.version_name
        ),
        WaitOutcome::Canceled => format!(
            "Wait for version {}/{} canceled",
            request.product_id, request.version_name
        ),
    };
    Ok(Json(OperationStatus::success(message).with_outcome(outcome)))
}

async fn stop_version<C: ClusterApi>(
    State(state): State<AppState<C>>,
    Json(request): Json<VersionRequest>,
) -> ApiResult<Json<OperationStatus>> {
    let namespace = state.namespace(&request.namespace);
    state
        .orchestrator
        .stop(&request.product_id, &request.version_name, namespace)
        .await?;
    Ok(Json(OperationStatus::success(format!(
        "Version {}/{} stopped",
        request.product_id, request.version_name
    ))))
}

async fn publish_version<C: ClusterApi>(
    State(state): State<AppState<C>>,
    Json(request): Json<VersionRequest>,
) -> ApiResult<Json<OperationStatus>> {
    let namespace = state.namespace(&request.namespace);
    state
        .orchestrator
        .publish(&request.product_id, &request.version_name, namespace)
        .await?;
    Ok(Json(OperationStatus::success(format!(
        "Version {}/{} published",
        request.product_id, request.version_name
    ))))
}

async fn unpublish_version<C: ClusterApi>(
    State(state): State<AppState<C>>,
    Json(request): Json<VersionRequest>,
) -> ApiResult<Json<OperationStatus>> {
    let namespace = state.namespace(&request.namespace);
    state
        .orchestrator
        .unpublish(&request.product_id, &request.version_name, namespace)
        .await?;
    Ok(Json(OperationStatus::success(format!(
        "Version {}/{} unpublished",
        request.product_id, request.version_name
    ))))
}

async fn update_config<C: ClusterApi>(
    State(state): State<AppState<C>>,
    Json(request): Json<UpdateConfigRequest>,
) -> ApiResult<Json<OperationStatus>> {
    let namespace = state.namespace(&request.namespace);
    state
        .orchestrator
        .update_config(
            &request.product_id,
            &request.version_name,
            namespace,
            &request.config,
        )
        .await?;
    Ok(Json(OperationStatus::success(format!(
        "Config of version {}/{} updated",
        request.product_id, request.version_name
    ))))
}

async fn version_status<C: ClusterApi>(
    State(state): State<AppState<C>>,
    Path((namespace, product, version)): Path<(String, String, String)>,
) -> ApiResult<Json<VersionStatus>> {
    let status = state
        .orchestrator
        .version_status(&product, &version, &namespace)
        .await?;
    Ok(Json(status))
}

/// Create the Axum router
pub fn create_router<C: ClusterApi>(state: AppState<C>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/versions/start", post(start_version::<C>))
        .route("/v1/versions/wait", post(wait_for_version_pods::<C>))
        .route("/v1/versions/stop", post(stop_version::<C>))
        .route("/v1/versions/publish", post(publish_version::<C>))
        .route("/v1/versions/unpublish", post(unpublish_version::<C>))
        .route("/v1/versions/update-config", post(update_config::<C>))
        .route(
            "/v1/namespaces/{namespace}/products/{product}/versions/{version}/status",
            get(version_status::<C>),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::Verb;
    use crate::cluster::{ClusterError, MemoryCluster};
    use crate::config::Settings;
    use crate::orchestrator::VersionOrchestrator;
    use crate::server::error::ErrorBody;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        response::Response,
    };
    use serde::de::DeserializeOwned;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn create_test_app(cluster: &MemoryCluster) -> Router {
        let orchestrator =
            VersionOrchestrator::new(Arc::new(cluster.clone()), &Settings::default());
        create_router(AppState::new(orchestrator))
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap()
    }

    async fn read_json<T: DeserializeOwned>(response: Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn start_body() -> serde_json::Value {
        serde_json::json!({
            "productId": "p1",
            "versionName": "v1",
            "config": [{"key": "K", "value": "1"}],
            "entrypoint": {"image": "entrypoint:1", "protoFile": "public_input.proto"},
            "workflows": [{
                "name": "w1",
                "nodes": [{"name": "n1", "image": "node:1"}],
                "edges": []
            }]
        })
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = create_test_app(&MemoryCluster::new());

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_start_endpoint() {
        let cluster = MemoryCluster::new();
        let app = create_test_app(&cluster);

        let response = app
            .oneshot(post_json("/v1/versions/start", start_body()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let ack: OperationStatus = read_json(response).await;
        assert!(ack.success);
        assert_eq!(
            cluster.object_names("Deployment", "default"),
            vec!["p1-v1-entrypoint", "p1-v1-w1-n1"]
        );
    }

    #[tokio::test]
    async fn test_invalid_descriptor_is_bad_request() {
        let app = create_test_app(&MemoryCluster::new());
        let mut body = start_body();
        body["entrypoint"]["image"] = serde_json::json!("");

        let response = app
            .oneshot(post_json("/v1/versions/start", body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error: ErrorBody = read_json(response).await;
        assert!(!error.success);
        assert_eq!(error.code, "INVALID_DESCRIPTOR");
    }

    #[tokio::test]
    async fn test_cluster_failure_is_bad_gateway() {
        let cluster = MemoryCluster::new();
        cluster.inject_fault(
            Verb::Delete,
            "Ingress",
            ClusterError::Api {
                code: 403,
                reason: "Forbidden".into(),
                message: "ingresses is forbidden".into(),
            },
            1,
        );
        let app = create_test_app(&cluster);

        let response = app
            .oneshot(post_json(
                "/v1/versions/unpublish",
                serde_json::json!({"productId": "p1", "versionName": "v1"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let error: ErrorBody = read_json(response).await;
        assert_eq!(error.code, "CLUSTER_ERROR");
        assert!(error.message.contains("ingresses is forbidden"));
    }

    #[tokio::test]
    async fn test_wait_endpoint_reports_outcome() {
        let cluster = MemoryCluster::with_auto_ready();
        let app = create_test_app(&cluster);

        let response = app
            .clone()
            .oneshot(post_json("/v1/versions/start", start_body()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let wait = serde_json::json!({
            "productId": "p1",
            "versionName": "v1",
            "workflows": start_body()["workflows"].clone()
        });
        let response = app
            .oneshot(post_json("/v1/versions/wait", wait))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let ack: OperationStatus = read_json(response).await;
        assert_eq!(ack.outcome, Some(WaitOutcome::Satisfied));
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let cluster = MemoryCluster::with_auto_ready();
        let app = create_test_app(&cluster);

        app.clone()
            .oneshot(post_json("/v1/versions/start", start_body()))
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/namespaces/default/products/p1/versions/v1/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let status: VersionStatus = read_json(response).await;
        assert_eq!(status.phase, crate::orchestrator::VersionPhase::Started);
        assert_eq!(status.total_pods, 2);
    }
}
