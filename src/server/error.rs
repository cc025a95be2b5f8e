//! Mapping of orchestrator errors to HTTP responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

/// Body of every failed request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub success: bool,
    pub code: String,
    pub message: String,
}

/// API error type
#[derive(Debug)]
pub struct ApiError(pub OrchestratorError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            OrchestratorError::InvalidDescriptor(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::ResourceConflict { .. } => StatusCode::CONFLICT,
            OrchestratorError::ResourceSyncTimeout { .. }
            | OrchestratorError::ReadinessTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            OrchestratorError::Cluster(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            OrchestratorError::Cluster(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        } else {
            tracing::warn!("Request rejected: {}", self.0);
        }

        let body = ErrorBody {
            success: false,
            code: self.0.code().to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        ApiError(err)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
