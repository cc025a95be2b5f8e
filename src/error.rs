//! Error taxonomy of the lifecycle operations

use std::time::Duration;

use thiserror::Error;

use crate::cluster::ClusterError;

/// Errors surfaced by the orchestrator to its callers
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    #[error("Invalid version descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("{kind} '{name}' exists with a different specification")]
    ResourceConflict { kind: String, name: String },

    #[error("Timed out after {waited:?} waiting for {operation}")]
    ResourceSyncTimeout { operation: String, waited: Duration },

    #[error("Pods of version '{version_name}' of product '{product_id}' not ready after {waited:?}")]
    ReadinessTimeout {
        product_id: String,
        version_name: String,
        waited: Duration,
    },

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl OrchestratorError {
    pub fn invalid(message: impl Into<String>) -> Self {
        OrchestratorError::InvalidDescriptor(message.into())
    }

    /// Stable machine-readable code for RPC responses
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::InvalidDescriptor(_) => "INVALID_DESCRIPTOR",
            OrchestratorError::ResourceConflict { .. } => "RESOURCE_CONFLICT",
            OrchestratorError::ResourceSyncTimeout { .. } => "RESOURCE_SYNC_TIMEOUT",
            OrchestratorError::ReadinessTimeout { .. } => "READINESS_TIMEOUT",
            OrchestratorError::Cluster(ClusterError::NotFound { .. }) => "NOT_FOUND",
            OrchestratorError::Cluster(_) => "CLUSTER_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
