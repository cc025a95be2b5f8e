//! verso: lifecycle orchestration of versioned data pipelines on Kubernetes
//!
//! A version is a set of cluster objects (config maps, one Deployment per
//! workflow node, an entrypoint Deployment and its Service) derived from a
//! [`descriptor::VersionDescriptor`]. The [`orchestrator::VersionOrchestrator`]
//! starts, waits for, stops, publishes, unpublishes and reconfigures versions;
//! [`server`] exposes those operations over HTTP.

pub mod cli;
pub mod cluster;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod gateway;
pub mod orchestrator;
pub mod readiness;
pub mod resources;
pub mod server;
pub mod traffic;

pub use error::{OrchestratorError, Result};
