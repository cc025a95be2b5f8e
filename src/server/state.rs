use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cluster::ClusterApi;
use crate::orchestrator::VersionOrchestrator;

/// Shared application state
pub struct AppState<C: ClusterApi> {
    pub orchestrator: Arc<VersionOrchestrator<C>>,
    /// Cancelled on shutdown; every wait observes a child of it
    pub shutdown: CancellationToken,
}

impl<C: ClusterApi> Clone for AppState<C> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: self.orchestrator.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<C: ClusterApi> AppState<C> {
    pub fn new(orchestrator: VersionOrchestrator<C>) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Requested namespace, or the configured default
    pub fn namespace<'a>(&'a self, requested: &'a Option<String>) -> &'a str {
        requested
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| self.orchestrator.default_namespace())
    }
}
