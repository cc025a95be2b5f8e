//! Waiting for the pods of a version to become ready
//!
//! A [`StatusResolver`] tracks one ready flag per expected logical node. It
//! is owned by a single task that drains the pod watch into it, so no lock
//! guards the readiness map. When every flag is set the resolver fires a
//! one-shot signal, which [`ReadinessTracker::wait`] races against the
//! caller's cancellation token and the readiness timeout.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterApi, ClusterError, PodEvent, PodEventStream, PodObservation};
use crate::descriptor::NodeKey;
use crate::error::{OrchestratorError, Result};
use crate::resources::{workload_selector, LABEL_NODE, LABEL_WORKFLOW};

/// How a successful wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitOutcome {
    /// Every expected node has a ready pod
    Satisfied,
    /// The caller gave up; not an error
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverState {
    Watching,
    Satisfied,
    Canceled,
    TimedOut,
}

/// Per-wait readiness bookkeeping
pub struct StatusResolver {
    ready: BTreeMap<NodeKey, bool>,
    state: ResolverState,
    signal: Option<oneshot::Sender<()>>,
}

impl StatusResolver {
    pub fn new(expected: impl IntoIterator<Item = NodeKey>, signal: oneshot::Sender<()>) -> Self {
        let mut resolver = Self {
            ready: expected.into_iter().map(|key| (key, false)).collect(),
            state: ResolverState::Watching,
            signal: Some(signal),
        };
        resolver.check_satisfied();
        resolver
    }

    pub fn state(&self) -> ResolverState {
        self.state
    }

    /// Expected workloads without a ready pod
    pub fn pending(&self) -> Vec<String> {
        self.ready
            .iter()
            .filter(|(_, ready)| !**ready)
            .map(|(key, _)| key.to_string())
            .collect()
    }

    /// Apply one pod event. Only a delete clears a flag; a not-ready update
    /// of a pod already seen ready leaves it set.
    pub fn observe(&mut self, event: &PodEvent) {
        if self.state != ResolverState::Watching {
            return;
        }
        let pod = event.pod();
        let Some(key) = node_key(pod) else {
            return;
        };
        let Some(flag) = self.ready.get_mut(&key) else {
            debug!("Ignoring pod {} of unexpected node {}", pod.name, key);
            return;
        };

        match event {
            PodEvent::Applied(pod) if pod.ready => {
                if !*flag {
                    debug!("Node {} ready (pod {})", key, pod.name);
                }
                *flag = true;
            }
            PodEvent::Applied(_) => {}
            PodEvent::Deleted(pod) => {
                debug!("Node {} lost pod {}", key, pod.name);
                *flag = false;
            }
        }

        self.check_satisfied();
    }

    /// Stop reacting to events
    pub fn terminate(&mut self, state: ResolverState) {
        if self.state == ResolverState::Watching {
            self.state = state;
        }
    }

    fn check_satisfied(&mut self) {
        if self.ready.values().all(|ready| *ready) {
            self.state = ResolverState::Satisfied;
            if let Some(signal) = self.signal.take() {
                let _ = signal.send(());
            }
        }
    }
}

/// Workload a pod belongs to; node pods carry their workflow label, the
/// entrypoint pod does not
fn node_key(pod: &PodObservation) -> Option<NodeKey> {
    let node = pod.label(LABEL_NODE)?;
    Some(NodeKey {
        workflow: pod.label(LABEL_WORKFLOW).map(str::to_string),
        node: node.to_string(),
    })
}

/// What the draining task saw before it stopped
#[derive(Debug, Clone, PartialEq, Eq)]
struct DrainReport {
    state: ResolverState,
    pending: Vec<String>,
}

/// Feed watch events into the resolver until satisfied, stopped or the
/// watch ends. The resolver, and with it the signal, is dropped on return.
async fn drain(
    mut events: PodEventStream,
    mut resolver: StatusResolver,
    mut stop: oneshot::Receiver<ResolverState>,
) -> DrainReport {
    loop {
        tokio::select! {
            reason = &mut stop => {
                resolver.terminate(reason.unwrap_or(ResolverState::Canceled));
                break;
            }
            event = events.next() => match event {
                Some(Ok(event)) => {
                    resolver.observe(&event);
                    if resolver.state() == ResolverState::Satisfied {
                        break;
                    }
                }
                Some(Err(e)) => warn!("Pod watch error: {}", e),
                None => {
                    debug!("Pod watch ended");
                    break;
                }
            }
        }
    }

    DrainReport {
        state: resolver.state(),
        pending: resolver.pending(),
    }
}

/// Aborts the task when dropped, so an abandoned wait tears down its watch
struct AbortOnDrop<T>(Option<JoinHandle<T>>);

impl<T> AbortOnDrop<T> {
    async fn join(mut self) -> Option<T> {
        let handle = self.0.take()?;
        handle.await.ok()
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

/// Waits for version pods on one cluster
pub struct ReadinessTracker<C: ClusterApi> {
    cluster: Arc<C>,
    timeout: Duration,
}

impl<C: ClusterApi> ReadinessTracker<C> {
    pub fn new(cluster: Arc<C>, timeout: Duration) -> Self {
        Self { cluster, timeout }
    }

    /// Block until every workload in `expected` has a ready pod of this version,
    /// the token is cancelled, or the timeout elapses
    pub async fn wait(
        &self,
        namespace: &str,
        product_id: &str,
        version_name: &str,
        expected: BTreeSet<NodeKey>,
        cancel: CancellationToken,
    ) -> Result<WaitOutcome> {
        let selector = workload_selector(product_id, version_name);
        info!(
            "Waiting for {} nodes of {}/{} (selector {})",
            expected.len(),
            product_id,
            version_name,
            selector
        );

        let events = self.cluster.watch_pods(namespace, &selector).await?;
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let resolver = StatusResolver::new(expected, ready_tx);
        let task = AbortOnDrop(Some(tokio::spawn(drain(events, resolver, stop_rx))));

        let outcome = tokio::select! {
            signal = ready_rx => match signal {
                Ok(()) => Ok(WaitOutcome::Satisfied),
                Err(_) => Err(OrchestratorError::from(ClusterError::WatchClosed)),
            },
            _ = cancel.cancelled() => Ok(WaitOutcome::Canceled),
            _ = tokio::time::sleep(self.timeout) => Err(OrchestratorError::ReadinessTimeout {
                product_id: product_id.to_string(),
                version_name: version_name.to_string(),
                waited: self.timeout,
            }),
        };

        match &outcome {
            Ok(WaitOutcome::Canceled) => {
                let _ = stop_tx.send(ResolverState::Canceled);
            }
            Err(OrchestratorError::ReadinessTimeout { .. }) => {
                let _ = stop_tx.send(ResolverState::TimedOut);
            }
            _ => {}
        }

        if let Some(report) = task.join().await {
            match report.state {
                ResolverState::Satisfied => {
                    info!("All pods of {}/{} are ready", product_id, version_name)
                }
                state => warn!(
                    "Stopped waiting for {}/{} ({:?}), pending: {:?}",
                    product_id, version_name, state, report.pending
                ),
            }
        }

        outcome
    }
}
