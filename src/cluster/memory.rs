//! In-process cluster
//!
//! Stores objects as JSON keyed by kind, namespace and name, and simulates
//! the part of the control plane the orchestrator depends on: every
//! Deployment owns pods built from its template, pods are rolled when the
//! template changes and removed when the Deployment is deleted. Pod changes
//! are broadcast to watchers.
//!
//! Tests drive the simulation through the helpers on [`MemoryCluster`]:
//! flip pod readiness, crash pods, inject faults, or close every watch.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    kind_of, ClusterApi, ClusterError, KubeObject, LabelSelector, PodEvent, PodEventStream,
    PodObservation,
};

const POD_KIND: &str = "Pod";
const DEPLOYMENT_KIND: &str = "Deployment";
const EVENT_BUFFER: usize = 1024;

/// Cluster call kinds, used to target injected faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    List,
    Create,
    Apply,
    Patch,
    Delete,
    Watch,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ObjectKey {
    kind: String,
    namespace: String,
    name: String,
}

impl ObjectKey {
    fn new(kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct PodNotice {
    namespace: String,
    event: PodEvent,
}

struct Inner {
    objects: DashMap<ObjectKey, Value>,
    faults: DashMap<(Verb, String), VecDeque<ClusterError>>,
    pod_events: broadcast::Sender<PodNotice>,
    watches_closed: Mutex<CancellationToken>,
    auto_ready: AtomicBool,
    pods_linger: AtomicBool,
}

/// Simulated cluster shared by clones
#[derive(Clone)]
pub struct MemoryCluster {
    inner: Arc<Inner>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    /// Empty cluster; new pods start not ready
    pub fn new() -> Self {
        let (pod_events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                objects: DashMap::new(),
                faults: DashMap::new(),
                pod_events,
                watches_closed: Mutex::new(CancellationToken::new()),
                auto_ready: AtomicBool::new(false),
                pods_linger: AtomicBool::new(false),
            }),
        }
    }

    /// Empty cluster whose pods become ready as soon as they are scheduled
    pub fn with_auto_ready() -> Self {
        let cluster = Self::new();
        cluster.set_auto_ready(true);
        cluster
    }

    pub fn set_auto_ready(&self, enabled: bool) {
        self.inner.auto_ready.store(enabled, Ordering::SeqCst);
    }

    /// When set, deleting a Deployment leaves its pods behind
    pub fn set_pod_deletion_stuck(&self, stuck: bool) {
        self.inner.pods_linger.store(stuck, Ordering::SeqCst);
    }

    /// Fail the next `times` calls of `verb` on `kind` with `error`
    pub fn inject_fault(&self, verb: Verb, kind: &str, error: ClusterError, times: usize) {
        let mut queue = self
            .inner
            .faults
            .entry((verb, kind.to_string()))
            .or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// Mark matching pods ready or not ready; returns how many changed
    pub fn set_pods_ready(&self, namespace: &str, selector: &LabelSelector, ready: bool) -> usize {
        let mut changed = 0;
        for mut pod in self.pods_in(namespace, selector) {
            if PodObservation::from_pod(&pod).ready == ready {
                continue;
            }
            pod.status = Some(pod_status(ready));
            self.store_pod(namespace, &pod);
            self.notify(namespace, PodEvent::Applied(PodObservation::from_pod(&pod)));
            changed += 1;
        }
        changed
    }

    /// Kill matching pods. Pods owned by a Deployment are replaced by a
    /// fresh, not-ready pod, as a ReplicaSet would.
    pub fn delete_pods(&self, namespace: &str, selector: &LabelSelector) -> usize {
        let victims = self.pods_in(namespace, selector);
        for pod in &victims {
            self.remove_pod(namespace, pod);
            let owner = owner_name(pod);
            if let Some(deployment) = owner.and_then(|name| self.deployment(namespace, &name)) {
                self.spawn_pod(namespace, &deployment, false);
            }
        }
        victims.len()
    }

    /// End every open pod watch
    pub fn close_watches(&self) {
        let mut token = self
            .inner
            .watches_closed
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Number of live pod watch subscriptions
    pub fn pod_watch_count(&self) -> usize {
        self.inner.pod_events.receiver_count()
    }

    /// Sorted names of stored objects of one kind
    pub fn object_names(&self, kind: &str, namespace: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .objects
            .iter()
            .filter(|entry| entry.key().kind == kind && entry.key().namespace == namespace)
            .map(|entry| entry.key().name.clone())
            .collect();
        names.sort();
        names
    }

    fn take_fault(&self, verb: Verb, kind: &str) -> Result<(), ClusterError> {
        let key = (verb, kind.to_string());
        if let Some(mut queue) = self.inner.faults.get_mut(&key) {
            if let Some(error) = queue.pop_front() {
                debug!("Injected fault on {:?} {}: {}", verb, kind, error);
                return Err(error);
            }
        }
        Ok(())
    }

    fn notify(&self, namespace: &str, event: PodEvent) {
        // No receivers is fine
        let _ = self.inner.pod_events.send(PodNotice {
            namespace: namespace.to_string(),
            event,
        });
    }

    fn pods_in(&self, namespace: &str, selector: &LabelSelector) -> Vec<Pod> {
        self.inner
            .objects
            .iter()
            .filter(|entry| entry.key().kind == POD_KIND && entry.key().namespace == namespace)
            .filter_map(|entry| serde_json::from_value::<Pod>(entry.value().clone()).ok())
            .filter(|pod| {
                let labels = pod.metadata.labels.clone().unwrap_or_default();
                selector.matches(&labels)
            })
            .collect()
    }

    fn pods_owned_by(&self, namespace: &str, deployment: &str) -> Vec<Pod> {
        self.pods_in(namespace, &LabelSelector::new())
            .into_iter()
            .filter(|pod| owner_name(pod).as_deref() == Some(deployment))
            .collect()
    }

    fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        let key = ObjectKey::new(DEPLOYMENT_KIND, namespace, name);
        let value = self.inner.objects.get(&key)?.value().clone();
        serde_json::from_value(value).ok()
    }

    fn store_pod(&self, namespace: &str, pod: &Pod) {
        let name = pod.metadata.name.clone().unwrap_or_default();
        if let Ok(value) = serde_json::to_value(pod) {
            self.inner
                .objects
                .insert(ObjectKey::new(POD_KIND, namespace, &name), value);
        }
    }

    fn remove_pod(&self, namespace: &str, pod: &Pod) {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let key = ObjectKey::new(POD_KIND, namespace, &name);
        if self.inner.objects.remove(&key).is_some() {
            self.notify(namespace, PodEvent::Deleted(PodObservation::from_pod(pod)));
        }
    }

    fn spawn_pod(&self, namespace: &str, deployment: &Deployment, ready: bool) {
        let deployment_name = deployment.metadata.name.clone().unwrap_or_default();
        let template = deployment
            .spec
            .as_ref()
            .map(|spec| spec.template.clone())
            .unwrap_or_default();
        let template_meta = template.metadata.unwrap_or_default();
        let uid = Uuid::new_v4().to_string();

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(format!("{}-{}", deployment_name, &uid[..8])),
                namespace: Some(namespace.to_string()),
                uid: Some(uid.clone()),
                labels: template_meta.labels,
                annotations: template_meta.annotations,
                owner_references: Some(vec![OwnerReference {
                    api_version: "apps/v1".to_string(),
                    kind: DEPLOYMENT_KIND.to_string(),
                    name: deployment_name.clone(),
                    uid: deployment.metadata.uid.clone().unwrap_or_default(),
                    controller: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            spec: template.spec,
            status: Some(pod_status(ready)),
        };

        debug!("Scheduled pod {:?} for {}", pod.metadata.name, deployment_name);
        self.store_pod(namespace, &pod);
        self.notify(namespace, PodEvent::Applied(PodObservation::from_pod(&pod)));
    }

    fn schedule(&self, namespace: &str, deployment: &Deployment) {
        let replicas = deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.replicas)
            .unwrap_or(1)
            .max(0);
        let ready = self.inner.auto_ready.load(Ordering::SeqCst);
        for _ in 0..replicas {
            self.spawn_pod(namespace, deployment, ready);
        }
    }

    fn evict(&self, namespace: &str, deployment: &str) {
        if self.inner.pods_linger.load(Ordering::SeqCst) {
            debug!("Leaving pods of {} behind", deployment);
            return;
        }
        for pod in self.pods_owned_by(namespace, deployment) {
            self.remove_pod(namespace, &pod);
        }
    }

    /// Re-run scheduling for a Deployment whose pod template changed
    fn roll(&self, namespace: &str, name: &str, before: &Value, after: &Value) {
        if before.pointer("/spec/template") == after.pointer("/spec/template") {
            return;
        }
        for pod in self.pods_owned_by(namespace, name) {
            self.remove_pod(namespace, &pod);
        }
        if let Some(deployment) = self.deployment(namespace, name) {
            self.schedule(namespace, &deployment);
        }
    }

    fn after_write<K: KubeObject>(&self, namespace: &str, name: &str, previous: Option<&Value>) {
        if kind_of::<K>() != DEPLOYMENT_KIND {
            return;
        }
        match previous {
            None => {
                if let Some(deployment) = self.deployment(namespace, name) {
                    self.schedule(namespace, &deployment);
                }
            }
            Some(before) => {
                let key = ObjectKey::new(DEPLOYMENT_KIND, namespace, name);
                let after = self.inner.objects.get(&key).map(|v| v.value().clone());
                if let Some(after) = after {
                    self.roll(namespace, name, before, &after);
                }
            }
        }
    }
}

fn owner_name(pod: &Pod) -> Option<String> {
    pod.metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|owner| owner.kind == DEPLOYMENT_KIND)
        .map(|owner| owner.name.clone())
}

fn pod_status(ready: bool) -> PodStatus {
    let (phase, condition) = if ready {
        ("Running", "True")
    } else {
        ("Pending", "False")
    };
    PodStatus {
        phase: Some(phase.to_string()),
        conditions: Some(vec![PodCondition {
            type_: "Ready".to_string(),
            status: condition.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn labels_of(value: &Value) -> BTreeMap<String, String> {
    value
        .pointer("/metadata/labels")
        .and_then(|labels| serde_json::from_value(labels.clone()).ok())
        .unwrap_or_default()
}

/// RFC 7386 JSON merge patch
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_fields) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(target_fields) = target {
        for (key, value) in patch_fields {
            if value.is_null() {
                target_fields.remove(key);
            } else {
                merge_patch(target_fields.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

fn to_value<K: KubeObject>(object: &K) -> Result<Value, ClusterError> {
    serde_json::to_value(object).map_err(|e| ClusterError::Serialization(e.to_string()))
}

fn from_value<K: KubeObject>(value: Value) -> Result<K, ClusterError> {
    serde_json::from_value(value).map_err(|e| ClusterError::Serialization(e.to_string()))
}

fn required_name<K: KubeObject>(object: &K) -> Result<String, ClusterError> {
    object.meta().name.clone().ok_or_else(|| {
        ClusterError::Serialization(format!("{} without metadata.name", kind_of::<K>()))
    })
}

fn stamp_identity(value: &mut Value, namespace: &str, uid: Option<Value>) {
    if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.insert("namespace".to_string(), Value::String(namespace.to_string()));
        let uid = uid.unwrap_or_else(|| Value::String(Uuid::new_v4().to_string()));
        metadata.insert("uid".to_string(), uid);
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn get<K: KubeObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, ClusterError> {
        let kind = kind_of::<K>();
        self.take_fault(Verb::Get, &kind)?;
        let key = ObjectKey::new(&kind, namespace, name);
        let value = self.inner.objects.get(&key).map(|v| v.value().clone());
        value.map(from_value::<K>).transpose()
    }

    async fn list<K: KubeObject>(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<K>, ClusterError> {
        let kind = kind_of::<K>();
        self.take_fault(Verb::List, &kind)?;
        let values: Vec<Value> = self
            .inner
            .objects
            .iter()
            .filter(|entry| entry.key().kind == kind && entry.key().namespace == namespace)
            .filter(|entry| selector.matches(&labels_of(entry.value())))
            .map(|entry| entry.value().clone())
            .collect();
        values.into_iter().map(from_value::<K>).collect()
    }

    async fn create<K: KubeObject>(&self, namespace: &str, object: &K) -> Result<K, ClusterError> {
        let kind = kind_of::<K>();
        self.take_fault(Verb::Create, &kind)?;
        let name = required_name(object)?;
        let key = ObjectKey::new(&kind, namespace, &name);

        let mut value = to_value(object)?;
        stamp_identity(&mut value, namespace, None);
        match self.inner.objects.entry(key) {
            Entry::Occupied(_) => return Err(ClusterError::AlreadyExists { kind, name }),
            Entry::Vacant(slot) => {
                slot.insert(value.clone());
            }
        }

        debug!("Created {} {}/{}", kind, namespace, name);
        self.after_write::<K>(namespace, &name, None);
        from_value(value)
    }

    async fn apply<K: KubeObject>(&self, namespace: &str, object: &K) -> Result<K, ClusterError> {
        let kind = kind_of::<K>();
        self.take_fault(Verb::Apply, &kind)?;
        let name = required_name(object)?;
        let key = ObjectKey::new(&kind, namespace, &name);

        let previous = self.inner.objects.get(&key).map(|v| v.value().clone());
        let uid = previous
            .as_ref()
            .and_then(|v| v.pointer("/metadata/uid"))
            .cloned();
        let mut value = to_value(object)?;
        stamp_identity(&mut value, namespace, uid);
        self.inner.objects.insert(key, value.clone());

        debug!("Applied {} {}/{}", kind, namespace, name);
        self.after_write::<K>(namespace, &name, previous.as_ref());
        from_value(value)
    }

    async fn patch_merge<K: KubeObject>(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<K, ClusterError> {
        let kind = kind_of::<K>();
        self.take_fault(Verb::Patch, &kind)?;
        let key = ObjectKey::new(&kind, namespace, name);

        let (before, after) = {
            let mut entry = self
                .inner
                .objects
                .get_mut(&key)
                .ok_or_else(|| ClusterError::NotFound {
                    kind: kind.clone(),
                    name: name.to_string(),
                })?;
            let before = entry.value().clone();
            merge_patch(entry.value_mut(), patch);
            (before, entry.value().clone())
        };

        debug!("Patched {} {}/{}", kind, namespace, name);
        self.after_write::<K>(namespace, name, Some(&before));
        from_value(after)
    }

    async fn delete<K: KubeObject>(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let kind = kind_of::<K>();
        self.take_fault(Verb::Delete, &kind)?;
        let key = ObjectKey::new(&kind, namespace, name);

        let (_, removed) = self
            .inner
            .objects
            .remove(&key)
            .ok_or_else(|| ClusterError::NotFound {
                kind: kind.clone(),
                name: name.to_string(),
            })?;

        debug!("Deleted {} {}/{}", kind, namespace, name);
        if kind == DEPLOYMENT_KIND {
            self.evict(namespace, name);
        } else if kind == POD_KIND {
            if let Ok(pod) = serde_json::from_value::<Pod>(removed) {
                self.notify(namespace, PodEvent::Deleted(PodObservation::from_pod(&pod)));
            }
        }
        Ok(())
    }

    async fn watch_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<PodEventStream, ClusterError> {
        self.take_fault(Verb::Watch, POD_KIND)?;

        // Subscribe before the snapshot so nothing falls between the two
        let rx = self.inner.pod_events.subscribe();
        let closed = self
            .inner
            .watches_closed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let snapshot: Vec<Result<PodEvent, ClusterError>> = self
            .pods_in(namespace, selector)
            .iter()
            .map(|pod| Ok(PodEvent::Applied(PodObservation::from_pod(pod))))
            .collect();

        let namespace = namespace.to_string();
        let selector = selector.clone();
        let live = stream::unfold(rx, move |mut rx| {
            let namespace = namespace.clone();
            let selector = selector.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(notice)
                            if notice.namespace == namespace
                                && selector.matches(&notice.event.pod().labels) =>
                        {
                            return Some((Ok(notice.event), rx));
                        }
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Pod watch lagged, skipped {} events", skipped);
                            continue;
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream::iter(snapshot)
            .chain(live)
            .take_until(closed.cancelled_owned())
            .boxed())
    }
}
