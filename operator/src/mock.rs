//! In-memory fakes of the store seams, for tests only
use crate::{
    events::EventPublisher,
    heartbeat::LeaseStore,
    store::{object_key, ExtensionStore},
    Actuator, Error, Result,
};
use async_trait::async_trait;
use common::{
    cluster::ClusterSpec, Cluster, ClusterContext, Extension, ExtensionSpec, ExtensionStatus,
    OPERATION_ANNOTATION,
};
use k8s_openapi::api::{coordination::v1::Lease, core::v1::ObjectReference};
use kube::{runtime::events::Event, ResourceExt};
use serde_json::json;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

pub fn extension(name: &str, namespace: &str) -> Extension {
    let mut ext = Extension::new(name, ExtensionSpec {
        extension_type: "example".into(),
        class: None,
        provider_config: Some(json!({"foo": "bar"})),
        disabled: None,
    });
    ext.metadata.namespace = Some(namespace.into());
    ext.metadata.generation = Some(1);
    ext
}

pub fn with_operation(mut ext: Extension, op: &str) -> Extension {
    ext.annotations_mut()
        .insert(OPERATION_ANNOTATION.to_string(), op.to_string());
    ext
}

pub fn cluster(name: &str) -> Cluster {
    Cluster::new(name, ClusterSpec {
        cloud_profile: json!({"metadata": {"name": "local"}}),
        seed: json!({"metadata": {"name": "local"}}),
        shoot: json!({
            "apiVersion": "core.gardener.cloud/v1beta1",
            "kind": "Shoot",
            "metadata": {"name": "local", "namespace": "garden-local"},
            "spec": {"extensions": [{"type": "example", "providerConfig": {"foo": "bar"}}]},
        }),
    })
}

pub fn cluster_context(name: &str) -> ClusterContext {
    ClusterContext::try_from(&cluster(name)).unwrap_or_else(|e| panic!("test cluster: {e}"))
}

#[derive(Default)]
struct StoreState {
    extensions: HashMap<(String, String), Extension>,
    clusters: HashMap<String, Cluster>,
    version: u64,
    conflicts: usize,
    status_writes: usize,
    finalizer_writes: usize,
    annotation_clears: usize,
}

impl StoreState {
    fn bump(&mut self, ext: &mut Extension) {
        self.version += 1;
        ext.metadata.resource_version = Some(self.version.to_string());
    }

    /// Version guarded access to a stored object
    fn current(&mut self, ext: &Extension) -> Result<&mut Extension> {
        if self.conflicts > 0 {
            self.conflicts -= 1;
            return Err(Error::Conflict(object_key(ext)));
        }
        let key = (ext.namespace().unwrap_or_default(), ext.name_any());
        let stored = self
            .extensions
            .get_mut(&key)
            .ok_or_else(|| Error::NotFound(object_key(ext)))?;
        if stored.metadata.resource_version != ext.metadata.resource_version {
            return Err(Error::Conflict(object_key(ext)));
        }
        Ok(stored)
    }
}

/// Extension store keeping objects in memory with resourceVersion checks
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    fn state(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn insert(&self, mut ext: Extension) -> Extension {
        let mut state = self.state();
        state.bump(&mut ext);
        let key = (ext.namespace().unwrap_or_default(), ext.name_any());
        state.extensions.insert(key, ext.clone());
        ext
    }

    pub fn insert_cluster(&self, cluster: Cluster) {
        self.state().clusters.insert(cluster.name_any(), cluster);
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Extension> {
        self.state()
            .extensions
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        self.state()
            .extensions
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Make the next `n` guarded writes fail with a conflict
    pub fn conflicts(&self, n: usize) {
        self.state().conflicts = n;
    }

    pub fn status_writes(&self) -> usize {
        self.state().status_writes
    }

    pub fn finalizer_writes(&self) -> usize {
        self.state().finalizer_writes
    }

    pub fn annotation_clears(&self) -> usize {
        self.state().annotation_clears
    }

    pub fn writes(&self) -> usize {
        let state = self.state();
        state.status_writes + state.finalizer_writes + state.annotation_clears
    }
}

#[async_trait]
impl ExtensionStore for MemoryStore {
    async fn get_extension(&self, namespace: &str, name: &str) -> Result<Option<Extension>> {
        Ok(self.get(namespace, name))
    }

    async fn update_status(&self, ext: &Extension, status: &ExtensionStatus) -> Result<Extension> {
        let mut state = self.state();
        let mut updated = state.current(ext)?.clone();
        updated.status = Some(status.clone());
        state.bump(&mut updated);
        state.status_writes += 1;
        let key = (updated.namespace().unwrap_or_default(), updated.name_any());
        state.extensions.insert(key, updated.clone());
        Ok(updated)
    }

    async fn update_finalizers(&self, ext: &Extension, finalizers: Vec<String>) -> Result<Extension> {
        let mut state = self.state();
        let mut updated = state.current(ext)?.clone();
        let key = (updated.namespace().unwrap_or_default(), updated.name_any());
        state.finalizer_writes += 1;
        if finalizers.is_empty() && updated.metadata.deletion_timestamp.is_some() {
            state.extensions.remove(&key);
            return Ok(updated);
        }
        updated.metadata.finalizers = Some(finalizers);
        state.bump(&mut updated);
        state.extensions.insert(key, updated.clone());
        Ok(updated)
    }

    async fn clear_operation(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        let key = (namespace.to_string(), name.to_string());
        let Some(mut updated) = state.extensions.get(&key).cloned() else {
            return Err(Error::NotFound(format!("{namespace}/{name}")));
        };
        updated.annotations_mut().remove(OPERATION_ANNOTATION);
        state.bump(&mut updated);
        state.annotation_clears += 1;
        state.extensions.insert(key, updated);
        Ok(())
    }

    async fn get_cluster(&self, name: &str) -> Result<Option<Cluster>> {
        Ok(self.state().clusters.get(name).cloned())
    }
}

/// Actuator recording every call, optionally failing them
#[derive(Default)]
pub struct RecordingActuator {
    calls: Mutex<Vec<String>>,
    failures: AtomicUsize,
}

impl RecordingActuator {
    /// Make the next `n` calls fail
    pub fn fail(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn record(&self, operation: &str, ext: &Extension) -> Result<()> {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(operation.to_string());
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::ActuatorError {
                operation: operation.to_string(),
                reason: format!("injected failure for {}", ext.name_any()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Actuator for RecordingActuator {
    async fn reconcile(&self, ext: &Extension, _: &ClusterContext) -> Result<()> {
        self.record("reconcile", ext)
    }

    async fn delete(&self, ext: &Extension, _: Option<&ClusterContext>) -> Result<()> {
        self.record("delete", ext)
    }

    async fn force_delete(&self, ext: &Extension, _: Option<&ClusterContext>) -> Result<()> {
        self.record("force_delete", ext)
    }

    async fn restore(&self, ext: &Extension, _: &ClusterContext) -> Result<()> {
        self.record("restore", ext)
    }

    async fn migrate(&self, ext: &Extension, _: &ClusterContext) -> Result<()> {
        self.record("migrate", ext)
    }
}

/// Event publisher keeping the reasons it was given
#[derive(Default)]
pub struct RecordingPublisher {
    reasons: Mutex<Vec<String>>,
}

impl RecordingPublisher {
    pub fn reasons(&self) -> Vec<String> {
        self.reasons
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, _: &ObjectReference, event: Event) {
        self.reasons
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event.reason);
    }
}

#[derive(Default)]
struct LeaseState {
    leases: BTreeMap<(String, String), Lease>,
    version: u64,
    failures: usize,
}

/// Lease store with resourceVersion checks and injectable failures
#[derive(Default)]
pub struct MemoryLeaseStore {
    state: Mutex<LeaseState>,
}

impl MemoryLeaseStore {
    fn state(&self) -> std::sync::MutexGuard<'_, LeaseState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Make the next `n` calls fail like an unreachable api server
    pub fn fail(&self, n: usize) {
        self.state().failures = n;
    }

    pub fn lease(&self, namespace: &str, name: &str) -> Option<Lease> {
        self.state()
            .leases
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn check_failure(state: &mut LeaseState) -> Result<()> {
        if state.failures > 0 {
            state.failures -= 1;
            return Err(Error::NotFound("injected api failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Lease>> {
        let mut state = self.state();
        Self::check_failure(&mut state)?;
        Ok(state.leases.get(&(namespace.to_string(), name.to_string())).cloned())
    }

    async fn create(&self, namespace: &str, lease: &Lease) -> Result<Lease> {
        let mut state = self.state();
        Self::check_failure(&mut state)?;
        let key = (namespace.to_string(), lease.name_any());
        if state.leases.contains_key(&key) {
            return Err(Error::Conflict(key.1));
        }
        state.version += 1;
        let mut created = lease.clone();
        created.metadata.namespace = Some(namespace.to_string());
        created.metadata.resource_version = Some(state.version.to_string());
        state.leases.insert(key, created.clone());
        Ok(created)
    }

    async fn replace(&self, namespace: &str, lease: &Lease) -> Result<Lease> {
        let mut state = self.state();
        Self::check_failure(&mut state)?;
        let key = (namespace.to_string(), lease.name_any());
        let current = state
            .leases
            .get(&key)
            .ok_or_else(|| Error::NotFound(key.1.clone()))?;
        if current.metadata.resource_version != lease.metadata.resource_version {
            return Err(Error::Conflict(key.1));
        }
        state.version += 1;
        let mut replaced = lease.clone();
        replaced.metadata.resource_version = Some(state.version.to_string());
        state.leases.insert(key, replaced.clone());
        Ok(replaced)
    }
}
