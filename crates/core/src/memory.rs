//! In-memory store and event sink. Used by tests and dry runs; mirrors apiserver
//! behaviour closely enough for reconcile logic (uid/resourceVersion assignment,
//! optimistic concurrency on spec and status replace, status kept apart from spec).

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::core::{ApiResource, DynamicObject};
use kube::ResourceExt;

use crate::crd::{Cluster, WorkerProcess};
use crate::events::{EventSink, Severity};
use crate::store::{ObjectStore, StoreError, WorkerProcessStore};

type Key = (String, String, String);

fn ar_key(ar: &ApiResource) -> String {
    format!("{}/{}", ar.api_version, ar.kind)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteCounts {
    pub creates: u64,
    pub updates: u64,
    pub spec_updates: u64,
    pub status_updates: u64,
}

impl WriteCounts {
    pub fn total(&self) -> u64 { self.creates + self.updates + self.spec_updates + self.status_updates }
}

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<Key, DynamicObject>>,
    workers: Mutex<BTreeMap<(String, String), WorkerProcess>>,
    clusters: Mutex<BTreeMap<(String, String), Cluster>>,
    counts: Mutex<WriteCounts>,
    failing: Mutex<HashSet<String>>,
    rv: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    fn next_rv(&self) -> String {
        (self.rv.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn stamp(&self, meta: &mut k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) {
        if meta.uid.is_none() { meta.uid = Some(uuid::Uuid::new_v4().to_string()); }
        if meta.generation.is_none() { meta.generation = Some(1); }
        meta.resource_version = Some(self.next_rv());
    }

    pub fn counts(&self) -> WriteCounts {
        self.counts.lock().map(|c| *c).unwrap_or_default()
    }

    pub fn reset_counts(&self) {
        if let Ok(mut c) = self.counts.lock() { *c = WriteCounts::default(); }
    }

    /// Make every create/update of an object with this name fail.
    pub fn fail_writes_for(&self, name: &str) {
        if let Ok(mut f) = self.failing.lock() { f.insert(name.to_string()); }
    }

    pub fn insert_worker_process(&self, mut worker: WorkerProcess) {
        self.stamp(&mut worker.metadata);
        let key = (worker.ns(), worker.name_any());
        if let Ok(mut w) = self.workers.lock() { w.insert(key, worker); }
    }

    pub fn insert_cluster(&self, mut cluster: Cluster) {
        self.stamp(&mut cluster.metadata);
        let key = (cluster.namespace().unwrap_or_default(), cluster.name_any());
        if let Ok(mut c) = self.clusters.lock() { c.insert(key, cluster); }
    }

    pub fn worker_process(&self, namespace: &str, name: &str) -> Option<WorkerProcess> {
        self.workers.lock().ok().and_then(|w| w.get(&(namespace.to_string(), name.to_string())).cloned())
    }

    pub fn object(&self, ar: &ApiResource, namespace: &str, name: &str) -> Option<DynamicObject> {
        self.objects.lock().ok().and_then(|o| o.get(&(ar_key(ar), namespace.to_string(), name.to_string())).cloned())
    }

    /// All stored objects of one kind.
    pub fn objects_of(&self, ar: &ApiResource) -> Vec<DynamicObject> {
        let k = ar_key(ar);
        self.objects.lock().map(|o| o.iter().filter(|(key, _)| key.0 == k).map(|(_, v)| v.clone()).collect()).unwrap_or_default()
    }

    /// Mutate a stored object in place, as another actor (e.g. the job controller) would.
    pub fn patch_object(&self, ar: &ApiResource, namespace: &str, name: &str, f: impl FnOnce(&mut DynamicObject)) -> bool {
        let rv = self.next_rv();
        let Ok(mut objects) = self.objects.lock() else { return false };
        match objects.get_mut(&(ar_key(ar), namespace.to_string(), name.to_string())) {
            Some(obj) => {
                f(obj);
                obj.metadata.resource_version = Some(rv);
                true
            }
            None => false,
        }
    }

    fn check_failing(&self, name: &str) -> Result<(), StoreError> {
        let failing = self.failing.lock().map(|f| f.contains(name)).unwrap_or(false);
        if failing {
            return Err(StoreError::Invalid(format!("injected write failure for {}", name)));
        }
        Ok(())
    }

    fn bump(&self, f: impl FnOnce(&mut WriteCounts)) {
        if let Ok(mut c) = self.counts.lock() { f(&mut c); }
    }
}

fn poisoned() -> StoreError { StoreError::Invalid("memory store lock poisoned".into()) }

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<Option<DynamicObject>, StoreError> {
        Ok(self.object(ar, namespace, name))
    }

    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let name = obj.name_any();
        self.check_failing(&name)?;
        let ns = obj.namespace().unwrap_or_default();
        let key = (ar_key(ar), ns, name.clone());
        let mut stored = obj.clone();
        self.stamp(&mut stored.metadata);
        let mut objects = self.objects.lock().map_err(|_| poisoned())?;
        if objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists { kind: ar.kind.clone(), name });
        }
        objects.insert(key, stored.clone());
        drop(objects);
        self.bump(|c| c.creates += 1);
        Ok(stored)
    }

    async fn update(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let name = obj.name_any();
        self.check_failing(&name)?;
        let ns = obj.namespace().unwrap_or_default();
        let key = (ar_key(ar), ns, name.clone());
        let rv = self.next_rv();
        let mut objects = self.objects.lock().map_err(|_| poisoned())?;
        let current = objects.get(&key).ok_or_else(|| StoreError::NotFound { kind: ar.kind.clone(), name: name.clone() })?;
        if obj.metadata.resource_version.is_some() && obj.metadata.resource_version != current.metadata.resource_version {
            return Err(StoreError::Conflict { kind: ar.kind.clone(), name });
        }
        let mut stored = obj.clone();
        stored.metadata.resource_version = Some(rv);
        objects.insert(key, stored.clone());
        drop(objects);
        self.bump(|c| c.updates += 1);
        Ok(stored)
    }
}

#[async_trait]
impl WorkerProcessStore for MemoryStore {
    async fn get_worker_process(&self, namespace: &str, name: &str) -> Result<Option<WorkerProcess>, StoreError> {
        Ok(self.worker_process(namespace, name))
    }

    async fn update_worker_process(&self, worker: &WorkerProcess) -> Result<WorkerProcess, StoreError> {
        let key = (worker.ns(), worker.name_any());
        let rv = self.next_rv();
        let mut workers = self.workers.lock().map_err(|_| poisoned())?;
        let current = workers.get(&key).ok_or_else(|| StoreError::NotFound { kind: "WorkerProcess".into(), name: key.1.clone() })?;
        if worker.metadata.resource_version != current.metadata.resource_version {
            return Err(StoreError::Conflict { kind: "WorkerProcess".into(), name: key.1.clone() });
        }
        let mut stored = worker.clone();
        stored.status = current.status.clone();
        if stored.spec != current.spec {
            stored.metadata.generation = Some(current.metadata.generation.unwrap_or(1) + 1);
        }
        stored.metadata.resource_version = Some(rv);
        workers.insert(key, stored.clone());
        drop(workers);
        self.bump(|c| c.spec_updates += 1);
        Ok(stored)
    }

    async fn update_worker_process_status(&self, worker: &WorkerProcess) -> Result<WorkerProcess, StoreError> {
        let key = (worker.ns(), worker.name_any());
        let rv = self.next_rv();
        let mut workers = self.workers.lock().map_err(|_| poisoned())?;
        let current = workers.get_mut(&key).ok_or_else(|| StoreError::NotFound { kind: "WorkerProcess".into(), name: key.1.clone() })?;
        if worker.metadata.resource_version != current.metadata.resource_version {
            return Err(StoreError::Conflict { kind: "WorkerProcess".into(), name: key.1.clone() });
        }
        current.status = worker.status.clone();
        current.metadata.resource_version = Some(rv);
        let stored = current.clone();
        drop(workers);
        self.bump(|c| c.status_updates += 1);
        Ok(stored)
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, StoreError> {
        Ok(self.clusters.lock().map_err(|_| poisoned())?.get(&(namespace.to_string(), name.to_string())).cloned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub subject: String,
    pub severity: Severity,
    pub reason: String,
    pub action: String,
    pub message: String,
}

/// Sink collecting events for inspection.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<RecordedEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self { Self::default() }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn record(&self, subject: &ObjectReference, severity: Severity, reason: &str, action: &str, message: &str) {
        if let Ok(mut events) = self.events.lock() {
            events.push(RecordedEvent {
                subject: subject.name.clone().unwrap_or_default(),
                severity,
                reason: reason.to_string(),
                action: action.to_string(),
                message: message.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;

    fn cm(name: &str) -> DynamicObject {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": "ns" },
            "data": { "k": "v" }
        })).unwrap()
    }

    #[tokio::test]
    async fn create_then_conflicting_update() {
        let store = MemoryStore::new();
        let ar = ApiResource::erase::<ConfigMap>(&());
        let created = store.create(&ar, &cm("a")).await.unwrap();
        assert!(created.metadata.uid.is_some());

        let mut first = created.clone();
        first.data["data"]["k"] = serde_json::json!("v2");
        store.update(&ar, &first).await.unwrap();

        // stale resourceVersion
        let err = store.update(&ar, &created).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert_eq!(store.counts(), WriteCounts { creates: 1, updates: 1, ..Default::default() });
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = MemoryStore::new();
        let ar = ApiResource::erase::<ConfigMap>(&());
        store.create(&ar, &cm("a")).await.unwrap();
        assert!(matches!(store.create(&ar, &cm("a")).await, Err(StoreError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn stale_status_write_conflicts() {
        let store = MemoryStore::new();
        store.insert_worker_process(serde_json::from_value(serde_json::json!({
            "apiVersion": "wproc.io/v1alpha1", "kind": "WorkerProcess",
            "metadata": { "name": "w", "namespace": "ns" },
            "spec": { "version": "1", "image": "img", "clusterRef": { "name": "c" } }
        })).unwrap());
        let loaded = store.worker_process("ns", "w").unwrap();

        let mut first = loaded.clone();
        first.status_mut().ready = true;
        store.update_worker_process_status(&first).await.unwrap();

        let mut stale = loaded;
        stale.status_mut().built_image = Some("img:1".into());
        let err = store.update_worker_process_status(&stale).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        let current = store.worker_process("ns", "w").unwrap();
        assert!(current.status.as_ref().is_some_and(|s| s.ready && s.built_image.is_none()));
        assert_eq!(store.counts().status_updates, 1);
    }

    #[tokio::test]
    async fn injected_failures_apply_to_writes_only() {
        let store = MemoryStore::new();
        let ar = ApiResource::erase::<ConfigMap>(&());
        store.fail_writes_for("a");
        assert!(store.create(&ar, &cm("a")).await.is_err());
        assert!(store.get(&ar, "ns", "a").await.unwrap().is_none());
    }
}
