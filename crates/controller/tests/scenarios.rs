use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::core::{ApiResource, DynamicObject};
use wproc_apply::{to_dynamic, update_typed, BuilderError, ReadinessReporter, ResourceBuilder};
use wproc_build::{job_name, worker_process_jobs, BUILD_WORKER_PROCESS};
use wproc_controller::{reconcile_key, Context, ControllerConfig, ReconcileResult};
use wproc_core::conditions::{TYPE_READY, TYPE_RECONCILE_SUCCESS};
use wproc_core::memory::{CollectingSink, MemoryStore};
use wproc_core::{Cluster, ClusterSpec, ConditionStatus, ObjectStore, StoreError, WorkerProcess, WorkerProcessStore};
use wproc_workload::{BuilderSetProvider, WorkerProcessBuilders};

const NS: &str = "apps";
const NAME: &str = "orders";

fn worker(builder: bool) -> WorkerProcess {
    let mut spec = serde_json::json!({
        "version": "1.0.0", "image": "registry.local/orders", "replicas": 1,
        "pullPolicy": "IfNotPresent", "jobTtlSecondsAfterFinished": 300,
        "clusterRef": { "name": "prod" }
    });
    if builder {
        spec["builder"] = serde_json::json!({
            "enabled": true, "image": "gcr.io/kaniko-project/executor:debug", "buildDir": "/",
            "gitRepository": { "url": "https://git.local/orders.git" }
        });
    }
    serde_json::from_value(serde_json::json!({
        "apiVersion": "wproc.io/v1alpha1", "kind": "WorkerProcess",
        "metadata": { "name": NAME, "namespace": NS },
        "spec": spec
    }))
    .unwrap()
}

fn cluster() -> Cluster {
    let mut c = Cluster::new("prod", ClusterSpec { address: None, port: 7233, namespace: None, tls: None });
    c.metadata.namespace = Some(NS.into());
    c
}

struct Harness {
    store: Arc<MemoryStore>,
    sink: Arc<CollectingSink>,
    ctx: Context,
}

impl Harness {
    fn new(builders: Arc<dyn BuilderSetProvider>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(CollectingSink::new());
        let ctx = Context::new(store.clone(), store.clone(), sink.clone(), builders, worker_process_jobs(), ControllerConfig::default());
        Self { store, sink, ctx }
    }

    fn standard() -> Self { Self::new(Arc::new(WorkerProcessBuilders)) }

    async fn reconcile(&self) -> ReconcileResult {
        reconcile_key(&self.ctx, NS, NAME).await.unwrap()
    }

    fn worker(&self) -> WorkerProcess { self.store.worker_process(NS, NAME).unwrap() }

    fn condition(&self, type_: &str) -> Option<(ConditionStatus, String)> {
        self.worker().condition(type_).map(|c| (c.status, c.reason.clone()))
    }
}

fn mark_ready(store: &MemoryStore, replicas: i32) {
    let ar = ApiResource::erase::<Deployment>(&());
    assert!(store.patch_object(&ar, NS, "orders-worker", |o| o.data["status"] = serde_json::json!({ "readyReplicas": replicas })));
}

#[tokio::test]
async fn unchanged_builders_converge_with_zero_writes() {
    let h = Harness::standard();
    h.store.insert_worker_process(worker(false));
    h.store.insert_cluster(cluster());

    assert_eq!(h.reconcile().await, ReconcileResult::done());
    assert_eq!(h.store.counts().creates, 2);
    assert_eq!(h.condition(TYPE_READY), Some((ConditionStatus::False, "WorkerNotReady".into())));
    assert_eq!(h.sink.reasons(), vec!["ResourceCreateSuccess", "ResourceCreateSuccess"]);

    mark_ready(&h.store, 1);
    h.store.reset_counts();
    assert_eq!(h.reconcile().await, ReconcileResult::done());
    let counts = h.store.counts();
    assert_eq!((counts.creates, counts.updates, counts.status_updates), (0, 0, 1));
    assert_eq!(h.condition(TYPE_READY), Some((ConditionStatus::True, "WorkerReady".into())));
    assert_eq!(h.condition(TYPE_RECONCILE_SUCCESS), Some((ConditionStatus::True, "ReconcileSuccess".into())));
    assert!(h.worker().status.map(|s| s.ready).unwrap_or(false));
    assert_eq!(h.sink.events().len(), 2, "unchanged outcomes are not recorded");

    h.store.reset_counts();
    assert_eq!(h.reconcile().await, ReconcileResult::done());
    assert_eq!(h.store.counts().total(), 0);
}

#[tokio::test]
async fn ready_transition_keeps_timestamp_when_status_is_stable() {
    let h = Harness::standard();
    h.store.insert_worker_process(worker(false));
    h.store.insert_cluster(cluster());
    h.reconcile().await;
    let first = h.worker().condition(TYPE_RECONCILE_SUCCESS).cloned().unwrap();
    mark_ready(&h.store, 1);
    h.reconcile().await;
    let second = h.worker().condition(TYPE_RECONCILE_SUCCESS).cloned().unwrap();
    assert_eq!(first.last_transition_time, second.last_transition_time);
}

#[tokio::test]
async fn build_submits_first_job_and_waits() {
    let h = Harness::standard();
    h.store.insert_worker_process(worker(true));
    h.store.insert_cluster(cluster());

    let res = h.reconcile().await;
    assert_eq!(res, ReconcileResult::after(Duration::from_secs(2)));
    let (status, reason) = h.condition(TYPE_RECONCILE_SUCCESS).unwrap();
    assert_eq!((status, reason.as_str()), (ConditionStatus::True, "ReconcileSuccess"));

    let jobs = h.store.objects_of(&ApiResource::erase::<Job>(&()));
    assert_eq!(jobs.len(), 1);
    let scripts = h.store.object(&ApiResource::erase::<ConfigMap>(&()), NS, "orders-builder-scripts");
    assert!(scripts.is_some());
    assert!(h.store.object(&ApiResource::erase::<Deployment>(&()), NS, "orders-worker").is_none());

    // no resubmission while the job runs
    h.reconcile().await;
    assert_eq!(h.store.objects_of(&ApiResource::erase::<Job>(&())).len(), 1);
}

#[tokio::test]
async fn finished_build_records_image_and_deploys_it() {
    let h = Harness::standard();
    h.store.insert_worker_process(worker(true));
    h.store.insert_cluster(cluster());
    h.reconcile().await;

    let name = job_name(&h.worker(), BUILD_WORKER_PROCESS);
    h.store.patch_object(&ApiResource::erase::<Job>(&()), NS, &name, |o| o.data["status"] = serde_json::json!({ "succeeded": 1 }));

    assert_eq!(h.reconcile().await, ReconcileResult::done());
    let wp = h.worker();
    assert_eq!(wp.status.as_ref().and_then(|s| s.built_image.as_deref()), Some("registry.local/orders:1.0.0"));
    let dep = h.store.object(&ApiResource::erase::<Deployment>(&()), NS, "orders-worker").unwrap();
    assert_eq!(dep.data["spec"]["template"]["spec"]["containers"][0]["image"], "registry.local/orders:1.0.0");
}

#[tokio::test]
async fn missing_cluster_is_a_reconcile_error_with_default_retry() {
    let h = Harness::standard();
    h.store.insert_worker_process(worker(false));

    let res = h.reconcile().await;
    assert!(res.is_done());
    let (status, reason) = h.condition(TYPE_RECONCILE_SUCCESS).unwrap();
    assert_eq!((status, reason.as_str()), (ConditionStatus::False, "ReconcileError"));
    assert!(h.condition(TYPE_READY).is_none());
    assert_eq!(h.store.counts().creates, 0);
}

#[tokio::test]
async fn failed_apply_aborts_before_finalize() {
    let h = Harness::standard();
    h.store.insert_worker_process(worker(false));
    h.store.insert_cluster(cluster());
    h.store.fail_writes_for("orders-worker");

    let res = h.reconcile().await;
    assert_eq!(res, ReconcileResult::after(Duration::from_secs(2)));
    let (status, reason) = h.condition(TYPE_RECONCILE_SUCCESS).unwrap();
    assert_eq!((status, reason.as_str()), (ConditionStatus::False, "ResourcesReconciliationFailed"));
    assert!(h.condition(TYPE_READY).is_none(), "Ready must not be touched");
    assert!(!h.worker().status.map(|s| s.ready).unwrap_or(false));
    assert_eq!(h.sink.reasons(), vec!["ResourceCreateSuccess", "ResourceCreateError"]);
}

#[tokio::test]
async fn missing_and_deleted_workers_are_left_alone() {
    let h = Harness::standard();
    assert_eq!(h.reconcile().await, ReconcileResult::done());

    let mut wp = worker(false);
    wp.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()));
    h.store.insert_worker_process(wp);
    h.store.insert_cluster(cluster());
    assert_eq!(h.reconcile().await, ReconcileResult::done());
    assert_eq!(h.store.counts().total(), 0);
}

#[tokio::test]
async fn defaults_are_persisted_then_reconcile_stops() {
    let h = Harness::standard();
    let mut wp = worker(false);
    wp.spec.replicas = None;
    wp.spec.pull_policy = None;
    h.store.insert_worker_process(wp);
    h.store.insert_cluster(cluster());

    assert_eq!(h.reconcile().await, ReconcileResult::done());
    assert_eq!(h.store.counts().spec_updates, 1);
    assert_eq!(h.store.counts().creates, 0);
    assert_eq!(h.worker().spec.replicas, Some(1));

    h.reconcile().await;
    assert_eq!(h.store.counts().creates, 2);
}

/// Rejects spec updates; everything else goes to the backing store.
struct RejectingSpecUpdates(Arc<MemoryStore>);

#[async_trait]
impl WorkerProcessStore for RejectingSpecUpdates {
    async fn get_worker_process(&self, namespace: &str, name: &str) -> Result<Option<WorkerProcess>, StoreError> {
        self.0.get_worker_process(namespace, name).await
    }

    async fn update_worker_process(&self, _worker: &WorkerProcess) -> Result<WorkerProcess, StoreError> {
        Err(StoreError::Invalid("spec update rejected".into()))
    }

    async fn update_worker_process_status(&self, worker: &WorkerProcess) -> Result<WorkerProcess, StoreError> {
        self.0.update_worker_process_status(worker).await
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, StoreError> {
        self.0.get_cluster(namespace, name).await
    }
}

#[tokio::test]
async fn failed_defaults_write_is_recorded_as_reconcile_error() {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CollectingSink::new());
    let ctx = Context::new(
        Arc::new(RejectingSpecUpdates(store.clone())),
        store.clone(),
        sink,
        Arc::new(WorkerProcessBuilders),
        worker_process_jobs(),
        ControllerConfig::default(),
    );
    let mut wp = worker(false);
    wp.spec.replicas = None;
    store.insert_worker_process(wp);
    store.insert_cluster(cluster());

    let res = reconcile_key(&ctx, NS, NAME).await.unwrap();
    assert_eq!(res, ReconcileResult::after(Duration::from_secs(2)));
    let stored = store.worker_process(NS, NAME).unwrap();
    let cond = stored.condition(TYPE_RECONCILE_SUCCESS).unwrap();
    assert_eq!((cond.status, cond.reason.as_str()), (ConditionStatus::False, "ReconcileError"));
    assert!(cond.message.contains("spec update rejected"));
    assert_eq!(stored.spec.replicas, None, "spec stays as loaded");
    let counts = store.counts();
    assert_eq!((counts.status_updates, counts.creates), (1, 0));
}

#[tokio::test]
async fn stale_status_write_surfaces_as_conflict() {
    let h = Harness::standard();
    h.store.insert_worker_process(worker(false));
    h.store.insert_cluster(cluster());
    h.reconcile().await;

    let stale = h.worker();
    mark_ready(&h.store, 1);
    h.reconcile().await;

    let mut write = stale;
    write.status_mut().ready = false;
    let err = h.store.update_worker_process_status(&write).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict { .. }));
    assert!(wproc_controller::Error::StatusPersist(err).is_conflict());
    assert!(h.worker().status.map(|s| s.ready).unwrap_or(false));
}

struct FixedReadiness {
    name: &'static str,
    ready: Option<bool>,
}

#[async_trait]
impl ReadinessReporter for FixedReadiness {
    async fn report_ready(&self, _store: &dyn ObjectStore) -> Result<bool, StoreError> {
        Ok(self.ready.unwrap_or(true))
    }
}

impl ResourceBuilder for FixedReadiness {
    fn build(&self) -> Result<DynamicObject, BuilderError> {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some(self.name.to_string());
        cm.metadata.namespace = Some(NS.to_string());
        to_dynamic(&cm)
    }

    fn update(&self, obj: &mut DynamicObject) -> Result<(), BuilderError> {
        update_typed::<ConfigMap, _>(obj, |_| Ok(()))
    }

    fn readiness(&self) -> Option<&dyn ReadinessReporter> {
        self.ready.map(|_| self as &dyn ReadinessReporter)
    }
}

struct Fixed(Vec<Option<bool>>);

impl BuilderSetProvider for Fixed {
    fn resource_builders(&self, _: &WorkerProcess, _: &Cluster) -> Result<Vec<Arc<dyn ResourceBuilder>>, BuilderError> {
        const NAMES: [&str; 3] = ["a", "b", "c"];
        Ok(self.0.iter().zip(NAMES).map(|(r, name)| Arc::new(FixedReadiness { name, ready: *r }) as Arc<dyn ResourceBuilder>).collect())
    }
}

async fn ready_with(reports: Vec<Option<bool>>) -> bool {
    let h = Harness::new(Arc::new(Fixed(reports)));
    h.store.insert_worker_process(worker(false));
    h.store.insert_cluster(cluster());
    h.reconcile().await;
    h.worker().status.map(|s| s.ready).unwrap_or(false)
}

#[tokio::test]
async fn readiness_is_the_and_of_all_reporters() {
    assert!(ready_with(vec![Some(true), Some(true)]).await);
    assert!(!ready_with(vec![Some(false), Some(true)]).await, "a later ready report must not mask an earlier one");
    assert!(!ready_with(vec![Some(true), Some(false)]).await);
    assert!(ready_with(vec![None, None]).await, "no reporters means vacuously ready");
    assert!(!ready_with(vec![Some(false), None, Some(true)]).await);
}
