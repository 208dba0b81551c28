//! Worker settings derived from the referenced cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::DynamicObject;
use kube::ResourceExt;
use wproc_apply::{to_dynamic, update_typed, BuilderError, ResourceBuilder};
use wproc_core::{Cluster, WorkerProcess};

pub const KEY_ADDRESS: &str = "CLUSTER_ADDRESS";
pub const KEY_NAMESPACE: &str = "CLUSTER_NAMESPACE";
pub const KEY_TLS_ENABLED: &str = "CLUSTER_TLS_ENABLED";
pub const KEY_TASK_QUEUE: &str = "TASK_QUEUE";
pub const KEY_VERSION: &str = "WORKER_VERSION";

pub fn config_map_name(worker: &WorkerProcess) -> String {
    worker.child_name("worker-config")
}

pub(crate) fn worker_labels(worker: &WorkerProcess) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), worker.name_any()),
        ("app.kubernetes.io/component".to_string(), "worker".to_string()),
        ("app.kubernetes.io/managed-by".to_string(), "wproc-controller".to_string()),
    ])
}

pub struct WorkerConfigMapBuilder {
    name: String,
    namespace: String,
    labels: BTreeMap<String, String>,
    data: BTreeMap<String, String>,
}

impl WorkerConfigMapBuilder {
    pub fn new(worker: &WorkerProcess, cluster: &Cluster) -> Self {
        let mut data = BTreeMap::from([
            (KEY_ADDRESS.to_string(), cluster.frontend_address()),
            (KEY_NAMESPACE.to_string(), cluster.logical_namespace().to_string()),
            (KEY_TLS_ENABLED.to_string(), cluster.spec.tls.is_some().to_string()),
            (KEY_VERSION.to_string(), worker.spec.version.clone()),
        ]);
        if let Some(q) = worker.spec.task_queue.as_ref().filter(|q| !q.is_empty()) {
            data.insert(KEY_TASK_QUEUE.to_string(), q.clone());
        }
        Self { name: config_map_name(worker), namespace: worker.ns(), labels: worker_labels(worker), data }
    }
}

impl ResourceBuilder for WorkerConfigMapBuilder {
    fn build(&self) -> Result<DynamicObject, BuilderError> {
        to_dynamic(&ConfigMap {
            metadata: ObjectMeta { name: Some(self.name.clone()), namespace: Some(self.namespace.clone()), ..Default::default() },
            ..Default::default()
        })
    }

    fn update(&self, obj: &mut DynamicObject) -> Result<(), BuilderError> {
        update_typed::<ConfigMap, _>(obj, |cm| {
            cm.metadata.labels.get_or_insert_with(BTreeMap::new).extend(self.labels.clone());
            cm.data = Some(self.data.clone());
            Ok(())
        })
    }
}
