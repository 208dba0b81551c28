//! The worker Deployment, its semantic comparer and its readiness report.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapEnvSource, Container, EnvFromSource, LocalObjectReference, PodSpec, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::core::{ApiResource, DynamicObject};
use kube::ResourceExt;
use serde_json::{json, Value as Json};
use tracing::debug;
use wproc_apply::{from_dynamic, structurally_equal, to_dynamic, update_typed, BuilderError, Comparer, ReadinessReporter, ResourceBuilder};
use wproc_core::{Cluster, ObjectStore, StoreError, WorkerProcess};

use crate::config::{config_map_name, worker_labels};

pub const CONTAINER: &str = "worker";
pub const TLS_MOUNT: &str = "/etc/wproc/tls";
const TLS_VOLUME: &str = "cluster-tls";

pub fn deployment_name(worker: &WorkerProcess) -> String {
    worker.child_name("worker")
}

fn selector_labels(worker: &WorkerProcess) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), worker.name_any()),
        ("app.kubernetes.io/component".to_string(), "worker".to_string()),
    ])
}

pub struct DeploymentBuilder {
    name: String,
    namespace: String,
    labels: BTreeMap<String, String>,
    selector: BTreeMap<String, String>,
    replicas: i32,
    image: String,
    pull_policy: Option<String>,
    image_pull_secrets: Vec<String>,
    config_map: String,
    tls_secret: Option<String>,
}

impl DeploymentBuilder {
    /// Fails when the worker has no runnable image (building enabled but not built yet).
    pub fn new(worker: &WorkerProcess, cluster: &Cluster) -> Result<Self, BuilderError> {
        let image = worker
            .runtime_image()
            .ok_or_else(|| BuilderError::Invalid(format!("worker process {} has no built image yet", worker.name_any())))?;
        Ok(Self {
            name: deployment_name(worker),
            namespace: worker.ns(),
            labels: worker_labels(worker),
            selector: selector_labels(worker),
            replicas: worker.spec.replicas.unwrap_or(1),
            image,
            pull_policy: worker.spec.pull_policy.clone().filter(|p| !p.is_empty()),
            image_pull_secrets: worker.spec.image_pull_secrets.clone(),
            config_map: config_map_name(worker),
            tls_secret: cluster.spec.tls.as_ref().map(|t| t.secret_name.clone()),
        })
    }

    fn converge_pod(&self, pod: &mut PodSpec) {
        if !pod.containers.iter().any(|c| c.name == CONTAINER) {
            pod.containers.push(Container { name: CONTAINER.to_string(), ..Default::default() });
        }
        if let Some(c) = pod.containers.iter_mut().find(|c| c.name == CONTAINER) {
            c.image = Some(self.image.clone());
            if self.pull_policy.is_some() {
                c.image_pull_policy = self.pull_policy.clone();
            }
            c.env_from = Some(vec![EnvFromSource {
                config_map_ref: Some(ConfigMapEnvSource { name: Some(self.config_map.clone()), optional: None }),
                ..Default::default()
            }]);
            c.volume_mounts = self.tls_secret.as_ref().map(|_| {
                vec![VolumeMount { name: TLS_VOLUME.into(), mount_path: TLS_MOUNT.into(), read_only: Some(true), ..Default::default() }]
            });
        }
        pod.volumes = self.tls_secret.as_ref().map(|secret| {
            vec![Volume {
                name: TLS_VOLUME.into(),
                secret: Some(SecretVolumeSource { secret_name: Some(secret.clone()), ..Default::default() }),
                ..Default::default()
            }]
        });
        pod.image_pull_secrets = if self.image_pull_secrets.is_empty() {
            None
        } else {
            Some(self.image_pull_secrets.iter().map(|s| LocalObjectReference { name: Some(s.clone()) }).collect())
        };
    }
}

impl ResourceBuilder for DeploymentBuilder {
    fn build(&self) -> Result<DynamicObject, BuilderError> {
        to_dynamic(&Deployment {
            metadata: ObjectMeta { name: Some(self.name.clone()), namespace: Some(self.namespace.clone()), ..Default::default() },
            spec: Some(DeploymentSpec {
                selector: LabelSelector { match_labels: Some(self.selector.clone()), ..Default::default() },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn update(&self, obj: &mut DynamicObject) -> Result<(), BuilderError> {
        update_typed::<Deployment, _>(obj, |d| {
            d.metadata.labels.get_or_insert_with(BTreeMap::new).extend(self.labels.clone());
            let spec = d.spec.get_or_insert_with(DeploymentSpec::default);
            spec.replicas = Some(self.replicas);
            // selector is immutable after creation
            if spec.selector.match_labels.is_none() && spec.selector.match_expressions.is_none() {
                spec.selector.match_labels = Some(self.selector.clone());
            }
            let meta = spec.template.metadata.get_or_insert_with(ObjectMeta::default);
            meta.labels.get_or_insert_with(BTreeMap::new).extend(self.labels.clone());
            self.converge_pod(spec.template.spec.get_or_insert_with(PodSpec::default));
            Ok(())
        })
    }

    fn comparer(&self) -> Option<Arc<dyn Comparer>> {
        Some(Arc::new(DeploymentComparer))
    }

    fn readiness(&self) -> Option<&dyn ReadinessReporter> {
        Some(self)
    }
}

#[async_trait]
impl ReadinessReporter for DeploymentBuilder {
    async fn report_ready(&self, store: &dyn ObjectStore) -> Result<bool, StoreError> {
        let ar = ApiResource::erase::<Deployment>(&());
        let Some(obj) = store.get(&ar, &self.namespace, &self.name).await? else {
            return Ok(false);
        };
        let d: Deployment = serde_json::from_value(serde_json::to_value(&obj)?)?;
        let ready = d.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
        debug!(deployment = %self.name, ready, desired = self.replicas, "deployment readiness");
        Ok(ready == self.replicas)
    }
}

/// Compares only the fields the controller manages, so server-side defaulting
/// (probes, termination paths, strategy, volume modes) never counts as drift.
pub struct DeploymentComparer;

impl DeploymentComparer {
    fn managed_view(d: &Deployment) -> Json {
        let spec = d.spec.clone().unwrap_or_default();
        let pod = spec.template.spec.clone().unwrap_or_default();
        let containers: Vec<Json> = pod
            .containers
            .iter()
            .map(|c| {
                let mounts: Vec<Json> = c
                    .volume_mounts
                    .iter()
                    .flatten()
                    .map(|m| json!({ "name": m.name, "mountPath": m.mount_path, "readOnly": m.read_only.unwrap_or(false) }))
                    .collect();
                json!({
                    "name": c.name,
                    "image": c.image,
                    "imagePullPolicy": c.image_pull_policy,
                    "envFrom": c.env_from,
                    "volumeMounts": mounts,
                })
            })
            .collect();
        let volumes: Vec<Json> = pod
            .volumes
            .iter()
            .flatten()
            .map(|v| json!({ "name": v.name, "secret": v.secret.as_ref().and_then(|s| s.secret_name.clone()) }))
            .collect();
        let owners: Vec<&str> = d.metadata.owner_references.iter().flatten().map(|o| o.uid.as_str()).collect();
        json!({
            "labels": d.metadata.labels,
            "owners": owners,
            "replicas": spec.replicas.unwrap_or(1),
            "templateLabels": spec.template.metadata.as_ref().and_then(|m| m.labels.clone()),
            "containers": containers,
            "volumes": volumes,
            "imagePullSecrets": pod.image_pull_secrets.unwrap_or_default().into_iter().map(|s| s.name).collect::<Vec<_>>(),
        })
    }
}

impl Comparer for DeploymentComparer {
    fn equal(&self, live: &DynamicObject, candidate: &DynamicObject) -> bool {
        match (from_dynamic::<Deployment>(live), from_dynamic::<Deployment>(candidate)) {
            (Ok(a), Ok(b)) => Self::managed_view(&a) == Self::managed_view(&b),
            _ => structurally_equal(live, candidate),
        }
    }
}
