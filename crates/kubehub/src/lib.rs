//! wproc kubehub: apiserver-backed implementations of the store and event seams

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    api::{Api, PostParams},
    core::{ApiResource, DynamicObject},
    runtime::events::{Event, EventType, Recorder, Reporter},
    Client, ResourceExt,
};
use metrics::counter;
use tracing::{debug, warn};
use wproc_core::{Cluster, EventSink, ObjectStore, Severity, StoreError, WorkerProcess, WorkerProcessStore};

/// Build a client from the ambient kubeconfig or in-cluster service account.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("initialising kube client (kubeconfig or in-cluster)")
}

fn dynamic_api(client: &Client, ar: &ApiResource, namespace: &str) -> Api<DynamicObject> {
    if namespace.is_empty() {
        Api::all_with(client.clone(), ar)
    } else {
        Api::namespaced_with(client.clone(), namespace, ar)
    }
}

/// Map write failures onto the store's error vocabulary.
fn write_err(kind: &str, name: &str, e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            StoreError::AlreadyExists { kind: kind.to_string(), name: name.to_string() }
        }
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict { kind: kind.to_string(), name: name.to_string() },
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound { kind: kind.to_string(), name: name.to_string() },
        other => StoreError::Kube(other),
    }
}

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    field_manager: String,
}

impl KubeStore {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self { client, field_manager: field_manager.into() }
    }

    fn post_params(&self) -> PostParams {
        PostParams { field_manager: Some(self.field_manager.clone()), ..Default::default() }
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<Option<DynamicObject>, StoreError> {
        let api = dynamic_api(&self.client, ar, namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let name = obj.name_any();
        let api = dynamic_api(&self.client, ar, &obj.namespace().unwrap_or_default());
        debug!(kind = %ar.kind, name = %name, "create");
        api.create(&self.post_params(), obj).await.map_err(|e| write_err(&ar.kind, &name, e))
    }

    async fn update(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let name = obj.name_any();
        let api = dynamic_api(&self.client, ar, &obj.namespace().unwrap_or_default());
        debug!(kind = %ar.kind, name = %name, rv = ?obj.metadata.resource_version, "replace");
        api.replace(&name, &self.post_params(), obj).await.map_err(|e| write_err(&ar.kind, &name, e))
    }
}

#[async_trait]
impl WorkerProcessStore for KubeStore {
    async fn get_worker_process(&self, namespace: &str, name: &str) -> Result<Option<WorkerProcess>, StoreError> {
        let api: Api<WorkerProcess> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn update_worker_process(&self, worker: &WorkerProcess) -> Result<WorkerProcess, StoreError> {
        let name = worker.name_any();
        let api: Api<WorkerProcess> = Api::namespaced(self.client.clone(), &worker.ns());
        api.replace(&name, &self.post_params(), worker).await.map_err(|e| write_err("WorkerProcess", &name, e))
    }

    async fn update_worker_process_status(&self, worker: &WorkerProcess) -> Result<WorkerProcess, StoreError> {
        let name = worker.name_any();
        let api: Api<WorkerProcess> = Api::namespaced(self.client.clone(), &worker.ns());
        // the loaded resourceVersion travels in the body; a stale write is a 409
        let body = serde_json::to_vec(worker)?;
        api.replace_status(&name, &self.post_params(), body).await.map_err(|e| write_err("WorkerProcess", &name, e))
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, StoreError> {
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

/// Publishes core/v1 events through the kube-runtime recorder.
#[derive(Clone)]
pub struct KubeEventSink {
    client: Client,
    reporter: Reporter,
}

impl KubeEventSink {
    pub fn new(client: Client, controller: impl Into<String>) -> Self {
        let reporter = Reporter { controller: controller.into(), instance: std::env::var("HOSTNAME").ok() };
        Self { client, reporter }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn record(&self, subject: &ObjectReference, severity: Severity, reason: &str, action: &str, message: &str) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), subject.clone());
        let type_ = match severity {
            Severity::Normal => EventType::Normal,
            Severity::Warning => EventType::Warning,
        };
        let ev = Event {
            type_,
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(ev).await {
            counter!("event_publish_err", 1u64);
            warn!(error = %e, reason = %reason, object = ?subject.name, "ignoring event publish failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_err(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: "x".into(), reason: reason.into(), code })
    }

    #[test]
    fn write_errors_map_to_store_errors() {
        assert!(matches!(write_err("Job", "j", api_err(409, "AlreadyExists")), StoreError::AlreadyExists { .. }));
        assert!(matches!(write_err("Job", "j", api_err(409, "Conflict")), StoreError::Conflict { .. }));
        assert!(matches!(write_err("Job", "j", api_err(404, "NotFound")), StoreError::NotFound { .. }));
        assert!(matches!(write_err("Job", "j", api_err(422, "Invalid")), StoreError::Kube(_)));
    }
}
