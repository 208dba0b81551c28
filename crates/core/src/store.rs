//! Resource store seams. Every read goes to the backing store; nothing is cached here.

use async_trait::async_trait;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};

use crate::crd::{Cluster, WorkerProcess};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("kube api: {0}")]
    Kube(#[from] kube::Error),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("conflict: {kind} {name} was modified concurrently")]
    Conflict { kind: String, name: String },
    #[error("already exists: {kind} {name}")]
    AlreadyExists { kind: String, name: String },
    #[error("not found: {kind} {name}")]
    NotFound { kind: String, name: String },
    #[error("invalid object: {0}")]
    Invalid(String),
}

/// Untyped access to owned objects (deployments, config maps, jobs).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<Option<DynamicObject>, StoreError>;
    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;
    /// Replace; the object's resourceVersion guards against lost updates.
    async fn update(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;
}

/// Typed access to the managed and referenced custom resources.
#[async_trait]
pub trait WorkerProcessStore: Send + Sync {
    async fn get_worker_process(&self, namespace: &str, name: &str) -> Result<Option<WorkerProcess>, StoreError>;
    async fn update_worker_process(&self, worker: &WorkerProcess) -> Result<WorkerProcess, StoreError>;
    async fn update_worker_process_status(&self, worker: &WorkerProcess) -> Result<WorkerProcess, StoreError>;
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, StoreError>;
}

/// `v1/Kind` or `group/v1/Kind`.
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

/// Resolve the GVK of an object from its type metadata.
pub fn object_gvk(obj: &DynamicObject) -> Result<GroupVersionKind, StoreError> {
    let types = obj.types.as_ref().ok_or_else(|| StoreError::Invalid("object missing apiVersion/kind".into()))?;
    let (group, version) = match types.api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), types.api_version.clone()),
    };
    if version.is_empty() || types.kind.is_empty() {
        return Err(StoreError::Invalid(format!("invalid type meta {}/{}", types.api_version, types.kind)));
    }
    Ok(GroupVersionKind { group, version, kind: types.kind.clone() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_from_core_and_grouped_objects() {
        let cm: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "x" }
        })).unwrap();
        let gvk = object_gvk(&cm).unwrap();
        assert_eq!(gvk_key(&gvk), "v1/ConfigMap");

        let dep: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "apps/v1", "kind": "Deployment", "metadata": { "name": "x" }
        })).unwrap();
        let gvk = object_gvk(&dep).unwrap();
        assert_eq!(gvk.group, "apps");
        assert_eq!(gvk_key(&gvk), "apps/v1/Deployment");
    }

    #[test]
    fn gvk_requires_type_meta() {
        let mut obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "x" }
        })).unwrap();
        obj.types = None;
        assert!(object_gvk(&obj).is_err());
    }
}
