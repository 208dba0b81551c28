//! Custom resources: `WorkerProcess` (managed) and `Cluster` (referenced, read-only).

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::{self, Condition, ConditionStatus};

pub const GROUP: &str = "wproc.io";
pub const VERSION: &str = "v1alpha1";

/// Desired state of a worker process.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "wproc.io",
    version = "v1alpha1",
    kind = "WorkerProcess",
    namespaced,
    status = "WorkerProcessStatus",
    shortname = "wp",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WorkerProcessSpec {
    /// Application version, used as the image tag.
    pub version: String,
    /// Image repository (without tag).
    pub image: String,
    /// Number of desired worker pods. Defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Image pull policy for the worker container. Defaults to IfNotPresent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_policy: Option<String>,
    /// Names of secrets used to pull the worker image.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,
    /// Cluster the worker connects to.
    pub cluster_ref: ClusterReference,
    /// Task queue forwarded to the worker through its config map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_queue: Option<String>,
    /// TTL applied to finished build jobs. Defaults to 300.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_ttl_seconds_after_finished: Option<i32>,
    /// Optional in-cluster build of the worker image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builder: Option<BuilderSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterReference {
    pub name: String,
    /// Defaults to the worker process namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BuilderSpec {
    #[serde(default)]
    pub enabled: bool,
    /// Builder container image. Defaulted by the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_repository: Option<GitRepositorySpec>,
    /// Directory of the build context inside the repository. Defaults to `/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_registry: Option<BuildRegistrySpec>,
    /// Bump to force a rebuild of the same version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<i32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GitRepositorySpec {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<GitReference>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GitReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BuildRegistrySpec {
    /// Repository the built image is pushed to. Defaults to `spec.image`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// Secret holding a docker config.json for pushing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret: Option<String>,
}

/// Observed state, written only by the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerProcessStatus {
    #[serde(default)]
    pub ready: bool,
    /// Image produced by the last successful build job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub built_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Connection settings shared by the workers of a cluster.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(group = "wproc.io", version = "v1alpha1", kind = "Cluster", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Frontend host. Defaults to `<name>-frontend.<namespace>.svc.cluster.local`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default = "default_frontend_port")]
    pub port: i32,
    /// Logical namespace the workers register in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<ClusterTlsSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTlsSpec {
    pub secret_name: String,
}

fn default_frontend_port() -> i32 { 7233 }

impl Cluster {
    /// `host:port` the workers dial.
    pub fn frontend_address(&self) -> String {
        let host = match &self.spec.address {
            Some(a) if !a.is_empty() => a.clone(),
            _ => format!("{}-frontend.{}.svc.cluster.local", self.name_any(), self.namespace().unwrap_or_else(|| "default".to_string())),
        };
        format!("{}:{}", host, self.spec.port)
    }

    pub fn logical_namespace(&self) -> &str {
        self.spec.namespace.as_deref().unwrap_or("default")
    }
}

/// Values filled into unset spec fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defaults {
    pub replicas: i32,
    pub pull_policy: String,
    pub job_ttl_seconds_after_finished: i32,
    pub builder_image: String,
    pub build_dir: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            replicas: 1,
            pull_policy: "IfNotPresent".to_string(),
            job_ttl_seconds_after_finished: 300,
            builder_image: "gcr.io/kaniko-project/executor:debug".to_string(),
            build_dir: "/".to_string(),
        }
    }
}

impl WorkerProcess {
    /// Namespace of the object; workers are namespaced so this is only empty for malformed input.
    pub fn ns(&self) -> String {
        self.namespace().unwrap_or_default()
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn builder_enabled(&self) -> bool {
        self.spec.builder.as_ref().map(|b| b.enabled).unwrap_or(false)
    }

    /// Namespace of the referenced cluster, defaulting to our own.
    pub fn cluster_namespace(&self) -> String {
        match &self.spec.cluster_ref.namespace {
            Some(ns) if !ns.is_empty() => ns.clone(),
            _ => self.ns(),
        }
    }

    /// Name for an object owned by this worker process.
    pub fn child_name(&self, suffix: &str) -> String {
        format!("{}-{}", self.name_any(), suffix)
    }

    /// Image reference the build pipeline is expected to produce.
    pub fn build_destination(&self) -> String {
        let repo = self
            .spec
            .builder
            .as_ref()
            .and_then(|b| b.build_registry.as_ref())
            .and_then(|r| r.repository.clone())
            .unwrap_or_else(|| self.spec.image.clone());
        format!("{}:{}", repo, self.spec.version)
    }

    /// Image the deployment runs: the built image when building, else `image:version`.
    pub fn runtime_image(&self) -> Option<String> {
        if self.builder_enabled() {
            self.status.as_ref().and_then(|s| s.built_image.clone())
        } else {
            Some(format!("{}:{}", self.spec.image, self.spec.version))
        }
    }

    pub fn status_mut(&mut self) -> &mut WorkerProcessStatus {
        self.status.get_or_insert_with(WorkerProcessStatus::default)
    }

    /// Fill unset fields. Returns true when the spec changed.
    pub fn apply_defaults(&mut self, defaults: &Defaults) -> bool {
        let before = self.spec.clone();
        let spec = &mut self.spec;
        if spec.replicas.is_none() { spec.replicas = Some(defaults.replicas); }
        if spec.pull_policy.as_deref().map(str::is_empty).unwrap_or(true) { spec.pull_policy = Some(defaults.pull_policy.clone()); }
        if spec.job_ttl_seconds_after_finished.is_none() { spec.job_ttl_seconds_after_finished = Some(defaults.job_ttl_seconds_after_finished); }
        if let Some(builder) = spec.builder.as_mut().filter(|b| b.enabled) {
            if builder.image.as_deref().map(str::is_empty).unwrap_or(true) { builder.image = Some(defaults.builder_image.clone()); }
            if builder.build_dir.as_deref().map(str::is_empty).unwrap_or(true) { builder.build_dir = Some(defaults.build_dir.clone()); }
        }
        before != self.spec
    }

    pub fn set_reconcile_success(&mut self, reason: &str, message: &str, now: DateTime<Utc>) {
        let generation = self.metadata.generation;
        conditions::set_condition(&mut self.status_mut().conditions, conditions::TYPE_RECONCILE_SUCCESS, ConditionStatus::True, reason, message, generation, now);
    }

    pub fn set_reconcile_error(&mut self, reason: &str, message: &str, now: DateTime<Utc>) {
        let generation = self.metadata.generation;
        conditions::set_condition(&mut self.status_mut().conditions, conditions::TYPE_RECONCILE_SUCCESS, ConditionStatus::False, reason, message, generation, now);
    }

    pub fn set_ready_condition(&mut self, status: ConditionStatus, reason: &str, now: DateTime<Utc>) {
        let generation = self.metadata.generation;
        conditions::set_condition(&mut self.status_mut().conditions, conditions::TYPE_READY, status, reason, "", generation, now);
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.status.as_ref().and_then(|s| s.conditions.iter().find(|c| c.type_ == type_))
    }
}
