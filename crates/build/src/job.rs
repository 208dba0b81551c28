//! Build job descriptors and the batch/v1 Job builder.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EnvVar, KeyToPath, LocalObjectReference, PodSpec, PodTemplateSpec, SecretVolumeSource,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::DynamicObject;
use kube::ResourceExt;
use wproc_apply::{to_dynamic, update_typed, BuilderError, ResourceBuilder};
use wproc_core::{Defaults, WorkerProcess};

use crate::scripts::{scripts_config_map_name, BUILD_SCRIPT_KEY};
use crate::BuildError;

pub const BUILD_WORKER_PROCESS: &str = "build-worker-process";

const SCRIPTS_MOUNT: &str = "/scripts";
const DOCKER_CONFIG_MOUNT: &str = "/kaniko/.docker";

/// One step of the build pipeline.
#[derive(Clone)]
pub struct JobDescriptor {
    pub name: &'static str,
    pub command: Vec<String>,
    /// True when the job's effect is already recorded on the worker process.
    pub skip: fn(&WorkerProcess) -> bool,
    /// Record the job's effect once it succeeded.
    pub report_success: fn(&mut WorkerProcess) -> Result<(), BuildError>,
}

impl std::fmt::Debug for JobDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDescriptor").field("name", &self.name).field("command", &self.command).finish()
    }
}

/// Jobs run for every worker process with building enabled, in order.
pub fn worker_process_jobs() -> Vec<JobDescriptor> {
    vec![JobDescriptor {
        name: BUILD_WORKER_PROCESS,
        command: vec!["/busybox/sh".into(), format!("{}/{}", SCRIPTS_MOUNT, BUILD_SCRIPT_KEY)],
        skip: image_already_built,
        report_success: record_built_image,
    }]
}

fn image_already_built(worker: &WorkerProcess) -> bool {
    let built = worker.status.as_ref().and_then(|s| s.built_image.as_deref());
    built == Some(worker.build_destination().as_str())
}

fn record_built_image(worker: &mut WorkerProcess) -> Result<(), BuildError> {
    let image = worker.build_destination();
    worker.status_mut().built_image = Some(image);
    Ok(())
}

/// Lowercase RFC 1123 label, at most 63 characters.
pub fn sanitize_dns_label(raw: &str) -> String {
    let mapped: String = raw
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let trimmed = mapped.trim_matches('-');
    let mut out: String = trimmed.chars().take(63).collect();
    while out.ends_with('-') { out.pop(); }
    out
}

/// `<worker>-<job>-<version>`, with `-<attempt>` appended when a rebuild was requested.
pub fn job_name(worker: &WorkerProcess, job: &str) -> String {
    let mut raw = format!("{}-{}-{}", worker.name_any(), job, worker.spec.version);
    if let Some(attempt) = worker.spec.builder.as_ref().and_then(|b| b.attempt) {
        raw.push_str(&format!("-{}", attempt));
    }
    sanitize_dns_label(&raw)
}

fn job_labels(worker: &WorkerProcess, job: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), worker.name_any()),
        ("app.kubernetes.io/managed-by".to_string(), "wproc-controller".to_string()),
        ("wproc.io/job".to_string(), job.to_string()),
        ("wproc.io/version".to_string(), sanitize_dns_label(&worker.spec.version)),
    ])
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar { name: name.to_string(), value: Some(value.into()), ..Default::default() }
}

/// Renders the Job for one descriptor.
pub struct JobBuilder {
    worker: WorkerProcess,
    job: JobDescriptor,
}

impl JobBuilder {
    pub fn new(worker: &WorkerProcess, job: &JobDescriptor) -> Self {
        Self { worker: worker.clone(), job: job.clone() }
    }

    pub fn name(&self) -> String { job_name(&self.worker, self.job.name) }

    fn pod_spec(&self) -> PodSpec {
        let defaults = Defaults::default();
        let builder = self.worker.spec.builder.clone().unwrap_or_default();
        let git = builder.git_repository.clone().unwrap_or_default();
        let mut env_vars = vec![
            env("GIT_REPOSITORY", git.url),
            env("BUILD_DIR", builder.build_dir.clone().unwrap_or(defaults.build_dir)),
            env("DESTINATION", self.worker.build_destination()),
            env("WORKER_VERSION", self.worker.spec.version.clone()),
        ];
        if let Some(branch) = git.reference.and_then(|r| r.branch) {
            env_vars.push(env("GIT_BRANCH", branch));
        }

        let mut mounts = vec![VolumeMount { name: "scripts".into(), mount_path: SCRIPTS_MOUNT.into(), read_only: Some(true), ..Default::default() }];
        let mut volumes = vec![Volume {
            name: "scripts".into(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(scripts_config_map_name(&self.worker)),
                default_mode: Some(0o755),
                ..Default::default()
            }),
            ..Default::default()
        }];
        if let Some(secret) = builder.build_registry.as_ref().and_then(|r| r.credentials_secret.clone()) {
            mounts.push(VolumeMount { name: "docker-config".into(), mount_path: DOCKER_CONFIG_MOUNT.into(), read_only: Some(true), ..Default::default() });
            volumes.push(Volume {
                name: "docker-config".into(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret),
                    items: Some(vec![KeyToPath { key: ".dockerconfigjson".into(), path: "config.json".into(), ..Default::default() }]),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        PodSpec {
            restart_policy: Some("Never".into()),
            containers: vec![Container {
                name: "builder".into(),
                image: Some(builder.image.unwrap_or(defaults.builder_image)),
                command: Some(self.job.command.clone()),
                env: Some(env_vars),
                volume_mounts: Some(mounts),
                ..Default::default()
            }],
            volumes: Some(volumes),
            image_pull_secrets: Some(
                self.worker.spec.image_pull_secrets.iter().map(|s| LocalObjectReference { name: Some(s.clone()) }).collect(),
            ),
            ..Default::default()
        }
    }
}

impl ResourceBuilder for JobBuilder {
    fn build(&self) -> Result<DynamicObject, BuilderError> {
        let labels = job_labels(&self.worker, self.job.name);
        let job = Job {
            metadata: ObjectMeta { name: Some(self.name()), namespace: Some(self.worker.ns()), labels: Some(labels.clone()), ..Default::default() },
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                ttl_seconds_after_finished: self.worker.spec.job_ttl_seconds_after_finished,
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                    spec: Some(self.pod_spec()),
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        to_dynamic(&job)
    }

    // Job pod templates are immutable once submitted; only labels converge.
    fn update(&self, obj: &mut DynamicObject) -> Result<(), BuilderError> {
        let labels = job_labels(&self.worker, self.job.name);
        update_typed::<Job, _>(obj, |job| {
            job.metadata.labels.get_or_insert_with(BTreeMap::new).extend(labels);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wproc_apply::from_dynamic;
    use wproc_core::{BuildRegistrySpec, BuilderSpec, ClusterReference, GitReference, GitRepositorySpec, WorkerProcessSpec};

    fn worker() -> WorkerProcess {
        let mut wp = WorkerProcess::new("Orders_Worker", WorkerProcessSpec {
            version: "1.2.0".into(),
            image: "registry.local/orders".into(),
            replicas: Some(1),
            pull_policy: None,
            image_pull_secrets: vec!["pull".into()],
            cluster_ref: ClusterReference { name: "prod".into(), namespace: None },
            task_queue: None,
            job_ttl_seconds_after_finished: Some(120),
            builder: Some(BuilderSpec {
                enabled: true,
                image: None,
                git_repository: Some(GitRepositorySpec {
                    url: "https://git.local/orders.git".into(),
                    reference: Some(GitReference { branch: Some("main".into()) }),
                }),
                build_dir: Some("/worker".into()),
                build_registry: Some(BuildRegistrySpec { repository: None, credentials_secret: Some("push-creds".into()) }),
                attempt: None,
            }),
        });
        wp.metadata.namespace = Some("apps".into());
        wp
    }

    #[test]
    fn names_are_dns_labels() {
        let mut wp = worker();
        assert_eq!(job_name(&wp, BUILD_WORKER_PROCESS), "orders-worker-build-worker-process-1-2-0");
        wp.spec.builder.as_mut().unwrap().attempt = Some(2);
        assert_eq!(job_name(&wp, BUILD_WORKER_PROCESS), "orders-worker-build-worker-process-1-2-0-2");
        let long = "x".repeat(80);
        assert_eq!(sanitize_dns_label(&format!("{}-", long)).len(), 63);
        assert_eq!(sanitize_dns_label("--A.b--"), "a-b");
    }

    #[test]
    fn skip_and_report_track_built_image() {
        let jobs = worker_process_jobs();
        let job = &jobs[0];
        let mut wp = worker();
        assert!(!(job.skip)(&wp));
        (job.report_success)(&mut wp).unwrap();
        assert_eq!(wp.status.as_ref().and_then(|s| s.built_image.as_deref()), Some("registry.local/orders:1.2.0"));
        assert!((job.skip)(&wp));
        // a new version invalidates the recorded image
        wp.spec.version = "1.3.0".into();
        assert!(!(job.skip)(&wp));
    }

    #[test]
    fn job_carries_build_inputs() {
        let wp = worker();
        let jobs = worker_process_jobs();
        let b = JobBuilder::new(&wp, &jobs[0]);
        let job: Job = from_dynamic(&b.build().unwrap()).unwrap();
        let spec = job.spec.unwrap();
        assert_eq!(spec.ttl_seconds_after_finished, Some(120));
        let pod = spec.template.spec.unwrap();
        let c = &pod.containers[0];
        assert_eq!(c.image.as_deref(), Some("gcr.io/kaniko-project/executor:debug"));
        let env: BTreeMap<_, _> = c.env.clone().unwrap().into_iter().map(|e| (e.name, e.value.unwrap_or_default())).collect();
        assert_eq!(env["DESTINATION"], "registry.local/orders:1.2.0");
        assert_eq!(env["GIT_BRANCH"], "main");
        assert_eq!(env["BUILD_DIR"], "/worker");
        let volumes = pod.volumes.unwrap();
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[0].config_map.as_ref().and_then(|c| c.name.as_deref()), Some("orders-worker-builder-scripts"));
    }
}
