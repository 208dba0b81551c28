//! kube-runtime wiring: watch worker processes and the objects they own.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};
use wproc_build::worker_process_jobs;
use wproc_core::WorkerProcess;
use wproc_kubehub::{KubeEventSink, KubeStore};
use wproc_workload::WorkerProcessBuilders;

use crate::config::ControllerConfig;
use crate::engine::{reconcile_key, Context, ReconcileResult};
use crate::Error;

/// Map an engine result onto a controller action.
pub fn to_action(res: ReconcileResult, config: &ControllerConfig) -> Action {
    if res.is_done() {
        Action::requeue(config.resync)
    } else {
        Action::requeue(res.requeue_after)
    }
}

#[instrument(skip(worker, ctx), fields(worker = %worker.name_any()))]
pub async fn reconcile(worker: Arc<WorkerProcess>, ctx: Arc<Context>) -> Result<Action, Error> {
    let res = reconcile_key(&ctx, &worker.ns(), &worker.name_any()).await?;
    Ok(to_action(res, &ctx.config))
}

pub fn error_policy(worker: Arc<WorkerProcess>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(?error, worker = %worker.name_any(), conflict = error.is_conflict(), "reconciliation failed");
    if error.is_conflict() {
        Action::requeue(ctx.config.requeue)
    } else {
        Action::requeue(ctx.config.error_requeue)
    }
}

fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope> + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Context backed by the apiserver.
pub fn kube_context(client: Client, config: ControllerConfig) -> Context {
    let store = Arc::new(KubeStore::new(client.clone(), config.field_manager.clone()));
    let events = Arc::new(KubeEventSink::new(client, config.field_manager.clone()));
    Context::new(store.clone(), store, events, Arc::new(WorkerProcessBuilders), worker_process_jobs(), config)
}

/// Fields whose change warrants a reconcile. Status-only writes hash the same.
pub fn watched_fields(worker: &WorkerProcess) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    worker.metadata.generation.hash(&mut hasher);
    worker.metadata.labels.hash(&mut hasher);
    worker.metadata.annotations.hash(&mut hasher);
    Some(hasher.finish())
}

/// Run the controller until a shutdown signal arrives.
pub async fn run(client: Client, config: ControllerConfig) -> anyhow::Result<()> {
    let ns = config.namespace.clone();
    let ctx = Arc::new(kube_context(client.clone(), config));
    let workers: Api<WorkerProcess> = scoped(&client, ns.as_deref());
    info!(namespace = ?ns, "worker process controller starting");

    let (reader, writer) = reflector::store();
    let changes = watcher(workers, watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .applied_objects()
        .predicate_filter(watched_fields);

    Controller::for_stream(changes, reader)
        .owns(scoped::<Deployment>(&client, ns.as_deref()), watcher::Config::default())
        .owns(scoped::<ConfigMap>(&client, ns.as_deref()), watcher::Config::default())
        .owns(scoped::<Job>(&client, ns.as_deref()), watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(worker = %obj.name, "reconciled"),
                Err(e) => warn!(error = %e, "controller error"),
            }
        })
        .await;
    info!("worker process controller stopped");
    Ok(())
}
