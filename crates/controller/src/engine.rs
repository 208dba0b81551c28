//! One reconciliation of one worker process.
//!
//! Load, default, build, resolve the cluster, materialize, then fold readiness
//! into status. Every state needed is read back from the store on each call;
//! delays are returned, never slept.

use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use kube::Resource;
use metrics::{counter, histogram};
use tracing::{debug, info, instrument, warn};
use wproc_apply::{apply, ComparisonContext};
use wproc_build::{run_pipeline, JobDescriptor, PipelineOutcome, ScriptsConfigMapBuilder};
use wproc_core::conditions::{
    REASON_BUILD_JOB_FAILED, REASON_BUILD_SCRIPTS_FAILED, REASON_RECONCILE_ERROR, REASON_RECONCILE_SUCCESS, REASON_RESOURCES_FAILED,
    REASON_WORKER_NOT_READY, REASON_WORKER_READY,
};
use wproc_core::{is_worker_process_ready, ConditionStatus, EventSink, ObjectStore, WorkerProcess, WorkerProcessStatus, WorkerProcessStore};
use wproc_workload::BuilderSetProvider;

use crate::config::ControllerConfig;
use crate::report::{report_error, report_outcome};
use crate::Error;

/// Scheduling instruction. A zero delay leaves the retry to the scheduler's default policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileResult {
    pub requeue_after: Duration,
}

impl ReconcileResult {
    pub fn done() -> Self { Self { requeue_after: Duration::ZERO } }

    pub fn after(delay: Duration) -> Self { Self { requeue_after: delay } }

    pub fn is_done(&self) -> bool { self.requeue_after.is_zero() }
}

/// Collaborators of the engine. Cheap to clone; shared across invocations.
#[derive(Clone)]
pub struct Context {
    pub workers: Arc<dyn WorkerProcessStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub events: Arc<dyn EventSink>,
    pub builders: Arc<dyn BuilderSetProvider>,
    pub jobs: Vec<JobDescriptor>,
    pub config: ControllerConfig,
}

impl Context {
    pub fn new(
        workers: Arc<dyn WorkerProcessStore>,
        objects: Arc<dyn ObjectStore>,
        events: Arc<dyn EventSink>,
        builders: Arc<dyn BuilderSetProvider>,
        jobs: Vec<JobDescriptor>,
        config: ControllerConfig,
    ) -> Self {
        Self { workers, objects, events, builders, jobs, config }
    }
}

/// Reconcile the worker process at `namespace/name`.
#[instrument(skip(ctx), fields(worker = %format!("{}/{}", namespace, name)))]
pub async fn reconcile_key(ctx: &Context, namespace: &str, name: &str) -> Result<ReconcileResult, Error> {
    let t0 = Instant::now();
    counter!("reconcile_total", 1u64);
    let res = reconcile_inner(ctx, namespace, name).await;
    histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    match &res {
        Ok(r) => debug!(requeue_after_ms = r.requeue_after.as_millis() as u64, "reconciled"),
        Err(e) => {
            counter!("reconcile_errors", 1u64);
            warn!(error = %e, "reconcile error");
        }
    }
    res
}

async fn reconcile_inner(ctx: &Context, namespace: &str, name: &str) -> Result<ReconcileResult, Error> {
    let Some(mut worker) = ctx.workers.get_worker_process(namespace, name).await.map_err(Error::Load)? else {
        debug!("worker process not found");
        return Ok(ReconcileResult::done());
    };
    if worker.is_marked_for_deletion() {
        debug!("worker process is being deleted");
        return Ok(ReconcileResult::done());
    }

    let loaded = worker.status.clone();
    let short = ctx.config.requeue;

    let mut defaulted = worker.clone();
    if defaulted.apply_defaults(&ctx.config.defaults) {
        // status is recorded against the copy as loaded
        if let Err(e) = ctx.workers.update_worker_process(&defaulted).await {
            return fail(ctx, &mut worker, &loaded, REASON_RECONCILE_ERROR, format!("persisting defaulted spec: {}", e), short).await;
        }
        info!("defaults applied");
        return Ok(ReconcileResult::done());
    }

    let Some(owner) = worker.controller_owner_ref(&()) else {
        let msg = format!("worker process {} has no uid; cannot own objects", name);
        return fail(ctx, &mut worker, &loaded, REASON_RECONCILE_ERROR, msg, short).await;
    };
    let subject = worker.object_ref(&());
    let objects = ctx.objects.as_ref();
    let events = ctx.events.as_ref();
    let mut cmp = ComparisonContext::new();

    if worker.builder_enabled() {
        match apply(objects, &owner, &ScriptsConfigMapBuilder::new(&worker), &mut cmp).await {
            Ok(applied) => report_outcome(events, &subject, &applied).await,
            Err(e) => {
                report_error(events, &subject, &e).await;
                return fail(ctx, &mut worker, &loaded, REASON_BUILD_SCRIPTS_FAILED, e, short).await;
            }
        }
        match run_pipeline(objects, &owner, &mut worker, &ctx.jobs, &mut cmp).await {
            Ok(PipelineOutcome::Complete) => debug!("build phase complete"),
            Ok(PipelineOutcome::Waiting { job }) => {
                worker.set_reconcile_success(REASON_RECONCILE_SUCCESS, &format!("waiting for build job {}", job), Utc::now());
                persist_status(ctx, &worker, &loaded).await?;
                return Ok(ReconcileResult::after(short));
            }
            Err(e) => return fail(ctx, &mut worker, &loaded, REASON_BUILD_JOB_FAILED, e, short).await,
        }
    }

    let cluster_ns = worker.cluster_namespace();
    let cluster_name = worker.spec.cluster_ref.name.clone();
    let cluster = match ctx.workers.get_cluster(&cluster_ns, &cluster_name).await {
        Ok(Some(c)) => c,
        Ok(None) => {
            let msg = format!("cluster {}/{} not found", cluster_ns, cluster_name);
            return fail(ctx, &mut worker, &loaded, REASON_RECONCILE_ERROR, msg, Duration::ZERO).await;
        }
        Err(e) => return fail(ctx, &mut worker, &loaded, REASON_RECONCILE_ERROR, e, Duration::ZERO).await,
    };

    let builders = match ctx.builders.resource_builders(&worker, &cluster) {
        Ok(b) => b,
        Err(e) => return fail(ctx, &mut worker, &loaded, REASON_RESOURCES_FAILED, e, short).await,
    };
    let mut ready = true;
    for builder in &builders {
        match apply(objects, &owner, builder.as_ref(), &mut cmp).await {
            Ok(applied) => report_outcome(events, &subject, &applied).await,
            Err(e) => {
                report_error(events, &subject, &e).await;
                return fail(ctx, &mut worker, &loaded, REASON_RESOURCES_FAILED, e, short).await;
            }
        }
        if let Some(reporter) = builder.readiness() {
            match reporter.report_ready(objects).await {
                Ok(r) => ready &= r,
                Err(e) => return fail(ctx, &mut worker, &loaded, REASON_RESOURCES_FAILED, e, short).await,
            }
        }
    }

    let now = Utc::now();
    let version = worker.spec.version.clone();
    let status = worker.status_mut();
    status.ready = ready;
    status.version = Some(version);
    if is_worker_process_ready(&worker) {
        worker.set_ready_condition(ConditionStatus::True, REASON_WORKER_READY, now);
    } else {
        worker.set_ready_condition(ConditionStatus::False, REASON_WORKER_NOT_READY, now);
    }
    worker.set_reconcile_success(REASON_RECONCILE_SUCCESS, "", now);
    persist_status(ctx, &worker, &loaded).await?;
    Ok(ReconcileResult::done())
}

/// Record the failure on the ReconcileSuccess condition and schedule a retry.
async fn fail(
    ctx: &Context,
    worker: &mut WorkerProcess,
    loaded: &Option<WorkerProcessStatus>,
    reason: &str,
    err: impl Display,
    delay: Duration,
) -> Result<ReconcileResult, Error> {
    warn!(reason, error = %err, "reconcile step failed");
    worker.set_reconcile_error(reason, &err.to_string(), Utc::now());
    persist_status(ctx, worker, loaded).await?;
    Ok(ReconcileResult::after(delay))
}

async fn persist_status(ctx: &Context, worker: &WorkerProcess, loaded: &Option<WorkerProcessStatus>) -> Result<(), Error> {
    if worker.status == *loaded {
        debug!("status unchanged");
        return Ok(());
    }
    ctx.workers.update_worker_process_status(worker).await.map_err(Error::StatusPersist)?;
    Ok(())
}
