//! Job sequencing: a pure per-job decision plus the driver that performs the I/O.

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::ApiResource;
use metrics::counter;
use tracing::{debug, info, warn};
use wproc_apply::{apply, from_dynamic, ComparisonContext};
use wproc_core::{ObjectStore, WorkerProcess};

use crate::job::{JobBuilder, JobDescriptor};
use crate::BuildError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStep {
    /// Effect already recorded; move on.
    Skip,
    /// No job object yet.
    Submit,
    /// Submitted, not yet succeeded.
    Wait,
    /// Succeeded; record the effect and move on.
    Report,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Complete,
    Waiting { job: String },
}

fn succeeded(job: &Job) -> bool {
    job.status.as_ref().and_then(|s| s.succeeded) == Some(1)
}

pub fn next_step(job: &JobDescriptor, worker: &WorkerProcess, observed: Option<&Job>) -> JobStep {
    if (job.skip)(worker) {
        return JobStep::Skip;
    }
    match observed {
        None => JobStep::Submit,
        Some(j) if succeeded(j) => JobStep::Report,
        Some(_) => JobStep::Wait,
    }
}

/// Replay `jobs` in order, stopping at the first one still in flight.
///
/// Success reports mutate `worker` in memory; persisting them is the caller's job.
/// Submission failures are logged and reported as `Waiting` so the next
/// invocation retries the submit.
pub async fn run_pipeline(
    store: &dyn ObjectStore,
    owner: &OwnerReference,
    worker: &mut WorkerProcess,
    jobs: &[JobDescriptor],
    cmp: &mut ComparisonContext,
) -> Result<PipelineOutcome, BuildError> {
    let ar = ApiResource::erase::<Job>(&());
    for job in jobs {
        if (job.skip)(worker) {
            debug!(job = job.name, "build job skipped");
            continue;
        }
        let builder = JobBuilder::new(worker, job);
        let name = builder.name();
        let observed = store
            .get(&ar, &worker.ns(), &name)
            .await
            .map_err(|source| BuildError::Fetch { name: name.clone(), source })?;
        let observed: Option<Job> = observed
            .as_ref()
            .map(from_dynamic::<Job>)
            .transpose()
            .map_err(|source| BuildError::Decode { name: name.clone(), source })?;

        match next_step(job, worker, observed.as_ref()) {
            JobStep::Skip => continue,
            JobStep::Submit => {
                match apply(store, owner, &builder, cmp).await {
                    Ok(_) => {
                        counter!("build_jobs_submitted", 1u64);
                        info!(job = job.name, name = %name, "build job submitted");
                    }
                    Err(e) => {
                        counter!("build_jobs_submit_err", 1u64);
                        warn!(job = job.name, name = %name, error = %e, "build job submission failed");
                    }
                }
                return Ok(PipelineOutcome::Waiting { job: name });
            }
            JobStep::Wait => {
                info!(job = job.name, name = %name, "waiting for build job to complete");
                return Ok(PipelineOutcome::Waiting { job: name });
            }
            JobStep::Report => {
                info!(job = job.name, name = %name, "build job finished");
                (job.report_success)(worker)?;
            }
        }
    }
    Ok(PipelineOutcome::Complete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::JobStatus;

    fn descriptor(skip: fn(&WorkerProcess) -> bool) -> JobDescriptor {
        JobDescriptor { name: "step", command: vec![], skip, report_success: |_| Ok(()) }
    }

    fn worker() -> WorkerProcess {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "wproc.io/v1alpha1", "kind": "WorkerProcess",
            "metadata": { "name": "w", "namespace": "apps" },
            "spec": { "version": "1", "image": "img", "clusterRef": { "name": "c" } }
        }))
        .unwrap()
    }

    fn job(succeeded: Option<i32>) -> Job {
        Job { status: Some(JobStatus { succeeded, ..Default::default() }), ..Default::default() }
    }

    #[test]
    fn skip_wins_over_any_observation() {
        let d = descriptor(|_| true);
        assert_eq!(next_step(&d, &worker(), None), JobStep::Skip);
        assert_eq!(next_step(&d, &worker(), Some(&job(None))), JobStep::Skip);
    }

    #[test]
    fn only_exactly_one_success_reports() {
        let d = descriptor(|_| false);
        assert_eq!(next_step(&d, &worker(), None), JobStep::Submit);
        assert_eq!(next_step(&d, &worker(), Some(&job(None))), JobStep::Wait);
        assert_eq!(next_step(&d, &worker(), Some(&job(Some(0)))), JobStep::Wait);
        assert_eq!(next_step(&d, &worker(), Some(&job(Some(1)))), JobStep::Report);
    }
}
