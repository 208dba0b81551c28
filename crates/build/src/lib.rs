//! wproc build: ordered, resumable build jobs for worker process images.
//!
//! The pipeline keeps no memory between invocations. Every call replays the job
//! list from the start against what the store currently holds.

#![forbid(unsafe_code)]

pub mod job;
pub mod pipeline;
pub mod scripts;

pub use job::{job_name, sanitize_dns_label, worker_process_jobs, JobBuilder, JobDescriptor, BUILD_WORKER_PROCESS};
pub use pipeline::{next_step, run_pipeline, JobStep, PipelineOutcome};
pub use scripts::{scripts_config_map_name, ScriptsConfigMapBuilder};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("fetching build job {name}: {source}")]
    Fetch { name: String, #[source] source: wproc_core::StoreError },
    #[error("decoding build job {name}: {source}")]
    Decode { name: String, #[source] source: wproc_apply::BuilderError },
    #[error("reporting success of build job {job}: {message}")]
    Report { job: String, message: String },
}
