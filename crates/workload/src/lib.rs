//! wproc workload: the resource builders materialized for a built worker process.

#![forbid(unsafe_code)]

use std::sync::Arc;

use wproc_apply::{BuilderError, ResourceBuilder};
use wproc_core::{Cluster, WorkerProcess};

pub mod config;
pub mod deployment;

pub use config::{config_map_name, WorkerConfigMapBuilder};
pub use deployment::{deployment_name, DeploymentBuilder, DeploymentComparer};

/// Supplies the ordered builder set for one worker process.
pub trait BuilderSetProvider: Send + Sync {
    fn resource_builders(&self, worker: &WorkerProcess, cluster: &Cluster) -> Result<Vec<Arc<dyn ResourceBuilder>>, BuilderError>;
}

/// Config map first so the deployment never starts without its settings.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerProcessBuilders;

impl BuilderSetProvider for WorkerProcessBuilders {
    fn resource_builders(&self, worker: &WorkerProcess, cluster: &Cluster) -> Result<Vec<Arc<dyn ResourceBuilder>>, BuilderError> {
        Ok(vec![
            Arc::new(WorkerConfigMapBuilder::new(worker, cluster)),
            Arc::new(DeploymentBuilder::new(worker, cluster)?),
        ])
    }
}
