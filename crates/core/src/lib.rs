//! wproc core: custom resources, status conditions, and the store/event seams the
//! reconciler talks through.

#![forbid(unsafe_code)]

pub mod conditions;
pub mod crd;
pub mod events;
pub mod memory;
pub mod store;

pub use conditions::{is_worker_process_ready, set_condition, Condition, ConditionStatus};
pub use crd::{
    BuildRegistrySpec, BuilderSpec, Cluster, ClusterReference, ClusterSpec, ClusterTlsSpec, Defaults, GitReference,
    GitRepositorySpec, WorkerProcess, WorkerProcessSpec, WorkerProcessStatus,
};
pub use events::{EventSink, Severity};
pub use store::{gvk_key, object_gvk, ObjectStore, StoreError, WorkerProcessStore};
