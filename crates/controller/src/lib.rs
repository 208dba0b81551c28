//! wproc controller: the reconciliation engine and its kube-runtime wiring.

#![forbid(unsafe_code)]

pub mod config;
pub mod controller;
pub mod engine;
pub mod report;

pub use config::ControllerConfig;
pub use controller::{error_policy, kube_context, reconcile, run, to_action};
pub use engine::{reconcile_key, Context, ReconcileResult};

use wproc_core::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("loading worker process: {0}")]
    Load(#[source] StoreError),
    #[error("persisting status: {0}")]
    StatusPersist(#[source] StoreError),
}

impl Error {
    /// Conflicts resolve on the next attempt against fresh state.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::StatusPersist(StoreError::Conflict { .. }))
    }
}
