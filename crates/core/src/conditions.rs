//! Status conditions with Kubernetes transition semantics.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::WorkerProcess;

pub const TYPE_RECONCILE_SUCCESS: &str = "ReconcileSuccess";
pub const TYPE_READY: &str = "Ready";

pub const REASON_RECONCILE_SUCCESS: &str = "ReconcileSuccess";
pub const REASON_RECONCILE_ERROR: &str = "ReconcileError";
pub const REASON_RESOURCES_FAILED: &str = "ResourcesReconciliationFailed";
pub const REASON_BUILD_SCRIPTS_FAILED: &str = "BuildScriptsReconciliationFailed";
pub const REASON_BUILD_JOB_FAILED: &str = "BuildJobFailed";
pub const REASON_WORKER_READY: &str = "WorkerReady";
pub const REASON_WORKER_NOT_READY: &str = "WorkerNotReady";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

impl From<bool> for ConditionStatus {
    fn from(v: bool) -> Self { if v { ConditionStatus::True } else { ConditionStatus::False } }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Insert or update the condition of `type_`.
///
/// `last_transition_time` moves only when `status` changes; otherwise reason,
/// message and observed generation are refreshed in place. Returns true when
/// anything was modified.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
    now: DateTime<Utc>,
) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        None => {
            conditions.push(Condition {
                type_: type_.to_string(),
                status,
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: now,
                observed_generation,
            });
            true
        }
        Some(existing) => {
            let before = existing.clone();
            if existing.status != status {
                existing.status = status;
                existing.last_transition_time = now;
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = observed_generation;
            *existing != before
        }
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Readiness predicate over the worker process status.
pub fn is_worker_process_ready(worker: &WorkerProcess) -> bool {
    worker.status.as_ref().map(|s| s.ready).unwrap_or(false)
}
