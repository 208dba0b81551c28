//! Outcome events for applier results.

use k8s_openapi::api::core::v1::ObjectReference;
use tracing::debug;
use wproc_apply::{ApplyError, Applied, OperationOutcome};
use wproc_core::{EventSink, Severity};

fn action(op: OperationOutcome) -> Option<&'static str> {
    match op {
        OperationOutcome::Created => Some("Create"),
        OperationOutcome::Updated => Some("Update"),
        OperationOutcome::Deleted => Some("Delete"),
        OperationOutcome::Unchanged => None,
    }
}

/// `Resource<Create|Update|Delete><Success|Error>`; `None` for unchanged objects.
pub fn event_reason(op: OperationOutcome, success: bool) -> Option<String> {
    action(op).map(|a| format!("Resource{}{}", a, if success { "Success" } else { "Error" }))
}

pub async fn report_outcome(sink: &dyn EventSink, subject: &ObjectReference, applied: &Applied) {
    let (Some(act), Some(reason)) = (action(applied.outcome), event_reason(applied.outcome, true)) else {
        debug!(kind = %applied.kind, name = %applied.name, "unchanged");
        return;
    };
    let message = format!("{} {} {}", act.to_lowercase() + "d", applied.kind, applied.name);
    sink.record(subject, Severity::Normal, &reason, act, &message).await;
}

/// Record a failed write. Failures before a write was attempted carry no operation and are only logged.
pub async fn report_error(sink: &dyn EventSink, subject: &ObjectReference, err: &ApplyError) {
    let Some((op, _, _)) = err.attempted() else {
        debug!(error = %err, "apply failed before any write");
        return;
    };
    let (Some(act), Some(reason)) = (action(op), event_reason(op, false)) else { return };
    sink.record(subject, Severity::Warning, &reason, act, &err.to_string()).await;
}
