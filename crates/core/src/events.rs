//! Event sink seam. Recording is fire-and-forget: implementations log their own failures.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, subject: &ObjectReference, severity: Severity, reason: &str, action: &str, message: &str);
}
