//! Controller settings, read from the environment.

use std::time::Duration;

use wproc_core::Defaults;

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(default))
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Watch scope; `None` watches every namespace.
    pub namespace: Option<String>,
    /// Short fixed delay for waits and handled failures.
    pub requeue: Duration,
    /// Idle resync applied when a reconcile asks for no particular delay.
    pub resync: Duration,
    /// Delay after an invocation error.
    pub error_requeue: Duration,
    /// Field manager for writes and reporting controller for events.
    pub field_manager: String,
    pub defaults: Defaults,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            requeue: Duration::from_secs(2),
            resync: Duration::from_secs(300),
            error_requeue: Duration::from_secs(30),
            field_manager: "wproc-controller".to_string(),
            defaults: Defaults::default(),
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        let base = Self::default();
        let mut defaults = base.defaults.clone();
        if let Some(image) = env_str("WPROC_BUILDER_IMAGE") {
            defaults.builder_image = image;
        }
        Self {
            namespace: env_str("WPROC_NAMESPACE"),
            requeue: env_secs("WPROC_REQUEUE_SECS", 2),
            resync: env_secs("WPROC_RESYNC_SECS", 300),
            error_requeue: env_secs("WPROC_ERROR_REQUEUE_SECS", 30),
            field_manager: env_str("WPROC_FIELD_MANAGER").unwrap_or(base.field_manager),
            defaults,
        }
    }
}
