//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::resolver::{DEFERRED_BACKOFF, NOT_READY_BACKOFF};

/// What happens to the finalizer when the remote system cannot be reached
/// while a resource is being deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeletionPolicy {
    /// Release the finalizer. A remote object may be leaked.
    #[default]
    ForceRemoveWhenUnreachable,
    /// Keep the finalizer and retry until the remote side answers.
    RetainUntilReachable,
}

/// Tuning for reconcilers and controllers.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Retry delay when the target cluster or credentials are missing.
    pub not_ready_backoff: Duration,
    /// Retry delay when a handle cannot be opened yet.
    pub deferred_backoff: Duration,
    /// First retry delay after a failed pass. Doubles per consecutive failure.
    pub error_backoff_base: Duration,
    pub error_backoff_max: Duration,
    /// Passes running at the same time, across all keys.
    pub max_concurrent_reconciles: usize,
    /// Re-run converged resources after this long, to catch remote drift.
    pub resync_interval: Option<Duration>,
    pub deletion_policy: DeletionPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            not_ready_backoff: NOT_READY_BACKOFF,
            deferred_backoff: DEFERRED_BACKOFF,
            error_backoff_base: Duration::from_secs(5),
            error_backoff_max: Duration::from_secs(300),
            max_concurrent_reconciles: 4,
            resync_interval: None,
            deletion_policy: DeletionPolicy::default(),
        }
    }
}

impl ControllerConfig {
    /// Delay before retrying after `failures` consecutive failed passes.
    pub fn error_backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.error_backoff_base
            .saturating_mul(1 << exponent)
            .min(self.error_backoff_max)
    }
}
