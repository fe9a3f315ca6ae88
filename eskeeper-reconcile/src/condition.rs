//! Status conditions tracked on every declared resource.
//!
//! The status is owned by the reconciler. Declarers never write it; the
//! store only accepts it through `update_status`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregate condition set on every resource.
pub const READY: &str = "Ready";

/// Reason used for the baseline condition on first sight.
pub const REASON_INITIALIZE: &str = "Initialize";
/// Reason for the aggregate condition when a pass fails.
pub const REASON_ERROR: &str = "Error";
/// Reason for the resource condition when a pass fails.
pub const REASON_FAILED: &str = "Failed";
/// Reason for the aggregate condition when a pass succeeds.
pub const REASON_SUCCESS: &str = "Success";

/// A named boolean observation about the resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: String,
    pub status: bool,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Status written back by the reconciler after each pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileStatus {
    /// Ordered, keyed by type, last write wins.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// True iff the last pass found the remote object converged.
    #[serde(default)]
    pub sync: bool,
    /// Snapshot of the last object this reconciler created or updated.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub original_object: String,
    /// Generation of the spec the last successful pass converged on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl ReconcileStatus {
    pub fn get_condition(&self, r#type: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.r#type == r#type)
    }

    pub fn is_condition_true(&self, r#type: &str) -> bool {
        self.get_condition(r#type).is_some_and(|c| c.status)
    }

    /// Set a condition. Returns whether anything changed.
    ///
    /// The transition time only moves when the boolean state flips or the
    /// condition is new.
    pub fn set_condition(
        &mut self,
        r#type: &str,
        status: bool,
        reason: &str,
        message: &str,
    ) -> bool {
        self.set_condition_at(r#type, status, reason, message, Utc::now())
    }

    fn set_condition_at(
        &mut self,
        r#type: &str,
        status: bool,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> bool {
        match self.conditions.iter_mut().find(|c| c.r#type == r#type) {
            Some(existing) => {
                if existing.status == status
                    && existing.reason == reason
                    && existing.message == message
                {
                    return false;
                }
                if existing.status != status {
                    existing.last_transition_time = now;
                }
                existing.status = status;
                existing.reason = reason.to_string();
                existing.message = message.to_string();
                true
            }
            None => {
                self.conditions.push(Condition {
                    r#type: r#type.to_string(),
                    status,
                    reason: reason.to_string(),
                    message: message.to_string(),
                    last_transition_time: now,
                });
                true
            }
        }
    }

    /// Add the baseline `Ready=False/Initialize` condition the first time a
    /// resource is seen.
    pub fn ensure_initialized(&mut self) -> bool {
        if self.get_condition(READY).is_some() {
            return false;
        }
        self.set_condition(READY, false, REASON_INITIALIZE, "Starting reconciliation")
    }

    /// Record a converged pass.
    pub fn mark_success(
        &mut self,
        condition_type: &str,
        reason: &str,
        message: &str,
        generation: i64,
    ) {
        self.set_condition(condition_type, true, reason, message);
        self.set_condition(READY, true, REASON_SUCCESS, "");
        self.sync = true;
        self.observed_generation = Some(generation);
    }

    /// Record a failed pass. The aggregate condition always goes down with
    /// the resource condition.
    pub fn mark_failure(&mut self, condition_type: &str, message: &str) {
        self.set_condition(condition_type, false, REASON_FAILED, message);
        self.set_condition(READY, false, REASON_ERROR, message);
        self.sync = false;
    }
}
