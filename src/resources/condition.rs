//! Status conditions
//!
//! Conditions are the only user-visible failure channel: every outcome of a
//! reconcile is reported as a set of typed conditions on the resource status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The profile is fully converged with the remote API
pub const READY: &str = "Ready";
/// Every collection was synced on the last attempt
pub const SYNCED: &str = "Synced";
/// Every declared reference resolved on the last attempt
pub const REFERENCES_RESOLVED: &str = "ReferencesResolved";

/// Tri-state condition status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Observation of one aspect of a resource's state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,

    pub status: ConditionStatus,

    /// Brief CamelCase reason for the condition's last transition
    pub reason: String,

    #[serde(default)]
    pub message: String,

    /// Moves only when `status` changes
    pub last_transition_time: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    pub fn new(
        condition_type: &str,
        status: impl Into<ConditionStatus>,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status: status.into(),
            reason: reason.into(),
            message: message.into(),
            last_transition_time: now,
            observed_generation: None,
        }
    }

    pub fn with_generation(mut self, generation: i64) -> Self {
        self.observed_generation = Some(generation);
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Insert or replace a condition by type
///
/// The previous transition time is kept when the status did not change, so
/// re-applying an identical observation leaves the condition untouched.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == condition.condition_type)
    {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.condition_type == condition_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_set_condition_keeps_transition_time_when_unchanged() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(30);

        let mut conditions = Vec::new();
        set_condition(&mut conditions, Condition::new(READY, true, "Synced", "", t0));
        set_condition(&mut conditions, Condition::new(READY, true, "Synced", "again", t1));

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, t0);
        assert_eq!(conditions[0].message, "again");
    }

    #[test]
    fn test_set_condition_moves_transition_time_on_flip() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(30);

        let mut conditions = Vec::new();
        set_condition(&mut conditions, Condition::new(READY, true, "Synced", "", t0));
        set_condition(&mut conditions, Condition::new(READY, false, "SyncFailed", "", t1));

        let ready = find_condition(&conditions, READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.last_transition_time, t1);
    }
}
