//! Condition management helpers following Kubernetes API conventions

use chrono::Utc;

use crate::crd::{Condition, ConditionStatus};

/// Consul rejected or could not serve a request.
pub const REASON_CONSUL_AGENT_ERROR: &str = "ConsulAgentError";
/// The entry exists in Consul but is owned by someone else.
pub const REASON_EXTERNALLY_MANAGED: &str = "ExternallyManagedConfigError";
/// A migration was requested but the resource does not match the entry.
pub const REASON_MIGRATION_FAILED: &str = "MigrationFailedError";

/// Update or add a condition to the conditions list
///
/// The transition time only moves when the status changes.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) {
    let now = Utc::now().to_rfc3339();

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        let should_update_time = existing.status != status;

        existing.status = status;
        existing.reason = reason.to_string();
        existing.message = message.to_string();

        if should_update_time {
            existing.last_transition_time = now;
        }
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status,
            last_transition_time: now,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Status of a condition, `Unknown` when absent
pub fn condition_status(conditions: &[Condition], type_: &str) -> ConditionStatus {
    find_condition(conditions, type_)
        .map(|c| c.status)
        .unwrap_or(ConditionStatus::Unknown)
}

/// Check if a condition is true
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    condition_status(conditions, type_) == ConditionStatus::True
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::CONDITION_SYNCED;

    #[test]
    fn test_set_condition_adds_new() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            CONDITION_SYNCED,
            ConditionStatus::True,
            "",
            "",
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, CONDITION_SYNCED);
        assert_eq!(conditions[0].status, ConditionStatus::True);
    }

    #[test]
    fn test_set_condition_updates_existing() {
        let mut conditions = vec![Condition {
            type_: CONDITION_SYNCED.to_string(),
            status: ConditionStatus::False,
            last_transition_time: "2024-01-01T00:00:00Z".to_string(),
            reason: REASON_CONSUL_AGENT_ERROR.to_string(),
            message: "connection refused".to_string(),
        }];

        let old_time = conditions[0].last_transition_time.clone();
        set_condition(
            &mut conditions,
            CONDITION_SYNCED,
            ConditionStatus::True,
            "",
            "",
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, ConditionStatus::True);
        assert!(conditions[0].reason.is_empty());
        assert_ne!(conditions[0].last_transition_time, old_time);
    }

    #[test]
    fn test_set_condition_same_status_keeps_time() {
        let mut conditions = vec![Condition {
            type_: CONDITION_SYNCED.to_string(),
            status: ConditionStatus::False,
            last_transition_time: "2024-01-01T00:00:00Z".to_string(),
            reason: REASON_CONSUL_AGENT_ERROR.to_string(),
            message: "first".to_string(),
        }];

        set_condition(
            &mut conditions,
            CONDITION_SYNCED,
            ConditionStatus::False,
            REASON_EXTERNALLY_MANAGED,
            "second",
        );

        assert_eq!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
        assert_eq!(conditions[0].reason, REASON_EXTERNALLY_MANAGED);
        assert_eq!(conditions[0].message, "second");
    }

    #[test]
    fn test_missing_condition_is_unknown() {
        assert_eq!(
            condition_status(&[], CONDITION_SYNCED),
            ConditionStatus::Unknown
        );
        assert!(!is_condition_true(&[], CONDITION_SYNCED));
    }
}
