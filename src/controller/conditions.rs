//! # Condition Model
//!
//! Typed status predicates layered onto a resource's condition list.
//!
//! Every setter rewrites conditions by type and then recomputes `Ready`.
//! `Ready` is `True` only while the resource is ready and its last
//! operation succeeded, so at any time exactly one of `Ready=True`,
//! `Failed=True` or "in progress" holds.
//!
//! Reasons are a function of the operation type and its outcome:
//!
//! | Outcome     | create              | update              | delete              |
//! |-------------|---------------------|---------------------|---------------------|
//! | in progress | `CreateInProgress`  | `UpdateInProgress`  | `DeleteInProgress`  |
//! | succeeded   | `Created`           | `Updated`           | `Deleted`           |
//! | failed      | `CreateFailed`      | `UpdateFailed`      | `DeleteFailed`      |

use crate::crd::{Condition, OperationType};

pub const SUCCEEDED: &str = "Succeeded";
pub const FAILED: &str = "Failed";
pub const READY: &str = "Ready";
pub const SHARED: &str = "Shared";
pub const CRED_ROTATION_IN_PROGRESS: &str = "CredRotationInProgress";
pub const PENDING_TERMINATION: &str = "PendingTermination";

const TRUE: &str = "True";
const FALSE: &str = "False";

/// Condition reasons
pub mod reasons {
    pub const CREATED: &str = "Created";
    pub const UPDATED: &str = "Updated";
    pub const DELETED: &str = "Deleted";
    pub const FINISHED: &str = "Finished";
    pub const CREATE_IN_PROGRESS: &str = "CreateInProgress";
    pub const UPDATE_IN_PROGRESS: &str = "UpdateInProgress";
    pub const DELETE_IN_PROGRESS: &str = "DeleteInProgress";
    pub const IN_PROGRESS: &str = "InProgress";
    pub const CREATE_FAILED: &str = "CreateFailed";
    pub const UPDATE_FAILED: &str = "UpdateFailed";
    pub const DELETE_FAILED: &str = "DeleteFailed";
    pub const FAILED: &str = "Failed";
    pub const BLOCKED: &str = "Blocked";
    pub const PENDING: &str = "Pending";
    pub const PROVISIONED: &str = "Provisioned";
    pub const NOT_PROVISIONED: &str = "NotProvisioned";
    pub const SHARE_SUCCEEDED: &str = "ShareSucceeded";
    pub const UNSHARE_SUCCEEDED: &str = "UnshareSucceeded";
    pub const SHARE_FAILED: &str = "ShareFailed";
    pub const UNSHARE_FAILED: &str = "UnshareFailed";
    pub const CRED_ROTATING: &str = "CredRotating";
}

/// Outcome of an operation, as far as conditions are concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    InProgress,
    Succeeded,
    Failed,
}

/// Reason for an operation type and outcome
#[must_use]
pub fn reason_for(op: Option<OperationType>, outcome: Outcome) -> &'static str {
    use reasons::*;
    match (op, outcome) {
        (Some(OperationType::Create), Outcome::InProgress) => CREATE_IN_PROGRESS,
        (Some(OperationType::Update), Outcome::InProgress) => UPDATE_IN_PROGRESS,
        (Some(OperationType::Delete), Outcome::InProgress) => DELETE_IN_PROGRESS,
        (None, Outcome::InProgress) => IN_PROGRESS,
        (Some(OperationType::Create), Outcome::Succeeded) => CREATED,
        (Some(OperationType::Update), Outcome::Succeeded) => UPDATED,
        (Some(OperationType::Delete), Outcome::Succeeded) => DELETED,
        (None, Outcome::Succeeded) => FINISHED,
        (Some(OperationType::Create), Outcome::Failed) => CREATE_FAILED,
        (Some(OperationType::Update), Outcome::Failed) => UPDATE_FAILED,
        (Some(OperationType::Delete), Outcome::Failed) => DELETE_FAILED,
        (None, Outcome::Failed) => reasons::FAILED,
    }
}

/// Find a condition by type
#[must_use]
pub fn find<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.r#type == condition_type)
}

#[must_use]
pub fn is_true(conditions: &[Condition], condition_type: &str) -> bool {
    find(conditions, condition_type).is_some_and(Condition::is_true)
}

/// Set a condition, replacing any of the same type
///
/// The transition time is kept when the status does not change.
pub fn set(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions
        .iter_mut()
        .find(|c| c.r#type == condition.r#type)
    {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.take();
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

pub fn remove(conditions: &mut Vec<Condition>, condition_type: &str) {
    conditions.retain(|c| c.r#type != condition_type);
}

fn condition(
    condition_type: &str,
    status: bool,
    reason: &str,
    message: impl Into<String>,
    generation: i64,
) -> Condition {
    Condition {
        r#type: condition_type.to_string(),
        status: if status { TRUE } else { FALSE }.to_string(),
        last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
        reason: Some(reason.to_string()),
        message: Some(message.into()),
        observed_generation: Some(generation),
    }
}

fn verb(op: Option<OperationType>) -> &'static str {
    match op {
        Some(OperationType::Create) | None => "created",
        Some(OperationType::Update) => "updated",
        Some(OperationType::Delete) => "deleted",
    }
}

/// Condition capability shared by both resource kinds
pub trait Conditioned {
    /// Kind name used in messages (`ServiceInstance`, `ServiceBinding`)
    fn kind_name(&self) -> &'static str;

    fn generation(&self) -> i64;

    fn conditions(&self) -> &[Condition];

    fn conditions_mut(&mut self) -> &mut Vec<Condition>;

    /// Remote object exists and is usable
    fn ready_flag(&self) -> bool;

    fn set_ready_flag(&mut self, ready: bool);

    /// Recompute `Ready` from the ready flag and the last operation outcome
    fn refresh_ready(&mut self) {
        let generation = self.generation();
        let ready = self.ready_flag() && is_true(self.conditions(), SUCCEEDED);
        let (reason, message) = if ready {
            (reasons::PROVISIONED, format!("{} is ready", self.kind_name()))
        } else {
            (
                reasons::NOT_PROVISIONED,
                format!("{} is not ready", self.kind_name()),
            )
        };
        set(
            self.conditions_mut(),
            condition(READY, ready, reason, message, generation),
        );
    }

    /// First observation: `Succeeded=False/Pending`
    fn init_conditions(&mut self) {
        let generation = self.generation();
        let conditions = self.conditions_mut();
        conditions.clear();
        set(
            conditions,
            condition(SUCCEEDED, false, reasons::PENDING, "", generation),
        );
        self.refresh_ready();
    }

    fn set_in_progress(&mut self, op: Option<OperationType>, message: &str) {
        let generation = self.generation();
        let message = if message.is_empty() {
            format!("{} is being {}", self.kind_name(), verb(op))
        } else {
            message.to_string()
        };
        let conditions = self.conditions_mut();
        remove(conditions, FAILED);
        set(
            conditions,
            condition(
                SUCCEEDED,
                false,
                reason_for(op, Outcome::InProgress),
                message,
                generation,
            ),
        );
        self.refresh_ready();
    }

    fn set_success(&mut self, op: Option<OperationType>) {
        let generation = self.generation();
        let message = match op {
            Some(OperationType::Create) | None => {
                format!("{} provisioned successfully", self.kind_name())
            }
            Some(OperationType::Update) => format!("{} updated successfully", self.kind_name()),
            Some(OperationType::Delete) => format!("{} deleted successfully", self.kind_name()),
        };
        if matches!(op, Some(OperationType::Create) | Some(OperationType::Update)) {
            self.set_ready_flag(true);
        }
        let conditions = self.conditions_mut();
        remove(conditions, FAILED);
        set(
            conditions,
            condition(
                SUCCEEDED,
                true,
                reason_for(op, Outcome::Succeeded),
                message,
                generation,
            ),
        );
        self.refresh_ready();
    }

    fn set_failure(&mut self, op: Option<OperationType>, message: &str) {
        let generation = self.generation();
        let reason = reason_for(op, Outcome::Failed);
        let conditions = self.conditions_mut();
        set(
            conditions,
            condition(SUCCEEDED, false, reason, message, generation),
        );
        set(conditions, condition(FAILED, true, reason, message, generation));
        self.refresh_ready();
    }

    /// In progress, waiting on something the user can fix
    fn set_blocked(&mut self, message: &str) {
        let generation = self.generation();
        let conditions = self.conditions_mut();
        remove(conditions, FAILED);
        set(
            conditions,
            condition(SUCCEEDED, false, reasons::BLOCKED, message, generation),
        );
        self.refresh_ready();
    }

    fn set_cred_rotation_in_progress(&mut self, reason: &str, message: &str) {
        let generation = self.generation();
        set(
            self.conditions_mut(),
            condition(CRED_ROTATION_IN_PROGRESS, true, reason, message, generation),
        );
    }

    fn set_shared(&mut self, shared: bool, reason: &str, message: &str) {
        let generation = self.generation();
        set(
            self.conditions_mut(),
            condition(SHARED, shared, reason, message, generation),
        );
    }

    fn set_pending_termination(&mut self, message: &str) {
        let generation = self.generation();
        set(
            self.conditions_mut(),
            condition(PENDING_TERMINATION, true, PENDING_TERMINATION, message, generation),
        );
    }

    /// `Succeeded=False` without `Failed=True`
    fn is_in_progress(&self) -> bool {
        let conditions = self.conditions();
        find(conditions, SUCCEEDED).is_some_and(|c| !c.is_true())
            && !is_true(conditions, FAILED)
    }

    /// `Failed=True`, or `Succeeded=False` with reason `Blocked`
    fn is_failed(&self) -> bool {
        let conditions = self.conditions();
        is_true(conditions, FAILED)
            || find(conditions, SUCCEEDED)
                .is_some_and(|c| !c.is_true() && c.reason() == reasons::BLOCKED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Subject {
        conditions: Vec<Condition>,
        ready: bool,
    }

    impl Conditioned for Subject {
        fn kind_name(&self) -> &'static str {
            "ServiceInstance"
        }
        fn generation(&self) -> i64 {
            2
        }
        fn conditions(&self) -> &[Condition] {
            &self.conditions
        }
        fn conditions_mut(&mut self) -> &mut Vec<Condition> {
            &mut self.conditions
        }
        fn ready_flag(&self) -> bool {
            self.ready
        }
        fn set_ready_flag(&mut self, ready: bool) {
            self.ready = ready;
        }
    }

    fn exactly_one_state(s: &Subject) -> bool {
        let states = [
            is_true(&s.conditions, READY),
            is_true(&s.conditions, FAILED),
            s.is_in_progress(),
        ];
        states.iter().filter(|b| **b).count() == 1
    }

    #[test]
    fn test_reason_table() {
        assert_eq!(
            reason_for(Some(OperationType::Create), Outcome::Succeeded),
            "Created"
        );
        assert_eq!(
            reason_for(Some(OperationType::Update), Outcome::InProgress),
            "UpdateInProgress"
        );
        assert_eq!(
            reason_for(Some(OperationType::Delete), Outcome::Failed),
            "DeleteFailed"
        );
        assert_eq!(reason_for(None, Outcome::Succeeded), "Finished");
    }

    #[test]
    fn test_init_is_pending() {
        let mut s = Subject::default();
        s.init_conditions();
        let succeeded = find(&s.conditions, SUCCEEDED).unwrap();
        assert_eq!(succeeded.status, "False");
        assert_eq!(succeeded.reason(), "Pending");
        assert!(s.is_in_progress());
        assert!(exactly_one_state(&s));
    }

    #[test]
    fn test_success_then_failure_keeps_one_state() {
        let mut s = Subject::default();
        s.set_in_progress(Some(OperationType::Create), "");
        assert_eq!(
            find(&s.conditions, SUCCEEDED).unwrap().message.as_deref(),
            Some("ServiceInstance is being created")
        );
        assert!(exactly_one_state(&s));

        s.set_success(Some(OperationType::Create));
        assert!(s.ready);
        assert!(is_true(&s.conditions, READY));
        assert!(exactly_one_state(&s));

        s.set_failure(Some(OperationType::Update), "bad plan");
        assert!(s.is_failed());
        assert!(!is_true(&s.conditions, READY));
        assert_eq!(find(&s.conditions, FAILED).unwrap().reason(), "UpdateFailed");
        assert!(exactly_one_state(&s));

        s.set_in_progress(Some(OperationType::Update), "");
        assert!(find(&s.conditions, FAILED).is_none());
        assert!(exactly_one_state(&s));
    }

    #[test]
    fn test_blocked_is_failed_and_in_progress() {
        let mut s = Subject::default();
        s.set_blocked("secret is owned by binding other");
        assert!(s.is_failed());
        assert!(s.is_in_progress());
        assert_eq!(find(&s.conditions, SUCCEEDED).unwrap().reason(), "Blocked");
    }

    #[test]
    fn test_transition_time_kept_when_status_unchanged() {
        let mut s = Subject::default();
        s.set_in_progress(Some(OperationType::Create), "");
        let first = find(&s.conditions, SUCCEEDED)
            .unwrap()
            .last_transition_time
            .clone();
        s.conditions[0].last_transition_time = Some("2020-01-01T00:00:00+00:00".to_string());
        s.set_in_progress(Some(OperationType::Create), "still going");
        let after = find(&s.conditions, SUCCEEDED).unwrap();
        assert!(first.is_some());
        assert_eq!(
            after.last_transition_time.as_deref(),
            Some("2020-01-01T00:00:00+00:00")
        );
        assert_eq!(after.message.as_deref(), Some("still going"));
    }
}
