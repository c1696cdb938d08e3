//! # State Model
//!
//! Explicit lifecycle state of a resource and the pure planning functions
//! that decide what a reconcile does next.
//!
//! Nothing here performs I/O: the engine gathers an [`Observation`], asks
//! [`plan`] for a [`Step`], and executes it. Deletion is its own small state
//! machine ([`DeletePhase`]) so every step of it can be retried in isolation.

use crate::controller::conditions::{self, reasons, Conditioned};

/// Lifecycle state derived from conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Uninitialized,
    Pending,
    Blocked,
    InProgress,
    Ready,
    Failed,
    Deleting,
}

impl ResourceState {
    #[must_use]
    pub fn of<R: Conditioned>(resource: &R, deleting: bool) -> Self {
        if deleting {
            return ResourceState::Deleting;
        }
        let conds = resource.conditions();
        let Some(succeeded) = conditions::find(conds, conditions::SUCCEEDED) else {
            return ResourceState::Uninitialized;
        };
        if conditions::is_true(conds, conditions::FAILED) {
            return ResourceState::Failed;
        }
        match succeeded.reason() {
            reasons::BLOCKED => ResourceState::Blocked,
            reasons::PENDING => ResourceState::Pending,
            _ if succeeded.is_true() && resource.ready_flag() => ResourceState::Ready,
            _ => ResourceState::InProgress,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::Uninitialized => "uninitialized",
            ResourceState::Pending => "pending",
            ResourceState::Blocked => "blocked",
            ResourceState::InProgress => "in-progress",
            ResourceState::Ready => "ready",
            ResourceState::Failed => "failed",
            ResourceState::Deleting => "deleting",
        }
    }
}

/// Facts about a resource the planner decides on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Observation {
    pub initialized: bool,
    pub has_operation: bool,
    pub deleting: bool,
    pub has_finalizer: bool,
    pub has_remote_id: bool,
    pub ready: bool,
    pub in_progress: bool,
    /// `status.observedGeneration == metadata.generation`
    pub generation_observed: bool,
    /// The spec content is unchanged since the last remote write
    pub spec_unchanged: bool,
}

/// What a reconcile does next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Set initial conditions and the finalizer, then wait for the next event
    Initialize,
    /// Check the ongoing remote operation
    Poll,
    /// Run the deletion state machine
    Delete,
    /// Deletion in progress but our finalizer is gone: nothing left to do
    Released,
    /// Nothing changed; `bump_generation` when only metadata moved
    Idle { bump_generation: bool },
    /// Look for an existing remote object, create one if none
    Recover,
    /// Push the changed spec to the remote object
    Update,
}

/// Decide the next step; the binding dependency gate runs before
/// `Idle`, `Recover` and `Update`
#[must_use]
pub fn plan(obs: &Observation) -> Step {
    if !obs.initialized && !obs.deleting {
        return Step::Initialize;
    }
    if obs.has_operation {
        return Step::Poll;
    }
    if obs.deleting {
        return if obs.has_finalizer {
            Step::Delete
        } else {
            Step::Released
        };
    }
    if !obs.in_progress && (obs.generation_observed || obs.spec_unchanged) {
        return Step::Idle {
            bump_generation: !obs.generation_observed,
        };
    }
    if !obs.has_remote_id || (!obs.ready && obs.in_progress) {
        return Step::Recover;
    }
    Step::Update
}

/// Steps of finalizer-guarded deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePhase {
    DeletePending,
    /// No remote ID: make sure no orphaned remote object exists
    RecoveryCheck,
    RemoteDeleteRequested,
    CleanupSecret,
    FinalizerRemoved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteEvent {
    Started { has_remote_id: bool },
    RecoveryFound,
    RecoveryNotFound,
    /// Remote delete finished synchronously (or the object was already gone)
    RemoteDeleted,
    /// Remote delete accepted as a long-running operation
    RemoteAccepted,
    SecretCleaned,
}

impl DeletePhase {
    /// Transition on an event; events that do not apply leave the phase unchanged
    #[must_use]
    pub fn next(self, event: DeleteEvent) -> Self {
        use DeleteEvent::*;
        use DeletePhase::*;
        match (self, event) {
            (DeletePending, Started { has_remote_id: true }) => RemoteDeleteRequested,
            (DeletePending, Started { has_remote_id: false }) => RecoveryCheck,
            (RecoveryCheck, RecoveryFound) => RemoteDeleteRequested,
            (RecoveryCheck, RecoveryNotFound) => CleanupSecret,
            (RemoteDeleteRequested, RemoteDeleted) => CleanupSecret,
            (RemoteDeleteRequested, RemoteAccepted) => RemoteDeleteRequested,
            (CleanupSecret, SecretCleaned) => FinalizerRemoved,
            (phase, _) => phase,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletePhase::DeletePending => "delete-pending",
            DeletePhase::RecoveryCheck => "recovery-check",
            DeletePhase::RemoteDeleteRequested => "remote-delete-requested",
            DeletePhase::CleanupSecret => "cleanup-secret",
            DeletePhase::FinalizerRemoved => "finalizer-removed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settled() -> Observation {
        Observation {
            initialized: true,
            has_finalizer: true,
            has_remote_id: true,
            ready: true,
            generation_observed: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_plan_order() {
        assert_eq!(plan(&Observation::default()), Step::Initialize);

        let polling = Observation {
            has_operation: true,
            deleting: true,
            ..settled()
        };
        assert_eq!(plan(&polling), Step::Poll);

        let deleting = Observation {
            deleting: true,
            ..settled()
        };
        assert_eq!(plan(&deleting), Step::Delete);

        let released = Observation {
            has_finalizer: false,
            ..deleting
        };
        assert_eq!(plan(&released), Step::Released);
    }

    #[test]
    fn test_plan_idle_and_metadata_only_change() {
        assert_eq!(
            plan(&settled()),
            Step::Idle {
                bump_generation: false
            }
        );
        let metadata_only = Observation {
            generation_observed: false,
            spec_unchanged: true,
            ..settled()
        };
        assert_eq!(
            plan(&metadata_only),
            Step::Idle {
                bump_generation: true
            }
        );
        let changed = Observation {
            generation_observed: false,
            ..settled()
        };
        assert_eq!(plan(&changed), Step::Update);
    }

    #[test]
    fn test_plan_recovers_without_remote_id_or_after_lost_operation() {
        let fresh = Observation {
            initialized: true,
            has_finalizer: true,
            in_progress: true,
            ..Default::default()
        };
        assert_eq!(plan(&fresh), Step::Recover);

        let lost_operation = Observation {
            has_remote_id: true,
            ..fresh
        };
        assert_eq!(plan(&lost_operation), Step::Recover);
    }

    #[test]
    fn test_delete_phases() {
        let phase = DeletePhase::DeletePending.next(DeleteEvent::Started {
            has_remote_id: false,
        });
        assert_eq!(phase, DeletePhase::RecoveryCheck);
        assert_eq!(
            phase.next(DeleteEvent::RecoveryFound),
            DeletePhase::RemoteDeleteRequested
        );
        assert_eq!(
            phase.next(DeleteEvent::RecoveryNotFound),
            DeletePhase::CleanupSecret
        );

        let requested = DeletePhase::RemoteDeleteRequested;
        assert_eq!(requested.next(DeleteEvent::RemoteAccepted), requested);
        assert_eq!(
            requested
                .next(DeleteEvent::RemoteDeleted)
                .next(DeleteEvent::SecretCleaned),
            DeletePhase::FinalizerRemoved
        );
    }

    #[test]
    fn test_delete_phase_ignores_out_of_order_events() {
        assert_eq!(
            DeletePhase::CleanupSecret.next(DeleteEvent::RecoveryFound),
            DeletePhase::CleanupSecret
        );
        assert_eq!(
            DeletePhase::FinalizerRemoved.next(DeleteEvent::SecretCleaned),
            DeletePhase::FinalizerRemoved
        );
    }
}
