//! # Reconcilable Resources
//!
//! The seam between the shared reconcile engine and the two resource
//! kinds. The engine drives initialization, polling, recovery and deletion;
//! each kind supplies its remote calls through [`Reconcilable`].

use super::types::{Reconciler, ReconcilerError};
use crate::controller::conditions::Conditioned;
use crate::crd::{
    Condition, OperationType, ServiceBinding, ServiceBindingStatus, ServiceInstance,
    ServiceInstanceStatus,
};
use crate::sm::{Operation, Outcome, ServiceManagerClient, SmError};
use crate::store::{ObjectStore, StoredObject};
use async_trait::async_trait;
use kube::runtime::controller::Action;
use std::sync::Arc;
use std::time::Duration;

/// Result of the pre-flight dependency check
#[derive(Debug)]
pub enum Gate {
    Proceed,
    /// Stop this reconcile and return the action
    Stop(Action),
}

/// A remote object matching a resource's correlation keys
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteMatch {
    pub id: String,
    pub ready: bool,
    pub last_operation: Option<Operation>,
}

/// A resource kind the engine can reconcile
#[async_trait]
pub trait Reconcilable: Conditioned + StoredObject {
    /// Remote collection, used to address operations found during recovery
    const COLLECTION: &'static str;
    /// Name of the remote delete call, for metrics
    const REMOTE_DELETE: &'static str;

    fn store(ctx: &Reconciler) -> Arc<dyn ObjectStore<Self>>;

    fn remote_id(&self) -> Option<&str>;
    fn set_remote_id(&mut self, id: Option<String>);

    /// Ongoing remote operation: URL and type
    fn operation(&self) -> Option<(String, OperationType)>;
    fn set_operation(&mut self, operation: Option<(String, OperationType)>);

    fn observed_generation(&self) -> i64;
    fn set_observed_generation(&mut self, generation: i64);

    /// Whether the spec content is unchanged since the last remote write
    fn spec_unchanged(&self) -> bool {
        false
    }

    /// Remember the spec content a remote write was made with
    fn record_spec(&mut self) {}

    /// Dependency check before recovery, update and idle maintenance
    async fn gate(&mut self, _ctx: &Reconciler) -> Result<Gate, ReconcilerError> {
        Ok(Gate::Proceed)
    }

    /// Remote objects matching this resource's correlation keys
    async fn find_remote(
        &self,
        ctx: &Reconciler,
        client: &dyn ServiceManagerClient,
    ) -> Result<Vec<RemoteMatch>, SmError>;

    async fn create(
        &mut self,
        ctx: &Reconciler,
        client: &dyn ServiceManagerClient,
    ) -> Result<Action, ReconcilerError>;

    async fn update(
        &mut self,
        ctx: &Reconciler,
        client: &dyn ServiceManagerClient,
    ) -> Result<Action, ReconcilerError>;

    /// Complete a create or update whose remote operation succeeded
    async fn finish(
        &mut self,
        ctx: &Reconciler,
        client: &dyn ServiceManagerClient,
        op: OperationType,
    ) -> Result<Action, ReconcilerError>;

    async fn delete_remote(
        &self,
        client: &dyn ServiceManagerClient,
        id: &str,
    ) -> Result<Outcome<()>, SmError>;

    /// Local cleanup after the remote object is gone
    async fn cleanup(&mut self, _ctx: &Reconciler) -> Result<(), ReconcilerError> {
        Ok(())
    }

    /// Periodic work on a settled resource; `Some` ends the reconcile with that action
    async fn maintain(&mut self, _ctx: &Reconciler) -> Result<Option<Action>, ReconcilerError> {
        Ok(None)
    }

    /// When a settled resource has time-based work pending
    fn resync_after(&self, _ctx: &Reconciler) -> Option<Duration> {
        None
    }
}

macro_rules! impl_conditioned {
    ($kind:ty, $name:literal) => {
        impl Conditioned for $kind {
            fn kind_name(&self) -> &'static str {
                $name
            }

            fn generation(&self) -> i64 {
                self.metadata.generation.unwrap_or_default()
            }

            fn conditions(&self) -> &[Condition] {
                self.status
                    .as_ref()
                    .map(|s| s.conditions.as_slice())
                    .unwrap_or_default()
            }

            fn conditions_mut(&mut self) -> &mut Vec<Condition> {
                &mut self.status.get_or_insert_with(Default::default).conditions
            }

            fn ready_flag(&self) -> bool {
                self.status.as_ref().is_some_and(|s| s.ready)
            }

            fn set_ready_flag(&mut self, ready: bool) {
                self.status.get_or_insert_with(Default::default).ready = ready;
            }
        }
    };
}

impl_conditioned!(ServiceInstance, "ServiceInstance");
impl_conditioned!(ServiceBinding, "ServiceBinding");

impl ServiceInstance {
    pub(crate) fn status_mut(&mut self) -> &mut ServiceInstanceStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

impl ServiceBinding {
    pub(crate) fn status_mut(&mut self) -> &mut ServiceBindingStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

/// Operation reference stored in a status
pub(crate) fn stored_operation(
    url: Option<&String>,
    op: Option<OperationType>,
) -> Option<(String, OperationType)> {
    match (url, op) {
        (Some(url), Some(op)) if !url.is_empty() => Some((url.clone(), op)),
        _ => None,
    }
}
