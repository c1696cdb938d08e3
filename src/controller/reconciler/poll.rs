//! # Operation Poller
//!
//! Follows a remote long-running operation until it reaches a final state.

use super::delete;
use super::engine::persist;
use super::resource::Reconcilable;
use super::types::{Reconciler, ReconcilerError};
use crate::crd::OperationType;
use crate::observability::metrics;
use crate::sm::{Operation, OperationState, ServiceManagerClient};
use kube::runtime::controller::Action;
use tracing::{debug, error, info, warn};

/// Check the stored operation once
///
/// When the status cannot be read, the operation reference is dropped and
/// the remote ID kept, so the next reconcile recovers the remote state from
/// the object's last operation instead of retrying a dead URL.
pub async fn poll<R: Reconcilable>(
    obj: &mut R,
    ctx: &Reconciler,
    client: &dyn ServiceManagerClient,
) -> Result<Action, ReconcilerError> {
    let Some((url, op)) = obj.operation() else {
        return Ok(Action::await_change());
    };
    match client.status(&url).await {
        Ok(operation) => {
            metrics::record_remote_operation("status", "success");
            apply_operation(obj, ctx, client, op, &url, &operation).await
        }
        Err(e) => {
            metrics::record_remote_operation("status", "error");
            let message = format!("failed to get the status of the {op} operation: {e}");
            warn!(url = %url, "{}", message);
            obj.set_operation(None);
            obj.set_in_progress(Some(op), &message);
            persist(obj, ctx).await?;
            Err(ReconcilerError::Transient {
                message,
                retry_after: e.retry_after(),
            })
        }
    }
}

/// Act on the state of a remote operation
pub(crate) async fn apply_operation<R: Reconcilable>(
    obj: &mut R,
    ctx: &Reconciler,
    client: &dyn ServiceManagerClient,
    op: OperationType,
    url: &str,
    operation: &Operation,
) -> Result<Action, ReconcilerError> {
    match operation.state {
        OperationState::Pending | OperationState::InProgress => {
            debug!(operation = %op, url = %url, "{} operation still running", obj.kind_name());
            obj.set_operation(Some((url.to_string(), op)));
            obj.set_in_progress(
                Some(op),
                operation.description.as_deref().unwrap_or_default(),
            );
            persist(obj, ctx).await?;
            metrics::increment_requeues_total("operation-pending");
            Ok(Action::requeue(ctx.config.poll_interval()))
        }
        OperationState::Failed => {
            let details = operation.error_text();
            let message = if details.is_empty() {
                format!("{} {} operation failed", obj.kind_name(), op)
            } else {
                details
            };
            error!(operation = %op, error = %message, "{} operation failed", obj.kind_name());
            obj.set_operation(None);
            obj.set_failure(Some(op), &message);
            obj.set_observed_generation(obj.generation());
            persist(obj, ctx).await?;
            if op == OperationType::Delete {
                return Err(ReconcilerError::DeleteFailed(message));
            }
            Ok(Action::await_change())
        }
        OperationState::Succeeded => {
            info!(operation = %op, "{} operation finished", obj.kind_name());
            obj.set_operation(None);
            match op {
                OperationType::Delete => delete::finish_delete(obj, ctx, client).await,
                OperationType::Create | OperationType::Update => {
                    obj.finish(ctx, client, op).await
                }
            }
        }
    }
}

/// Operation reference on an in-flight remote object found by recovery
pub(crate) fn operation_url<R: Reconcilable>(resource_id: &str, operation_id: &str) -> String {
    format!(
        "/v1/{}/{}/operations/{}",
        R::COLLECTION,
        resource_id,
        operation_id
    )
}

