//! # Deletion
//!
//! Runs the [`DeletePhase`] machine for a resource marked for deletion.
//! The finalizer is removed only after the remote object is gone and the
//! binding secret (if any) is cleaned up.

use super::engine::{self, remove_finalizer};
use super::recovery;
use super::resource::Reconcilable;
use super::types::{Reconciler, ReconcilerError};
use crate::controller::state::{DeleteEvent, DeletePhase};
use crate::crd::OperationType;
use crate::observability::metrics;
use crate::sm::{Outcome, ServiceManagerClient};
use kube::runtime::controller::Action;
use tracing::{debug, info};

pub async fn delete<R: Reconcilable>(
    obj: &mut R,
    ctx: &Reconciler,
    client: &dyn ServiceManagerClient,
) -> Result<Action, ReconcilerError> {
    run(obj, ctx, client, DeletePhase::DeletePending).await
}

/// Continue after the remote delete operation succeeded
pub(crate) async fn finish_delete<R: Reconcilable>(
    obj: &mut R,
    ctx: &Reconciler,
    client: &dyn ServiceManagerClient,
) -> Result<Action, ReconcilerError> {
    let phase = DeletePhase::RemoteDeleteRequested.next(DeleteEvent::RemoteDeleted);
    run(obj, ctx, client, phase).await
}

async fn run<R: Reconcilable>(
    obj: &mut R,
    ctx: &Reconciler,
    client: &dyn ServiceManagerClient,
    mut phase: DeletePhase,
) -> Result<Action, ReconcilerError> {
    loop {
        debug!(phase = phase.as_str(), "deleting {}", obj.kind_name());
        phase = match phase {
            DeletePhase::DeletePending => phase.next(DeleteEvent::Started {
                has_remote_id: obj.remote_id().is_some(),
            }),
            DeletePhase::RecoveryCheck => match recovery::find_unique(obj, ctx, client).await {
                Ok(Some(found)) => {
                    info!(remote_id = %found.id, "found remote object of deleted {}", obj.kind_name());
                    obj.set_remote_id(Some(found.id));
                    phase.next(DeleteEvent::RecoveryFound)
                }
                Ok(None) => phase.next(DeleteEvent::RecoveryNotFound),
                Err(e) => {
                    return engine::remote_failure(obj, ctx, OperationType::Delete, "list", e)
                        .await
                }
            },
            DeletePhase::RemoteDeleteRequested => {
                let id = obj.remote_id().unwrap_or_default().to_string();
                info!(remote_id = %id, "deleting remote {}", obj.kind_name());
                match obj.delete_remote(client, &id).await {
                    Ok(Outcome::Done(())) => {
                        metrics::record_remote_operation(R::REMOTE_DELETE, "success");
                        phase.next(DeleteEvent::RemoteDeleted)
                    }
                    Ok(Outcome::Accepted { operation_url, .. }) => {
                        metrics::record_remote_operation(R::REMOTE_DELETE, "accepted");
                        return engine::accepted(obj, ctx, OperationType::Delete, None, operation_url)
                            .await;
                    }
                    Err(e) => {
                        return engine::remote_failure(
                            obj,
                            ctx,
                            OperationType::Delete,
                            R::REMOTE_DELETE,
                            e,
                        )
                        .await
                    }
                }
            }
            DeletePhase::CleanupSecret => {
                obj.cleanup(ctx).await?;
                phase.next(DeleteEvent::SecretCleaned)
            }
            DeletePhase::FinalizerRemoved => {
                remove_finalizer(obj, ctx).await?;
                info!("{} deleted", obj.kind_name());
                return Ok(Action::await_change());
            }
        };
    }
}
