//! # Reconcile Engine
//!
//! Drives one resource through the planned [`Step`]. Kind specific work
//! happens behind [`Reconcilable`]; this module owns finalizers, status
//! writes, and the bookkeeping that follows a remote call.
//!
//! Every status write carries the object's `resourceVersion`. A write
//! conflict aborts the attempt; [`reconcile`] re-reads the object and starts
//! over, up to `conflict_retries` times.

use super::classify::is_transient;
use super::delete;
use super::poll;
use super::recovery;
use super::resource::{Gate, Reconcilable};
use super::types::{Reconciler, ReconcilerError};
use crate::constants::FINALIZER;
use crate::controller::conditions::{self, reasons};
use crate::controller::state::{plan, Observation, ResourceState, Step};
use crate::crd::OperationType;
use crate::observability::metrics;
use crate::sm::SmError;
use kube::runtime::controller::Action;
use kube::Resource;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Reconcile one resource, retrying after write conflicts
pub async fn reconcile<R: Reconcilable>(
    obj: Arc<R>,
    ctx: Arc<Reconciler>,
) -> Result<Action, ReconcilerError> {
    let start = Instant::now();
    let kind = obj.kind_name();
    let name = obj.meta().name.clone().unwrap_or_default();
    let namespace = obj.meta().namespace.clone().unwrap_or_default();
    let span = info_span!(
        "reconcile",
        resource.kind = kind,
        resource.name = %name,
        resource.namespace = %namespace,
        resource.generation = obj.generation(),
    );

    async move {
        metrics::increment_reconciliations(kind);
        let mut current = (*obj).clone();
        let mut conflicts = 0;
        let result = loop {
            match reconcile_once(current, &ctx).await {
                Err(e) if e.is_conflict() && conflicts < ctx.config.conflict_retries => {
                    conflicts += 1;
                    debug!(attempt = conflicts, "write conflict, re-reading {}", kind);
                    match R::store(&ctx).get(&namespace, &name).await {
                        Ok(Some(latest)) => current = latest,
                        Ok(None) => break Ok(Action::await_change()),
                        Err(e) => break Err(e.into()),
                    }
                }
                other => break other,
            }
        };
        metrics::observe_reconciliation_duration(kind, start.elapsed().as_secs_f64());
        if result.is_ok() {
            ctx.reset_backoff(&format!("{kind}/{namespace}/{name}"));
        }
        result
    }
    .instrument(span)
    .await
}

fn observe<R: Reconcilable>(obj: &R) -> Observation {
    let meta = obj.meta();
    Observation {
        initialized: conditions::find(obj.conditions(), conditions::SUCCEEDED).is_some(),
        has_operation: obj.operation().is_some(),
        deleting: meta.deletion_timestamp.is_some(),
        has_finalizer: has_finalizer(obj),
        has_remote_id: obj.remote_id().is_some(),
        ready: obj.ready_flag(),
        in_progress: obj.is_in_progress(),
        generation_observed: obj.observed_generation() == obj.generation(),
        spec_unchanged: obj.spec_unchanged(),
    }
}

fn has_finalizer<R: Reconcilable>(obj: &R) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|f| f == FINALIZER))
}

async fn reconcile_once<R: Reconcilable>(
    mut obj: R,
    ctx: &Reconciler,
) -> Result<Action, ReconcilerError> {
    let observation = observe(&obj);
    let step = plan(&observation);
    debug!(
        state = ResourceState::of(&obj, observation.deleting).as_str(),
        ?step,
        "planned reconcile step"
    );

    let namespace = obj.meta().namespace.clone().unwrap_or_default();
    match step {
        Step::Initialize => initialize(&mut obj, ctx).await,
        Step::Released => Ok(Action::await_change()),
        Step::Poll => {
            let client = ctx.client_for(&namespace).await?;
            poll::poll(&mut obj, ctx, client.as_ref()).await
        }
        Step::Delete => {
            let client = ctx.client_for(&namespace).await?;
            delete::delete(&mut obj, ctx, client.as_ref()).await
        }
        Step::Idle { bump_generation } => {
            if let Gate::Stop(action) = obj.gate(ctx).await? {
                return Ok(action);
            }
            idle(&mut obj, ctx, bump_generation).await
        }
        Step::Recover => {
            if let Gate::Stop(action) = obj.gate(ctx).await? {
                return Ok(action);
            }
            let client = ctx.client_for(&namespace).await?;
            recovery::recover(&mut obj, ctx, client.as_ref()).await
        }
        Step::Update => {
            if let Gate::Stop(action) = obj.gate(ctx).await? {
                return Ok(action);
            }
            let client = ctx.client_for(&namespace).await?;
            info!("spec changed, updating {}", obj.kind_name());
            obj.update(ctx, client.as_ref()).await
        }
    }
}

async fn initialize<R: Reconcilable>(obj: &mut R, ctx: &Reconciler) -> Result<Action, ReconcilerError> {
    info!("initializing {}", obj.kind_name());
    if !has_finalizer(obj) {
        let mut finalizers = obj.meta().finalizers.clone().unwrap_or_default();
        finalizers.push(FINALIZER.to_string());
        *obj = R::store(ctx)
            .patch_metadata(obj, serde_json::json!({ "finalizers": finalizers }))
            .await?;
    }
    obj.init_conditions();
    persist(obj, ctx).await?;
    Ok(Action::await_change())
}

async fn idle<R: Reconcilable>(
    obj: &mut R,
    ctx: &Reconciler,
    bump_generation: bool,
) -> Result<Action, ReconcilerError> {
    if let Some(action) = obj.maintain(ctx).await? {
        return Ok(action);
    }
    if bump_generation {
        debug!("metadata-only change, marking generation observed");
        obj.set_observed_generation(obj.generation());
        persist(obj, ctx).await?;
    }
    match obj.resync_after(ctx) {
        Some(delay) => {
            debug!(delay = ?delay, "scheduling {} resync", obj.kind_name());
            metrics::increment_requeues_total("scheduled");
            Ok(Action::requeue(delay))
        }
        None => Ok(Action::await_change()),
    }
}

/// Write the status subresource and take the stored copy
pub(crate) async fn persist<R: Reconcilable>(obj: &mut R, ctx: &Reconciler) -> Result<(), ReconcilerError> {
    *obj = R::store(ctx).patch_status(obj).await?;
    Ok(())
}

pub(crate) async fn remove_finalizer<R: Reconcilable>(
    obj: &mut R,
    ctx: &Reconciler,
) -> Result<(), ReconcilerError> {
    if !has_finalizer(obj) {
        return Ok(());
    }
    let finalizers: Vec<String> = obj
        .meta()
        .finalizers
        .iter()
        .flatten()
        .filter(|f| *f != FINALIZER)
        .cloned()
        .collect();
    *obj = R::store(ctx)
        .patch_metadata(obj, serde_json::json!({ "finalizers": finalizers }))
        .await?;
    Ok(())
}

/// Record a failed remote call
///
/// Transient failures keep the resource in progress and are returned as
/// errors so the error policy backs off. Anything else is a final failure
/// for this generation; deletions keep returning an error until they pass.
pub(crate) async fn remote_failure<R: Reconcilable>(
    obj: &mut R,
    ctx: &Reconciler,
    op: OperationType,
    call: &str,
    err: SmError,
) -> Result<Action, ReconcilerError> {
    metrics::record_remote_operation(call, "error");
    let message = err.to_string();
    if is_transient(&err) {
        warn!(error = %message, "{} {} failed, will retry", obj.kind_name(), call);
        obj.set_in_progress(Some(op), &message);
        persist(obj, ctx).await?;
        return Err(ReconcilerError::Transient {
            message,
            retry_after: err.retry_after(),
        });
    }

    error!(error = %message, "{} {} failed", obj.kind_name(), call);
    obj.set_failure(Some(op), &message);
    obj.set_observed_generation(obj.generation());
    persist(obj, ctx).await?;
    if op == OperationType::Delete {
        return Err(ReconcilerError::DeleteFailed(message));
    }
    Ok(Action::await_change())
}

/// Record a failure the user has to fix before anything is retried
pub(crate) async fn invalid<R: Reconcilable>(
    obj: &mut R,
    ctx: &Reconciler,
    op: OperationType,
    message: &str,
) -> Result<Action, ReconcilerError> {
    error!(error = %message, "{} {} rejected", obj.kind_name(), op);
    obj.set_failure(Some(op), message);
    obj.set_observed_generation(obj.generation());
    persist(obj, ctx).await?;
    Ok(Action::await_change())
}

/// Mark the resource blocked; repeated identical blocks do not rewrite status
pub(crate) async fn blocked<R: Reconcilable>(
    obj: &mut R,
    ctx: &Reconciler,
    message: &str,
) -> Result<Action, ReconcilerError> {
    let unchanged = conditions::find(obj.conditions(), conditions::SUCCEEDED).is_some_and(|c| {
        c.reason() == reasons::BLOCKED && c.message.as_deref() == Some(message)
    });
    if !unchanged {
        warn!(reason = %message, "{} blocked", obj.kind_name());
        obj.set_blocked(message);
        persist(obj, ctx).await?;
    }
    Ok(Action::await_change())
}

/// The remote system accepted a long-running operation
pub(crate) async fn accepted<R: Reconcilable>(
    obj: &mut R,
    ctx: &Reconciler,
    op: OperationType,
    resource_id: Option<String>,
    operation_url: String,
) -> Result<Action, ReconcilerError> {
    info!(operation = %op, url = %operation_url, "{} operation accepted", obj.kind_name());
    if let Some(id) = resource_id.filter(|id| !id.is_empty()) {
        obj.set_remote_id(Some(id));
    }
    obj.set_operation(Some((operation_url, op)));
    obj.set_in_progress(Some(op), "");
    if op != OperationType::Delete {
        obj.set_observed_generation(obj.generation());
        obj.record_spec();
    }
    persist(obj, ctx).await?;
    metrics::increment_requeues_total("operation-pending");
    Ok(Action::requeue(ctx.config.poll_interval()))
}

/// A synchronous create or update completed
pub(crate) async fn completed<R: Reconcilable>(
    obj: &mut R,
    ctx: &Reconciler,
    op: OperationType,
) -> Result<Action, ReconcilerError> {
    obj.set_observed_generation(obj.generation());
    obj.record_spec();
    mark_succeeded(obj, ctx, op).await
}

/// Record success of `op` and clear the operation reference
pub(crate) async fn mark_succeeded<R: Reconcilable>(
    obj: &mut R,
    ctx: &Reconciler,
    op: OperationType,
) -> Result<Action, ReconcilerError> {
    obj.set_operation(None);
    obj.set_success(Some(op));
    persist(obj, ctx).await?;
    info!(operation = %op, "{} operation succeeded", obj.kind_name());
    Ok(Action::await_change())
}
