//! # Error Policy
//!
//! Requeue decisions for failed reconciles and watch stream errors.

use crate::controller::backoff::BackoffState;
use crate::controller::reconciler::{Reconcilable, Reconciler, ReconcilerError};
use crate::observability::metrics;
use kube::Resource;
use kube_runtime::controller::Action;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Requeue a resource whose reconcile returned an error
///
/// Each resource keeps its own exponential backoff, reset by the next
/// successful reconcile. A delay requested by the service manager
/// (`Retry-After`) wins over the computed one.
pub fn handle_reconciliation_error<R: Reconcilable>(
    obj: Arc<R>,
    error: &ReconcilerError,
    ctx: Arc<Reconciler>,
) -> Action {
    let kind = obj.kind_name();
    let name = obj.meta().name.clone().unwrap_or_default();
    let namespace = obj.meta().namespace.clone().unwrap_or_default();
    let span = tracing::span!(
        tracing::Level::ERROR,
        "controller.reconcile.error",
        resource.kind = kind,
        resource.name = %name,
        resource.namespace = %namespace,
        error = %error
    );
    let _guard = span.enter();

    metrics::increment_reconciliation_errors(kind);

    let key = format!("{kind}/{namespace}/{name}");
    let (backoff_secs, error_count) = match ctx.backoff_states.lock() {
        Ok(mut states) => {
            let state = states.entry(key).or_insert_with(|| {
                BackoffState::new(ctx.config.backoff_start_secs, ctx.config.backoff_max_secs)
            });
            state.increment_error();
            (state.backoff.next_backoff_seconds(), state.error_count)
        }
        Err(e) => {
            warn!("backoff state lock poisoned: {}", e);
            (ctx.config.backoff_max_secs, 0)
        }
    };
    let delay = error
        .retry_after()
        .unwrap_or_else(|| Duration::from_secs(backoff_secs));

    match error {
        ReconcilerError::Transient { .. } => warn!(
            error_count,
            requeue_secs = delay.as_secs(),
            "{} {}/{} will be retried: {}",
            kind,
            namespace,
            name,
            error
        ),
        _ => error!(
            error_count,
            requeue_secs = delay.as_secs(),
            "reconcile of {} {}/{} failed: {}",
            kind,
            namespace,
            name,
            error
        ),
    }

    metrics::increment_requeues_total("error-backoff");
    Action::requeue(delay)
}

/// Broad class of a watch stream failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchErrorKind {
    /// 401: credentials revoked or expired
    Unauthorized,
    /// 410: resource version too old, a fresh list follows
    Expired,
    /// 429: API server overloaded or reinitializing storage
    Throttled,
    /// 404: usually the CRDs are not installed
    NotFound,
    Other,
}

impl WatchErrorKind {
    /// Classify the debug rendering of a controller stream error
    #[must_use]
    pub fn classify(error: &str) -> Self {
        // 404 first: a plain-text 404 body surfaces as a decode error that also names WatchFailed
        if error.contains("ObjectNotFound") || error.contains("404") || error.contains("not found") {
            WatchErrorKind::NotFound
        } else if error.contains("401") || error.contains("Unauthorized") {
            WatchErrorKind::Unauthorized
        } else if error.contains("410")
            || error.contains("too old resource version")
            || error.contains("Expired")
            || error.contains("Gone")
        {
            WatchErrorKind::Expired
        } else if error.contains("429")
            || error.contains("TooManyRequests")
            || error.contains("storage is (re)initializing")
        {
            WatchErrorKind::Throttled
        } else {
            WatchErrorKind::Other
        }
    }
}

/// Log and pace a watch stream error
///
/// Throttling doubles `backoff_ms` up to `max_backoff_ms`; a successful
/// event resets it in the watch loop.
pub async fn handle_watch_stream_error(
    error: &str,
    backoff_ms: &AtomicU64,
    max_backoff_ms: u64,
    restart_delay: Duration,
) {
    match WatchErrorKind::classify(error) {
        WatchErrorKind::Unauthorized => {
            error!(
                error = %error,
                "watch unauthorized (401): check the controller's service account and RBAC bindings"
            );
            tokio::time::sleep(restart_delay).await;
        }
        WatchErrorKind::Expired => {
            warn!(error_type = "410", "watch resource version expired, relisting");
        }
        WatchErrorKind::Throttled => {
            let current = backoff_ms.load(Ordering::Relaxed);
            warn!(
                error_type = "429",
                "API server throttling the watch, backing off {}ms", current
            );
            tokio::time::sleep(Duration::from_millis(current)).await;
            backoff_ms.store(current.saturating_mul(2).min(max_backoff_ms), Ordering::Relaxed);
        }
        WatchErrorKind::NotFound => {
            warn!(
                error = %error,
                "watched resource not found (404): are the ServiceInstance and ServiceBinding CRDs installed?"
            );
            tokio::time::sleep(restart_delay).await;
        }
        WatchErrorKind::Other => {
            error!(error = %error, "watch stream error");
        }
    }
}
