//! # Reconciler Types
//!
//! Shared context and error type of both reconcilers.

use crate::config::ControllerConfig;
use crate::controller::backoff::BackoffState;
use crate::credentials::{ClientFactory, CredentialsError};
use crate::crd::{ServiceBinding, ServiceInstance};
use crate::sm::ServiceManagerClient;
use crate::store::{ObjectStore, StoreError};
use k8s_openapi::api::core::v1::Secret;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcilerError {
    /// Remote failure expected to clear up on retry
    #[error("transient service manager error: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },
    /// Deletion cannot make progress; redelivered until it does
    #[error("delete failed: {0}")]
    DeleteFailed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("service manager credentials unavailable: {0}")]
    Credentials(String),
    #[error("failed to materialize secret: {0}")]
    Materialize(String),
}

impl ReconcilerError {
    /// Delay requested by the remote system, if any
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ReconcilerError::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, ReconcilerError::Store(e) if e.is_conflict())
    }
}

impl From<CredentialsError> for ReconcilerError {
    fn from(e: CredentialsError) -> Self {
        ReconcilerError::Credentials(e.to_string())
    }
}

/// Reconciler context shared by every reconcile
pub struct Reconciler {
    pub config: ControllerConfig,
    pub clients: Arc<dyn ClientFactory>,
    pub instances: Arc<dyn ObjectStore<ServiceInstance>>,
    pub bindings: Arc<dyn ObjectStore<ServiceBinding>>,
    pub secrets: Arc<dyn ObjectStore<Secret>>,
    /// Per-resource error backoff, keyed by `kind/namespace/name`
    pub backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(
        config: ControllerConfig,
        clients: Arc<dyn ClientFactory>,
        instances: Arc<dyn ObjectStore<ServiceInstance>>,
        bindings: Arc<dyn ObjectStore<ServiceBinding>>,
        secrets: Arc<dyn ObjectStore<Secret>>,
    ) -> Self {
        Self {
            config,
            clients,
            instances,
            bindings,
            secrets,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Remote client for resources in `namespace`
    pub async fn client_for(
        &self,
        namespace: &str,
    ) -> Result<Arc<dyn ServiceManagerClient>, ReconcilerError> {
        Ok(self.clients.client_for(namespace).await?)
    }

    /// Forget the error backoff of a resource after a successful reconcile
    pub fn reset_backoff(&self, key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states.remove(key);
        }
    }
}
