//! # Initialization
//!
//! Process startup: crypto provider, tracing, metrics, the probe server, the
//! Kubernetes client and the shared reconciler context.

use crate::config::ControllerConfig;
use crate::controller::reconciler::Reconciler;
use crate::credentials::{RestClientFactory, SecretResolver};
use crate::crd::{ServiceBinding, ServiceInstance};
use crate::observability::metrics;
use crate::server::{start_server, ServerState};
use crate::store::{KubeStore, ObjectStore};
use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams};
use kube::Client;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Everything the watch loop needs
pub struct InitializationResult {
    pub client: Client,
    pub reconciler: Arc<Reconciler>,
    /// Readiness shared with the probe server
    pub server_state: Arc<ServerState>,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("server_ready", &self.server_state.ready())
            .finish_non_exhaustive()
    }
}

/// Initialize the controller runtime
pub async fn initialize() -> Result<InitializationResult> {
    // kube and reqwest both use rustls; pick ring before either builds a TLS config
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install the rustls crypto provider");
    }

    let config = ControllerConfig::from_env();
    init_tracing(&config);

    info!("Starting Service Manager Controller");
    info!(
        build_timestamp = env!("BUILD_TIMESTAMP"),
        build_datetime = env!("BUILD_DATETIME"),
        git_hash = env!("BUILD_GIT_HASH"),
        "build info"
    );
    info!(
        cluster_id = %config.cluster_id,
        release_namespace = %config.release_namespace,
        management_namespace = %config.management_namespace,
        credentials_secret = %config.credentials_secret_name,
        "controller configuration loaded"
    );
    config.warn_on_defaults();

    metrics::register_metrics().context("failed to register metrics")?;

    let server_state = Arc::new(ServerState::default());
    let server_port = config.metrics_port;
    let state_for_server = Arc::clone(&server_state);
    tokio::spawn(async move {
        if let Err(e) = start_server(server_port, state_for_server).await {
            error!("HTTP server error: {}", e);
        }
    });

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    check_crds(&client).await;

    let secrets: Arc<dyn ObjectStore<Secret>> = Arc::new(KubeStore::<Secret>::new(client.clone()));
    let resolver = SecretResolver::new(
        Arc::clone(&secrets),
        config.credentials_secret_name.clone(),
        config.management_namespace.clone(),
        config.release_namespace.clone(),
    );
    let reconciler = Arc::new(Reconciler::new(
        config,
        Arc::new(RestClientFactory::new(resolver)),
        Arc::new(KubeStore::<ServiceInstance>::new(client.clone())),
        Arc::new(KubeStore::<ServiceBinding>::new(client.clone())),
        secrets,
    ));

    Ok(InitializationResult {
        client,
        reconciler,
        server_state,
    })
}

fn init_tracing(config: &ControllerConfig) {
    let default_directive = format!(
        "service_manager_controller={}",
        config.log_level.to_lowercase()
    );
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Log how many resources exist, or why they cannot be listed
async fn check_crds(client: &Client) {
    let instances: Api<ServiceInstance> = Api::all(client.clone());
    let bindings: Api<ServiceBinding> = Api::all(client.clone());
    let params = ListParams::default().limit(500);
    match (instances.list(&params).await, bindings.list(&params).await) {
        (Ok(instances), Ok(bindings)) => info!(
            instances = instances.items.len(),
            bindings = bindings.items.len(),
            "found existing resources, they will be reconciled when the watch starts"
        ),
        (Err(e), _) | (_, Err(e)) => warn!(
            "cannot list ServiceInstance/ServiceBinding resources, are the CRDs installed and RBAC granted? {}",
            e
        ),
    }
}
