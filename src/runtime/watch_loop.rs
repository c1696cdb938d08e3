//! # Watch Loop
//!
//! Runs one controller per kind until shutdown. Bindings also react to
//! changes of their secrets and of the instance they reference.
//!
//! A watch stream that ends without a shutdown request is restarted after
//! `watch_restart_delay_secs`.

use crate::constants::SECRET_BINDING_LABEL;
use crate::controller::reconciler::{reconcile, Reconcilable, Reconciler};
use crate::crd::{ServiceBinding, ServiceInstance};
use crate::runtime::error_policy::{handle_reconciliation_error, handle_watch_stream_error};
use crate::server::ServerState;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::Client;
use kube_runtime::controller::{self, Controller};
use kube_runtime::reflector::{ObjectRef, Store};
use kube_runtime::watcher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

/// Watch stream backoff bounds, in milliseconds
const WATCH_BACKOFF_START_MS: u64 = 1_000;
const WATCH_BACKOFF_MAX_MS: u64 = 30_000;

/// Run both controllers until a shutdown signal arrives
pub async fn run_watch_loop(
    client: Client,
    reconciler: Arc<Reconciler>,
    server_state: Arc<ServerState>,
) -> Result<(), anyhow::Error> {
    let shutdown_state = Arc::clone(&server_state);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal, finishing in-flight reconciles");
        shutdown_state.set_ready(false);
    });

    server_state.set_ready(true);
    loop {
        if !server_state.ready() {
            info!("shutdown requested, leaving watch loop");
            break;
        }

        info!(
            concurrency = reconciler.config.max_concurrent_reconciliations,
            "starting ServiceInstance and ServiceBinding controllers"
        );
        futures::future::join(
            run_instance_controller(client.clone(), Arc::clone(&reconciler)),
            run_binding_controller(client.clone(), Arc::clone(&reconciler)),
        )
        .instrument(tracing::info_span!("controller.watch", operation = "watch_loop"))
        .await;

        if !server_state.ready() {
            info!("controllers stopped after shutdown signal");
            break;
        }
        let delay = reconciler.config.watch_restart_delay_duration();
        warn!("watch streams ended, restarting in {}s", delay.as_secs());
        tokio::time::sleep(delay).await;
    }
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn controller_config(reconciler: &Reconciler) -> controller::Config {
    let concurrency =
        u16::try_from(reconciler.config.max_concurrent_reconciliations).unwrap_or(u16::MAX);
    controller::Config::default().concurrency(concurrency)
}

async fn run_instance_controller(client: Client, reconciler: Arc<Reconciler>) {
    let instances: Api<ServiceInstance> = Api::all(client);
    let controller = Controller::new(instances, watcher::Config::default().any_semantic())
        .with_config(controller_config(&reconciler));
    drive(controller, reconciler).await;
}

async fn run_binding_controller(client: Client, reconciler: Arc<Reconciler>) {
    let bindings: Api<ServiceBinding> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::all(client.clone());
    let instances: Api<ServiceInstance> = Api::all(client);

    let controller = Controller::new(bindings, watcher::Config::default().any_semantic())
        .with_config(controller_config(&reconciler));
    let cache = controller.store();
    let controller = controller
        .owns(secrets, watcher::Config::default().labels(SECRET_BINDING_LABEL))
        .watches(instances, watcher::Config::default(), move |instance| {
            bindings_of_instance(&cache, &instance)
        });
    drive(controller, reconciler).await;
}

/// Bindings in the cache that reference `instance`
fn bindings_of_instance(
    cache: &Store<ServiceBinding>,
    instance: &ServiceInstance,
) -> Vec<ObjectRef<ServiceBinding>> {
    let namespace = instance.metadata.namespace.as_deref().unwrap_or_default();
    let name = instance.metadata.name.as_deref().unwrap_or_default();
    cache
        .state()
        .into_iter()
        .filter(|b| b.spec.service_instance_name == name && b.instance_namespace() == namespace)
        .map(|b| ObjectRef::from_obj(b.as_ref()))
        .collect()
}

async fn drive<K: Reconcilable>(controller: Controller<K>, reconciler: Arc<Reconciler>) {
    let watch_backoff = Arc::new(AtomicU64::new(WATCH_BACKOFF_START_MS));
    let restart_delay = reconciler.config.watch_restart_delay_duration();
    controller
        .shutdown_on_signal()
        .run(
            |obj, ctx| reconcile(obj, ctx),
            |obj, error, ctx| handle_reconciliation_error(obj, error, ctx),
            reconciler,
        )
        .for_each(|result| {
            let watch_backoff = Arc::clone(&watch_backoff);
            async move {
                match result {
                    Ok((obj, action)) => {
                        watch_backoff.store(WATCH_BACKOFF_START_MS, Ordering::Relaxed);
                        debug!(object = %obj, ?action, "reconciled");
                    }
                    // Already logged and requeued by the error policy
                    Err(controller::Error::ReconcilerFailed(_, obj)) => {
                        debug!(object = %obj, "reconcile failed");
                    }
                    Err(e) => {
                        handle_watch_stream_error(
                            &format!("{e:?}"),
                            &watch_backoff,
                            WATCH_BACKOFF_MAX_MS,
                            restart_delay,
                        )
                        .await;
                    }
                }
            }
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ServiceBindingSpec, ServiceInstanceSpec};
    use kube_runtime::reflector::store::Writer;
    use kube_runtime::watcher::Event;

    fn binding(namespace: &str, name: &str, instance: &str) -> ServiceBinding {
        let mut b = ServiceBinding::new(
            name,
            ServiceBindingSpec {
                service_instance_name: instance.to_string(),
                ..Default::default()
            },
        );
        b.metadata.namespace = Some(namespace.to_string());
        b
    }

    #[test]
    fn test_instance_changes_map_to_referencing_bindings() {
        let mut writer: Writer<ServiceBinding> = Writer::default();
        let cache = writer.as_reader();
        writer.apply_watcher_event(&Event::Apply(binding("apps", "a", "db")));
        writer.apply_watcher_event(&Event::Apply(binding("apps", "b", "cache")));
        writer.apply_watcher_event(&Event::Apply(binding("other", "c", "db")));

        let mut instance = ServiceInstance::new("db", ServiceInstanceSpec::default());
        instance.metadata.namespace = Some("apps".to_string());

        let refs = bindings_of_instance(&cache, &instance);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "a");
        assert_eq!(refs[0].namespace.as_deref(), Some("apps"));
    }
}
