//! # Recovery Resolver
//!
//! Finds a remote object created earlier for a resource whose remote ID was
//! lost, so a missed status write never leads to a second create.
//!
//! Remote objects are correlated by name, cluster ID, namespace and the
//! `_k8sname` label. Exactly one match is adopted; none (or an ambiguous
//! result) means the object is created.

use super::engine::persist;
use super::poll;
use super::resource::{Reconcilable, RemoteMatch};
use super::types::{Reconciler, ReconcilerError};
use crate::constants::{REMOTE_CLUSTER_ID_LABEL, REMOTE_K8S_NAME_LABEL, REMOTE_NAMESPACE_LABEL};
use crate::crd::OperationType;
use crate::observability::metrics;
use crate::sm::{Labels, ListQuery, ServiceManagerClient, SmError};
use kube::runtime::controller::Action;
use kube::Resource;
use tracing::{debug, info, warn};

/// Labels every remote object carries to tie it to its resource
pub(crate) fn correlation_labels(cluster_id: &str, namespace: &str, name: &str) -> Labels {
    Labels::from([
        (REMOTE_CLUSTER_ID_LABEL.to_string(), vec![cluster_id.to_string()]),
        (REMOTE_NAMESPACE_LABEL.to_string(), vec![namespace.to_string()]),
        (REMOTE_K8S_NAME_LABEL.to_string(), vec![name.to_string()]),
    ])
}

/// Query for remote objects created for a resource
pub(crate) fn correlation_query(
    external_name: &str,
    cluster_id: &str,
    namespace: &str,
    name: &str,
) -> ListQuery {
    ListQuery::new()
        .field_eq("name", external_name)
        .field_eq("context/clusterid", cluster_id)
        .field_eq("context/namespace", namespace)
        .label_eq(REMOTE_K8S_NAME_LABEL, name)
        .with_last_operations()
}

/// The single remote object matching the resource, if there is one
pub(crate) async fn find_unique<R: Reconcilable>(
    obj: &R,
    ctx: &Reconciler,
    client: &dyn ServiceManagerClient,
) -> Result<Option<RemoteMatch>, SmError> {
    let mut matches = obj.find_remote(ctx, client).await?;
    metrics::record_remote_operation("list", "success");
    match matches.len() {
        0 => Ok(None),
        1 => Ok(matches.pop()),
        n => {
            warn!(
                matches = n,
                "{} matches several remote objects, treating it as not found",
                obj.kind_name()
            );
            Ok(None)
        }
    }
}

/// Adopt the matching remote object or create a new one
pub async fn recover<R: Reconcilable>(
    obj: &mut R,
    ctx: &Reconciler,
    client: &dyn ServiceManagerClient,
) -> Result<Action, ReconcilerError> {
    match find_unique(obj, ctx, client).await {
        Err(e) => super::engine::remote_failure(obj, ctx, OperationType::Create, "list", e).await,
        Ok(Some(found)) => adopt(obj, ctx, client, found).await,
        Ok(None) => {
            if let Some(id) = obj.remote_id() {
                warn!(remote_id = %id, "remote object no longer exists, creating it again");
                obj.set_remote_id(None);
            }
            debug!(
                name = obj.meta().name.as_deref().unwrap_or_default(),
                "no remote object found, creating"
            );
            obj.create(ctx, client).await
        }
    }
}

async fn adopt<R: Reconcilable>(
    obj: &mut R,
    ctx: &Reconciler,
    client: &dyn ServiceManagerClient,
    found: RemoteMatch,
) -> Result<Action, ReconcilerError> {
    info!(remote_id = %found.id, "adopting existing remote {}", obj.kind_name());
    obj.set_remote_id(Some(found.id.clone()));
    obj.set_observed_generation(obj.generation());
    obj.record_spec();

    match found.last_operation {
        Some(operation) => {
            let op = operation.operation_type().unwrap_or(OperationType::Create);
            let url = poll::operation_url::<R>(&found.id, &operation.id);
            poll::apply_operation(obj, ctx, client, op, &url, &operation).await
        }
        None if found.ready => obj.finish(ctx, client, OperationType::Create).await,
        None => {
            obj.set_in_progress(
                Some(OperationType::Create),
                "waiting for the remote object to become ready",
            );
            persist(obj, ctx).await?;
            Ok(Action::requeue(ctx.config.poll_interval()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_query_keys() {
        let query = correlation_query("orders-db", "cluster-1", "shop", "db");
        let fields: Vec<_> = query.fields.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(fields, vec!["name", "context/clusterid", "context/namespace"]);
        assert_eq!(query.labels.len(), 1);
        assert_eq!(query.labels[0].key, REMOTE_K8S_NAME_LABEL);
    }

    #[test]
    fn test_correlation_labels() {
        let labels = correlation_labels("cluster-1", "shop", "db");
        assert_eq!(labels[REMOTE_CLUSTER_ID_LABEL], vec!["cluster-1"]);
        assert_eq!(labels[REMOTE_NAMESPACE_LABEL], vec!["shop"]);
        assert_eq!(labels[REMOTE_K8S_NAME_LABEL], vec!["db"]);
    }
}
