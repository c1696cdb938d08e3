//! # Object Store
//!
//! Access to the cluster object store for the custom resources and Secrets.
//!
//! Every write carries the object's `resourceVersion`. A concurrent writer
//! therefore surfaces as [`StoreError::Conflict`], which the reconciler
//! answers with a re-read and retry.

mod cluster;

pub use cluster::KubeStore;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },
    #[error("write conflict on {0}, object was modified concurrently")]
    Conflict(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("object store request failed: {0}")]
    Api(String),
}

impl StoreError {
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Objects the store can hold: namespaced kinds with a static type
pub trait StoredObject:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + DeserializeOwned
    + Serialize
    + Debug
    + Send
    + Sync
    + 'static
{
}

impl<T> StoredObject for T where
    T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static
{
}

/// Object store operations used by the reconcilers
#[async_trait]
pub trait ObjectStore<K: StoredObject>: Send + Sync {
    /// Fetch an object; `None` when it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError>;

    async fn list(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>, StoreError>;

    async fn create(&self, obj: &K) -> Result<K, StoreError>;

    /// Replace the whole object, guarded by its `resourceVersion`
    async fn replace(&self, obj: &K) -> Result<K, StoreError>;

    /// Delete an object. Deleting a missing object succeeds.
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    /// Merge-patch the status subresource with the status of `obj`
    async fn patch_status(&self, obj: &K) -> Result<K, StoreError>;

    /// Merge-patch `metadata` with `patch` (a JSON object of metadata fields)
    async fn patch_metadata(&self, obj: &K, patch: serde_json::Value) -> Result<K, StoreError>;
}

/// `namespace/name` of an object
pub fn object_key<K: Resource>(obj: &K) -> String {
    format!(
        "{}/{}",
        obj.meta().namespace.as_deref().unwrap_or_default(),
        obj.meta().name.as_deref().unwrap_or_default()
    )
}

/// Status patch body: the object's status plus its `resourceVersion`
pub(crate) fn status_patch<K: StoredObject>(obj: &K) -> Result<serde_json::Value, StoreError> {
    let value = serde_json::to_value(obj).map_err(|e| StoreError::Api(e.to_string()))?;
    Ok(serde_json::json!({
        "metadata": { "resourceVersion": obj.meta().resource_version },
        "status": value.get("status").cloned().unwrap_or(serde_json::Value::Null),
    }))
}

/// Metadata patch body with the object's `resourceVersion` added
pub(crate) fn metadata_patch<K: StoredObject>(
    obj: &K,
    mut patch: serde_json::Value,
) -> serde_json::Value {
    if let Some(fields) = patch.as_object_mut() {
        fields.insert(
            "resourceVersion".to_string(),
            serde_json::json!(obj.meta().resource_version),
        );
    }
    serde_json::json!({ "metadata": patch })
}
