//! # Cluster Store
//!
//! [`ObjectStore`] backed by the Kubernetes API server.

use super::{metadata_patch, object_key, status_patch, ObjectStore, StoreError, StoredObject};
use crate::constants::FIELD_MANAGER;
use async_trait::async_trait;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use std::marker::PhantomData;

/// Object store over `kube::Api`
#[derive(Clone)]
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> std::fmt::Debug for KubeStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore")
            .field("kind", &std::any::type_name::<K>())
            .finish_non_exhaustive()
    }
}

impl<K: StoredObject> KubeStore<K> {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }

    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn map_error(err: kube::Error, kind: &str, namespace: &str, name: &str) -> StoreError {
    match err {
        kube::Error::Api(api_err) if api_err.code == 404 => StoreError::NotFound {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(api_err) if api_err.code == 409 && api_err.reason == "AlreadyExists" => {
            StoreError::AlreadyExists(format!("{kind} {namespace}/{name}"))
        }
        kube::Error::Api(api_err) if api_err.code == 409 => {
            StoreError::Conflict(format!("{kind} {namespace}/{name}"))
        }
        other => StoreError::Api(other.to_string()),
    }
}

fn names<K: StoredObject>(obj: &K) -> (String, String) {
    (
        obj.meta().namespace.clone().unwrap_or_default(),
        obj.meta().name.clone().unwrap_or_default(),
    )
}

#[async_trait]
impl<K: StoredObject> ObjectStore<K> for KubeStore<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        self.api(namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_error(e, &K::kind(&()), namespace, name))
    }

    async fn list(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>, StoreError> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        self.api(namespace)
            .list(&params)
            .await
            .map(|list| list.items)
            .map_err(|e| map_error(e, &K::kind(&()), namespace, ""))
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = names(obj);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api(&namespace)
            .create(&params, obj)
            .await
            .map_err(|e| map_error(e, &K::kind(&()), &namespace, &name))
    }

    async fn replace(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = names(obj);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api(&namespace)
            .replace(&name, &params, obj)
            .await
            .map_err(|e| map_error(e, &K::kind(&()), &namespace, &name))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        match self
            .api(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => Ok(()),
            Err(e) => Err(map_error(e, &K::kind(&()), namespace, name)),
        }
    }

    async fn patch_status(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = names(obj);
        let patch = status_patch(obj)?;
        tracing::debug!("Patching status of {}", object_key(obj));
        self.api(&namespace)
            .patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_error(e, &K::kind(&()), &namespace, &name))
    }

    async fn patch_metadata(&self, obj: &K, patch: serde_json::Value) -> Result<K, StoreError> {
        let (namespace, name) = names(obj);
        let patch = metadata_patch(obj, patch);
        self.api(&namespace)
            .patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_error(e, &K::kind(&()), &namespace, &name))
    }
}
