//! # Test Doubles
//!
//! In-memory implementations of [`ObjectStore`] and [`ServiceManagerClient`]
//! for exercising the reconcilers without a cluster or a remote service.
//!
//! `MemoryStore` mimics the API server where it matters: every write bumps
//! `resourceVersion` and is rejected with `Conflict` when the caller's
//! version is stale, and deleting an object with finalizers only sets its
//! deletion timestamp. `FakeServiceManager` records every call so tests can
//! assert on call counts.

use crate::credentials::{ClientFactory, CredentialsError};
use crate::sm::{
    BindRequest, Labels, ListQuery, Operation, OperationState, Outcome, ProvisionRequest,
    RemoteBinding, RemoteInstance, ServiceManagerClient, ServiceOffering, ServicePlan, SmError,
    UpdateInstanceRequest,
};
use crate::store::{ObjectStore, StoreError, StoredObject};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// RFC 7386 JSON merge patch
pub fn merge_patch(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match patch {
        serde_json::Value::Object(fields) => {
            if !target.is_object() {
                *target = serde_json::Value::Object(serde_json::Map::new());
            }
            if let Some(target_fields) = target.as_object_mut() {
                for (key, value) in fields {
                    if value.is_null() {
                        target_fields.remove(key);
                    } else {
                        merge_patch(
                            target_fields
                                .entry(key.clone())
                                .or_insert(serde_json::Value::Null),
                            value,
                        );
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

fn now_time() -> Option<Time> {
    serde_json::from_value(serde_json::json!(chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)))
    .ok()
}

fn api_error(e: impl std::fmt::Display) -> StoreError {
    StoreError::Api(e.to_string())
}

/// In-memory object store
pub struct MemoryStore<K> {
    objects: Mutex<BTreeMap<(String, String), K>>,
    version: AtomicU64,
    writes: AtomicUsize,
    pending_conflicts: AtomicUsize,
}

impl<K> std::fmt::Debug for MemoryStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("kind", &std::any::type_name::<K>())
            .finish_non_exhaustive()
    }
}

impl<K: StoredObject> Default for MemoryStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: StoredObject> MemoryStore<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            version: AtomicU64::new(1),
            writes: AtomicUsize::new(0),
            pending_conflicts: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<(String, String), K>> {
        self.objects
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn next_version(&self) -> String {
        self.version.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn key(obj: &K) -> (String, String) {
        (
            obj.meta().namespace.clone().unwrap_or_default(),
            obj.meta().name.clone().unwrap_or_default(),
        )
    }

    fn not_found(namespace: &str, name: &str) -> StoreError {
        StoreError::NotFound {
            kind: K::kind(&()).to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Reject a write when the caller's version is stale or a conflict was injected
    fn check_version(&self, stored: &K, obj: &K) -> Result<(), StoreError> {
        if self
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Conflict(crate::store::object_key(obj)));
        }
        match &obj.meta().resource_version {
            Some(v) if Some(v) != stored.meta().resource_version.as_ref() => {
                Err(StoreError::Conflict(crate::store::object_key(obj)))
            }
            _ => Ok(()),
        }
    }

    /// Seed an object as if a user had created it
    pub fn insert(&self, mut obj: K) -> K {
        let meta = obj.meta_mut();
        meta.resource_version = Some(self.next_version());
        meta.generation = Some(meta.generation.unwrap_or(1));
        if meta.uid.is_none() {
            meta.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = now_time();
        }
        self.lock().insert(Self::key(&obj), obj.clone());
        obj
    }

    /// Current stored copy
    #[must_use]
    pub fn get_now(&self, namespace: &str, name: &str) -> Option<K> {
        self.lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Every stored object
    #[must_use]
    pub fn all(&self) -> Vec<K> {
        self.lock().values().cloned().collect()
    }

    /// Apply a user edit; bumps generation when `spec_change` is set
    pub fn edit(&self, namespace: &str, name: &str, spec_change: bool, f: impl FnOnce(&mut K)) {
        let version = self.next_version();
        if let Some(obj) = self
            .lock()
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            f(obj);
            let meta = obj.meta_mut();
            meta.resource_version = Some(version);
            if spec_change {
                meta.generation = Some(meta.generation.unwrap_or(1) + 1);
            }
        }
    }

    /// Make the next `n` writes fail with `Conflict`
    pub fn inject_conflicts(&self, n: usize) {
        self.pending_conflicts.store(n, Ordering::SeqCst);
    }

    /// Number of successful writes
    #[must_use]
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Remove the object once it is marked deleted and has no finalizers left
    fn settle(objects: &mut BTreeMap<(String, String), K>, key: &(String, String)) {
        let gone = objects.get(key).is_some_and(|o| {
            o.meta().deletion_timestamp.is_some()
                && o.meta().finalizers.as_ref().is_none_or(Vec::is_empty)
        });
        if gone {
            objects.remove(key);
        }
    }

    fn write_patch(
        &self,
        obj: &K,
        patch: serde_json::Value,
    ) -> Result<K, StoreError> {
        let key = Self::key(obj);
        let version = self.next_version();
        let mut objects = self.lock();
        let stored = objects
            .get(&key)
            .ok_or_else(|| Self::not_found(&key.0, &key.1))?;
        self.check_version(stored, obj)?;

        let mut value = serde_json::to_value(stored).map_err(api_error)?;
        merge_patch(&mut value, &patch);
        let mut updated: K = serde_json::from_value(value).map_err(api_error)?;
        updated.meta_mut().resource_version = Some(version);
        objects.insert(key.clone(), updated.clone());
        Self::settle(&mut objects, &key);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }
}

fn label_selector_matches(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.and_then(|l| l.get(k.trim())) == Some(&v.trim().to_string()),
            None => labels.is_some_and(|l| l.contains_key(term)),
        })
}

#[async_trait]
impl<K: StoredObject> ObjectStore<K> for MemoryStore<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        Ok(self.get_now(namespace, name))
    }

    async fn list(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>, StoreError> {
        Ok(self
            .lock()
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .filter(|(_, obj)| {
                label_selector.is_none_or(|s| label_selector_matches(obj.meta().labels.as_ref(), s))
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let key = Self::key(obj);
        if self.lock().contains_key(&key) {
            return Err(StoreError::AlreadyExists(crate::store::object_key(obj)));
        }
        let mut created = obj.clone();
        created.meta_mut().resource_version = None;
        created.meta_mut().uid = None;
        let created = self.insert(created);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn replace(&self, obj: &K) -> Result<K, StoreError> {
        let key = Self::key(obj);
        let version = self.next_version();
        let mut objects = self.lock();
        let stored = objects
            .get(&key)
            .ok_or_else(|| Self::not_found(&key.0, &key.1))?;
        self.check_version(stored, obj)?;
        let mut updated = obj.clone();
        updated.meta_mut().resource_version = Some(version);
        updated.meta_mut().uid = stored.meta().uid.clone();
        updated.meta_mut().creation_timestamp = stored.meta().creation_timestamp.clone();
        objects.insert(key, updated.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let key = (namespace.to_string(), name.to_string());
        let version = self.next_version();
        let mut objects = self.lock();
        if let Some(obj) = objects.get_mut(&key) {
            if obj.meta().deletion_timestamp.is_none() {
                obj.meta_mut().deletion_timestamp = now_time();
                obj.meta_mut().resource_version = Some(version);
            }
        }
        Self::settle(&mut objects, &key);
        Ok(())
    }

    async fn patch_status(&self, obj: &K) -> Result<K, StoreError> {
        let mut patch = crate::store::status_patch(obj)?;
        if let Some(fields) = patch.as_object_mut() {
            fields.remove("metadata");
        }
        self.write_patch(obj, patch)
    }

    async fn patch_metadata(&self, obj: &K, patch: serde_json::Value) -> Result<K, StoreError> {
        let mut body = crate::store::metadata_patch(obj, patch);
        if let Some(meta) = body.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.remove("resourceVersion");
        }
        self.write_patch(obj, body)
    }
}

/// Remote call failing or being accepted as a long-running operation
#[derive(Debug, Clone)]
pub enum Scripted {
    Fail(SmError),
    /// Accept with this operation ID
    Accept(String),
}

#[derive(Debug, Default)]
struct FakeState {
    instances: BTreeMap<String, RemoteInstance>,
    bindings: BTreeMap<String, RemoteBinding>,
    offerings: Vec<ServiceOffering>,
    plans: Vec<ServicePlan>,
    operations: HashMap<String, Operation>,
    scripted: HashMap<String, VecDeque<Scripted>>,
    credentials: serde_json::Value,
    calls: Vec<String>,
    next_id: u64,
}

/// In-memory remote provisioning service
#[derive(Debug)]
pub struct FakeServiceManager {
    state: Mutex<FakeState>,
}

impl Default for FakeServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

fn label(labels: &Labels, key: &str) -> Vec<String> {
    labels.get(key).cloned().unwrap_or_default()
}

fn succeeded(op_type: &str, resource_id: &str) -> Operation {
    Operation {
        id: format!("op-{resource_id}"),
        r#type: op_type.to_string(),
        state: OperationState::Succeeded,
        description: None,
        resource_id: Some(resource_id.to_string()),
        errors: None,
    }
}

impl FakeServiceManager {
    /// A service manager offering `mongo` with plan `small`
    #[must_use]
    pub fn new() -> Self {
        let fake = Self {
            state: Mutex::new(FakeState {
                credentials: serde_json::json!({
                    "username": "admin",
                    "password": "s3cr3t",
                    "uri": "mongodb://db.example.com:27017",
                    "port": 27017
                }),
                next_id: 1,
                ..Default::default()
            }),
        };
        fake.add_offering("mongo", &["mongo", "nosql"], &["small"]);
        fake
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Add an offering and its plans to the catalog
    pub fn add_offering(&self, catalog_name: &str, tags: &[&str], plans: &[&str]) {
        let mut state = self.lock();
        let offering_id = format!("offering-{catalog_name}");
        state.offerings.push(ServiceOffering {
            id: offering_id.clone(),
            name: catalog_name.to_string(),
            catalog_name: catalog_name.to_string(),
            tags: tags.iter().map(|t| (*t).to_string()).collect(),
        });
        for plan in plans {
            state.plans.push(ServicePlan {
                id: format!("plan-{catalog_name}-{plan}"),
                name: (*plan).to_string(),
                catalog_name: (*plan).to_string(),
                service_offering_id: offering_id.clone(),
            });
        }
    }

    /// Credentials document issued by future binds
    pub fn set_credentials(&self, credentials: serde_json::Value) {
        self.lock().credentials = credentials;
    }

    /// Script the next call of `operation` (e.g. `"bind"`)
    pub fn script(&self, operation: &str, response: Scripted) {
        self.lock()
            .scripted
            .entry(operation.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn fail_next(&self, operation: &str, error: SmError) {
        self.script(operation, Scripted::Fail(error));
    }

    pub fn accept_next(&self, operation: &str, operation_id: &str) {
        self.script(operation, Scripted::Accept(operation_id.to_string()));
    }

    /// Move an accepted operation to a new state
    ///
    /// Succeeded creates mark the remote object ready; succeeded deletes remove it.
    pub fn set_operation_state(&self, operation_url: &str, state: OperationState) {
        let mut guard = self.lock();
        let Some(op) = guard.operations.get_mut(operation_url) else {
            return;
        };
        op.state = state;
        let op = op.clone();
        let resource_id = op.resource_id.clone().unwrap_or_default();
        if state == OperationState::Succeeded {
            match op.r#type.as_str() {
                "delete" => {
                    guard.instances.remove(&resource_id);
                    guard.bindings.remove(&resource_id);
                }
                _ => {
                    if let Some(i) = guard.instances.get_mut(&resource_id) {
                        i.ready = true;
                        i.last_operation = Some(op.clone());
                    }
                    if let Some(b) = guard.bindings.get_mut(&resource_id) {
                        b.ready = true;
                        b.last_operation = Some(op);
                    }
                }
            }
        }
    }

    pub fn insert_instance(&self, instance: RemoteInstance) {
        self.lock().instances.insert(instance.id.clone(), instance);
    }

    pub fn insert_binding(&self, binding: RemoteBinding) {
        self.lock().bindings.insert(binding.id.clone(), binding);
    }

    #[must_use]
    pub fn instance(&self, id: &str) -> Option<RemoteInstance> {
        self.lock().instances.get(id).cloned()
    }

    #[must_use]
    pub fn binding(&self, id: &str) -> Option<RemoteBinding> {
        self.lock().bindings.get(id).cloned()
    }

    #[must_use]
    pub fn bindings(&self) -> Vec<RemoteBinding> {
        self.lock().bindings.values().cloned().collect()
    }

    /// Every call made so far, in order
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Number of calls of `operation`
    #[must_use]
    pub fn count(&self, operation: &str) -> usize {
        self.lock().calls.iter().filter(|c| *c == operation).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Record a call and pop its scripted response
    fn enter(&self, operation: &str) -> Option<Scripted> {
        let mut state = self.lock();
        state.calls.push(operation.to_string());
        state
            .scripted
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
    }

    fn next_id(&self, prefix: &str) -> String {
        let mut state = self.lock();
        let id = format!("{prefix}-{}", state.next_id);
        state.next_id += 1;
        id
    }

    fn register_operation(
        &self,
        collection: &str,
        resource_id: &str,
        op_type: &str,
        operation_id: &str,
    ) -> String {
        let url = format!("/v1/{collection}/{resource_id}/operations/{operation_id}");
        let op = Operation {
            id: operation_id.to_string(),
            r#type: op_type.to_string(),
            state: OperationState::InProgress,
            description: None,
            resource_id: Some(resource_id.to_string()),
            errors: None,
        };
        let mut state = self.lock();
        if let Some(i) = state.instances.get_mut(resource_id) {
            i.last_operation = Some(op.clone());
        }
        if let Some(b) = state.bindings.get_mut(resource_id) {
            b.last_operation = Some(op.clone());
        }
        state.operations.insert(url.clone(), op);
        url
    }

    fn instance_field(instance: &RemoteInstance, key: &str) -> Vec<String> {
        match key {
            "id" => vec![instance.id.clone()],
            "name" => vec![instance.name.clone()],
            "service_plan_id" => vec![instance.service_plan_id.clone()],
            "context/clusterid" => label(&instance.labels, crate::constants::REMOTE_CLUSTER_ID_LABEL),
            "context/namespace" => label(&instance.labels, crate::constants::REMOTE_NAMESPACE_LABEL),
            _ => vec![],
        }
    }

    fn binding_field(binding: &RemoteBinding, key: &str) -> Vec<String> {
        match key {
            "id" => vec![binding.id.clone()],
            "name" => vec![binding.name.clone()],
            "service_instance_id" => vec![binding.service_instance_id.clone()],
            "context/clusterid" => label(&binding.labels, crate::constants::REMOTE_CLUSTER_ID_LABEL),
            "context/namespace" => label(&binding.labels, crate::constants::REMOTE_NAMESPACE_LABEL),
            _ => vec![],
        }
    }
}

fn matches(
    query: &ListQuery,
    field: impl Fn(&str) -> Vec<String>,
    labels: &Labels,
) -> bool {
    query.fields.iter().all(|p| p.matches(&field(&p.key)))
        && query.labels.iter().all(|p| p.matches(&label(labels, &p.key)))
}

#[async_trait]
impl ServiceManagerClient for FakeServiceManager {
    async fn provision(&self, request: &ProvisionRequest) -> Result<Outcome<String>, SmError> {
        let scripted = self.enter("provision");
        if let Some(Scripted::Fail(e)) = scripted {
            return Err(e);
        }
        let id = self.next_id("instance");
        let accepted = matches!(scripted, Some(Scripted::Accept(_)));
        self.insert_instance(RemoteInstance {
            id: id.clone(),
            name: request.name.clone(),
            service_plan_id: request.service_plan_id.clone(),
            ready: !accepted,
            shared: request.shared,
            labels: request.labels.clone(),
            last_operation: Some(succeeded("create", &id)),
        });
        match scripted {
            Some(Scripted::Accept(op_id)) => Ok(Outcome::Accepted {
                operation_url: self.register_operation("service_instances", &id, "create", &op_id),
                resource_id: id,
            }),
            _ => Ok(Outcome::Done(id)),
        }
    }

    async fn update_instance(
        &self,
        instance_id: &str,
        request: &UpdateInstanceRequest,
    ) -> Result<Outcome<()>, SmError> {
        let scripted = self.enter("update_instance");
        if let Some(Scripted::Fail(e)) = scripted {
            return Err(e);
        }
        {
            let mut state = self.lock();
            let instance = state
                .instances
                .get_mut(instance_id)
                .ok_or_else(|| SmError::api(404, "instance not found"))?;
            instance.name = request.name.clone();
            instance.service_plan_id = request.service_plan_id.clone();
        }
        match scripted {
            Some(Scripted::Accept(op_id)) => Ok(Outcome::Accepted {
                operation_url: self.register_operation(
                    "service_instances",
                    instance_id,
                    "update",
                    &op_id,
                ),
                resource_id: instance_id.to_string(),
            }),
            _ => Ok(Outcome::Done(())),
        }
    }

    async fn deprovision(&self, instance_id: &str) -> Result<Outcome<()>, SmError> {
        match self.enter("deprovision") {
            Some(Scripted::Fail(e)) => Err(e),
            Some(Scripted::Accept(op_id)) => Ok(Outcome::Accepted {
                operation_url: self.register_operation(
                    "service_instances",
                    instance_id,
                    "delete",
                    &op_id,
                ),
                resource_id: instance_id.to_string(),
            }),
            None => {
                self.lock().instances.remove(instance_id);
                Ok(Outcome::Done(()))
            }
        }
    }

    async fn share_instance(&self, instance_id: &str, shared: bool) -> Result<(), SmError> {
        if let Some(Scripted::Fail(e)) = self.enter("share_instance") {
            return Err(e);
        }
        let mut state = self.lock();
        let instance = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| SmError::api(404, "instance not found"))?;
        instance.shared = Some(shared);
        Ok(())
    }

    async fn bind(&self, request: &BindRequest) -> Result<Outcome<RemoteBinding>, SmError> {
        let scripted = self.enter("bind");
        if let Some(Scripted::Fail(e)) = scripted {
            return Err(e);
        }
        let id = self.next_id("binding");
        let accepted = matches!(scripted, Some(Scripted::Accept(_)));
        let binding = RemoteBinding {
            id: id.clone(),
            name: request.name.clone(),
            service_instance_id: request.service_instance_id.clone(),
            ready: !accepted,
            credentials: Some(self.lock().credentials.clone()),
            labels: request.labels.clone(),
            last_operation: Some(succeeded("create", &id)),
        };
        self.insert_binding(binding.clone());
        match scripted {
            Some(Scripted::Accept(op_id)) => Ok(Outcome::Accepted {
                operation_url: self.register_operation("service_bindings", &id, "create", &op_id),
                resource_id: id,
            }),
            _ => Ok(Outcome::Done(binding)),
        }
    }

    async fn unbind(&self, binding_id: &str) -> Result<Outcome<()>, SmError> {
        match self.enter("unbind") {
            Some(Scripted::Fail(e)) => Err(e),
            Some(Scripted::Accept(op_id)) => Ok(Outcome::Accepted {
                operation_url: self.register_operation(
                    "service_bindings",
                    binding_id,
                    "delete",
                    &op_id,
                ),
                resource_id: binding_id.to_string(),
            }),
            None => {
                self.lock().bindings.remove(binding_id);
                Ok(Outcome::Done(()))
            }
        }
    }

    async fn get_binding(&self, binding_id: &str) -> Result<RemoteBinding, SmError> {
        if let Some(Scripted::Fail(e)) = self.enter("get_binding") {
            return Err(e);
        }
        self.binding(binding_id)
            .ok_or_else(|| SmError::api(404, "binding not found"))
    }

    async fn rename_binding(
        &self,
        binding_id: &str,
        new_name: &str,
        new_k8s_name: &str,
    ) -> Result<(), SmError> {
        if let Some(Scripted::Fail(e)) = self.enter("rename_binding") {
            return Err(e);
        }
        let mut state = self.lock();
        let binding = state
            .bindings
            .get_mut(binding_id)
            .ok_or_else(|| SmError::api(404, "binding not found"))?;
        binding.name = new_name.to_string();
        binding.labels.insert(
            crate::constants::REMOTE_K8S_NAME_LABEL.to_string(),
            vec![new_k8s_name.to_string()],
        );
        Ok(())
    }

    async fn list_instances(&self, query: &ListQuery) -> Result<Vec<RemoteInstance>, SmError> {
        if let Some(Scripted::Fail(e)) = self.enter("list_instances") {
            return Err(e);
        }
        Ok(self
            .lock()
            .instances
            .values()
            .filter(|i| matches(query, |k| Self::instance_field(i, k), &i.labels))
            .cloned()
            .collect())
    }

    async fn list_bindings(&self, query: &ListQuery) -> Result<Vec<RemoteBinding>, SmError> {
        if let Some(Scripted::Fail(e)) = self.enter("list_bindings") {
            return Err(e);
        }
        Ok(self
            .lock()
            .bindings
            .values()
            .filter(|b| matches(query, |k| Self::binding_field(b, k), &b.labels))
            .cloned()
            .collect())
    }

    async fn status(&self, operation_url: &str) -> Result<Operation, SmError> {
        if let Some(Scripted::Fail(e)) = self.enter("status") {
            return Err(e);
        }
        self.lock()
            .operations
            .get(operation_url)
            .cloned()
            .ok_or_else(|| SmError::api(404, "operation not found"))
    }

    async fn list_offerings(&self, query: &ListQuery) -> Result<Vec<ServiceOffering>, SmError> {
        if let Some(Scripted::Fail(e)) = self.enter("list_offerings") {
            return Err(e);
        }
        Ok(self
            .lock()
            .offerings
            .iter()
            .filter(|o| {
                query.fields.iter().all(|p| match p.key.as_str() {
                    "catalog_name" => p.matches(&[o.catalog_name.clone()]),
                    "id" => p.matches(&[o.id.clone()]),
                    _ => false,
                })
            })
            .cloned()
            .collect())
    }

    async fn list_plans(&self, query: &ListQuery) -> Result<Vec<ServicePlan>, SmError> {
        if let Some(Scripted::Fail(e)) = self.enter("list_plans") {
            return Err(e);
        }
        Ok(self
            .lock()
            .plans
            .iter()
            .filter(|plan| {
                query.fields.iter().all(|p| match p.key.as_str() {
                    "catalog_name" => p.matches(&[plan.catalog_name.clone()]),
                    "service_offering_id" => p.matches(&[plan.service_offering_id.clone()]),
                    "id" => p.matches(&[plan.id.clone()]),
                    _ => false,
                })
            })
            .cloned()
            .collect())
    }
}

/// Client factory handing out the same client for every namespace
#[derive(Clone)]
pub struct StaticClientFactory {
    client: Arc<dyn ServiceManagerClient>,
}

impl std::fmt::Debug for StaticClientFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticClientFactory").finish_non_exhaustive()
    }
}

impl StaticClientFactory {
    pub fn new(client: Arc<dyn ServiceManagerClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClientFactory for StaticClientFactory {
    async fn client_for(
        &self,
        _namespace: &str,
    ) -> Result<Arc<dyn ServiceManagerClient>, CredentialsError> {
        Ok(Arc::clone(&self.client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;

    fn config_map(name: &str) -> ConfigMap {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some(name.to_string());
        cm.metadata.namespace = Some("default".to_string());
        cm
    }

    #[test]
    fn test_merge_patch_removes_nulls_and_replaces_arrays() {
        let mut target = serde_json::json!({"a": {"b": 1, "c": 2}, "list": [1, 2]});
        merge_patch(
            &mut target,
            &serde_json::json!({"a": {"b": null, "d": 3}, "list": [3]}),
        );
        assert_eq!(
            target,
            serde_json::json!({"a": {"c": 2, "d": 3}, "list": [3]})
        );
    }

    #[tokio::test]
    async fn test_stale_resource_version_conflicts() {
        let store = MemoryStore::<ConfigMap>::new();
        let original = store.insert(config_map("cm"));
        store.edit("default", "cm", false, |_| {});
        let err = store
            .patch_metadata(&original, serde_json::json!({"labels": {"a": "b"}}))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_delete_waits_for_finalizers() {
        let store = MemoryStore::<ConfigMap>::new();
        let mut cm = config_map("cm");
        cm.metadata.finalizers = Some(vec!["example.com/f".to_string()]);
        store.insert(cm);

        store.delete("default", "cm").await.unwrap();
        let marked = store.get_now("default", "cm").unwrap();
        assert!(marked.metadata.deletion_timestamp.is_some());

        store
            .patch_metadata(&marked, serde_json::json!({"finalizers": []}))
            .await
            .unwrap();
        assert!(store.get_now("default", "cm").is_none());
    }
}
