//! # ServiceBinding Reconciler
//!
//! Creates remote bindings and materializes their credentials as a Secret.
//!
//! A binding is gated on its instance: while the instance is absent, being
//! deleted or failed the binding is `Blocked`; while it is still being
//! provisioned the binding waits. Settled bindings are maintained in the
//! idle step (stale binding cleanup, credential rotation, and recreation of
//! a secret that was deleted out of band).

use super::engine::{self, persist};
use super::parameters::{build_parameters, ParameterError};
use super::recovery::{correlation_labels, correlation_query};
use super::resource::{stored_operation, Gate, Reconcilable, RemoteMatch};
use super::rotation;
use super::types::{Reconciler, ReconcilerError};
use crate::controller::conditions::{self, Conditioned};
use crate::controller::secrets::{self, InstanceInfo, SecretError};
use crate::crd::{OperationType, ServiceBinding, ServiceInstance};
use crate::observability::metrics;
use crate::sm::{BindRequest, Outcome, RemoteBinding, ServiceManagerClient, SmError};
use crate::store::ObjectStore;
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::controller::Action;
use kube::Resource;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

fn non_empty(value: Option<&String>) -> bool {
    value.is_some_and(|v| !v.is_empty())
}

impl ServiceBinding {
    fn object_namespace(&self) -> String {
        self.metadata.namespace.clone().unwrap_or_default()
    }

    fn object_name(&self) -> String {
        self.metadata.name.clone().unwrap_or_default()
    }

    fn instance_reference(&self) -> String {
        format!(
            "{}/{}",
            self.instance_namespace(),
            self.spec.service_instance_name
        )
    }

    async fn block(&mut self, ctx: &Reconciler, message: &str) -> Result<Gate, ReconcilerError> {
        engine::blocked(self, ctx, message).await.map(Gate::Stop)
    }

    /// Check the referenced instance and pick up its ID
    async fn gate_on_instance(&mut self, ctx: &Reconciler) -> Result<Gate, ReconcilerError> {
        let reference = self.instance_reference();
        let bound = self.binding_id().is_some();
        let instance = ctx
            .instances
            .get(&self.instance_namespace(), &self.spec.service_instance_name)
            .await?;
        let instance = match instance {
            None => {
                let message = format!("ServiceInstance {reference} not found");
                return self.block(ctx, &message).await;
            }
            Some(i) if i.metadata.deletion_timestamp.is_some() => {
                let message = format!("ServiceInstance {reference} is being deleted");
                return self.block(ctx, &message).await;
            }
            Some(i) if bound => i,
            Some(i) if i.is_failed() => {
                let reason = conditions::find(i.conditions(), conditions::SUCCEEDED)
                    .and_then(|c| c.message.clone())
                    .unwrap_or_default();
                let message = format!("ServiceInstance {reference} is not usable: {reason}");
                return self.block(ctx, &message).await;
            }
            Some(i) if !i.is_ready() => {
                let message = format!("waiting for ServiceInstance {reference} to become ready");
                debug!("{}", message);
                self.set_in_progress(None, &message);
                persist(self, ctx).await?;
                metrics::increment_requeues_total("instance-not-ready");
                return Ok(Gate::Stop(Action::requeue(
                    ctx.config.long_poll_interval(),
                )));
            }
            Some(i) => i,
        };

        self.adopt_instance_owner(ctx, &instance).await?;
        if let Some(id) = instance.instance_id() {
            self.status_mut().instance_id = Some(id.to_string());
        }
        Ok(Gate::Proceed)
    }

    /// Reference the instance as a (non-controller) owner so bindings go with it
    async fn adopt_instance_owner(
        &mut self,
        ctx: &Reconciler,
        instance: &ServiceInstance,
    ) -> Result<(), ReconcilerError> {
        let Some(uid) = instance.metadata.uid.clone() else {
            return Ok(());
        };
        if instance.metadata.namespace != self.metadata.namespace {
            return Ok(());
        }
        let mut references = self.metadata.owner_references.clone().unwrap_or_default();
        if references.iter().any(|r| r.uid == uid) {
            return Ok(());
        }
        references.push(OwnerReference {
            api_version: ServiceInstance::api_version(&()).to_string(),
            kind: ServiceInstance::kind(&()).to_string(),
            name: instance.metadata.name.clone().unwrap_or_default(),
            uid,
            controller: None,
            block_owner_deletion: None,
        });
        *self = ctx
            .bindings
            .patch_metadata(self, serde_json::json!({ "ownerReferences": references }))
            .await?;
        Ok(())
    }

    /// Why the target secret cannot be used, if it cannot
    async fn secret_conflict(&self, ctx: &Reconciler) -> Result<Option<String>, ReconcilerError> {
        let name = self.secret_name();
        let Some(secret) = ctx.secrets.get(&self.object_namespace(), &name).await? else {
            return Ok(None);
        };
        Ok(match secrets::secret_owner(&secret) {
            Some(owner) if Some(owner) == self.metadata.name.as_deref() => None,
            Some(owner) => Some(format!(
                "secret {name} belongs to another binding {owner}, choose a different secret name"
            )),
            None => Some(format!(
                "secret {name} already exists and is not managed by a binding, choose a different secret name"
            )),
        })
    }

    async fn instance_info(&self, ctx: &Reconciler) -> Result<InstanceInfo, ReconcilerError> {
        let guid = self
            .status
            .as_ref()
            .and_then(|s| s.instance_id.clone())
            .unwrap_or_default();
        let instance = ctx
            .instances
            .get(&self.instance_namespace(), &self.spec.service_instance_name)
            .await?;
        Ok(match instance {
            Some(i) => InstanceInfo {
                instance_name: i.external_name(),
                instance_guid: i.instance_id().map(str::to_string).unwrap_or(guid),
                plan: i.spec.service_plan_name.clone(),
                offering: i.spec.service_offering_name.clone(),
                tags: i.status.as_ref().map(|s| s.tags.clone()).unwrap_or_default(),
            },
            None => InstanceInfo {
                instance_name: self.spec.service_instance_name.clone(),
                instance_guid: guid,
                ..InstanceInfo::default()
            },
        })
    }

    /// Write the credentials secret; `Some` when the content was rejected
    /// and the failure recorded
    async fn materialize(
        &mut self,
        ctx: &Reconciler,
        op: OperationType,
        credentials: &serde_json::Value,
    ) -> Result<Option<Action>, ReconcilerError> {
        let info = self.instance_info(ctx).await?;
        let content = match secrets::render_content(&self.spec, credentials, &info) {
            Ok(content) => content,
            Err(SecretError::Invalid(message)) => {
                let message = format!("failed to build the binding secret: {message}");
                return engine::invalid(self, ctx, op, &message).await.map(Some);
            }
            Err(SecretError::Store(e)) => return Err(e.into()),
        };
        secrets::write_secret(ctx.secrets.as_ref(), self, content)
            .await
            .map_err(|e| ReconcilerError::Materialize(e.to_string()))?;
        Ok(None)
    }

    /// Materialize credentials of a finished create or update
    async fn settle_credentials(
        &mut self,
        ctx: &Reconciler,
        op: OperationType,
        remote: &RemoteBinding,
    ) -> Result<Option<Action>, ReconcilerError> {
        let credentials = remote
            .credentials
            .clone()
            .unwrap_or_else(|| serde_json::json!({}));
        if let Some(action) = self.materialize(ctx, op, &credentials).await? {
            return Ok(Some(action));
        }
        if op == OperationType::Create {
            self.status_mut().last_credentials_rotation_time = Some(Utc::now().to_rfc3339());
            conditions::remove(self.conditions_mut(), conditions::CRED_ROTATION_IN_PROGRESS);
        }
        Ok(None)
    }

    /// Fetch the remote binding and write its credentials
    async fn refresh(
        &mut self,
        ctx: &Reconciler,
        client: &dyn ServiceManagerClient,
        op: OperationType,
        synchronous: bool,
    ) -> Result<Action, ReconcilerError> {
        let id = self.binding_id().unwrap_or_default().to_string();
        let remote = match client.get_binding(&id).await {
            Ok(remote) => {
                metrics::record_remote_operation("get_binding", "success");
                remote
            }
            Err(e) => return engine::remote_failure(self, ctx, op, "get_binding", e).await,
        };
        if !remote.ready {
            let message = format!("binding {id} is not ready in the service manager");
            return engine::invalid(self, ctx, op, &message).await;
        }
        if let Some(action) = self.settle_credentials(ctx, op, &remote).await? {
            return Ok(action);
        }
        if synchronous {
            engine::completed(self, ctx, op).await
        } else {
            engine::mark_succeeded(self, ctx, op).await
        }
    }

    /// Rewrite a secret that disappeared while the binding was settled
    async fn restore_secret(&mut self, ctx: &Reconciler) -> Result<Option<Action>, ReconcilerError> {
        let exists = ctx
            .secrets
            .get(&self.object_namespace(), &self.secret_name())
            .await?
            .is_some();
        if exists {
            return Ok(None);
        }
        info!(secret = %self.secret_name(), "binding secret is missing, restoring it");
        let client = ctx.client_for(&self.object_namespace()).await?;
        let id = self.binding_id().unwrap_or_default().to_string();
        match client.get_binding(&id).await {
            Ok(remote) => {
                metrics::record_remote_operation("get_binding", "success");
                let credentials = remote
                    .credentials
                    .unwrap_or_else(|| serde_json::json!({}));
                self.materialize(ctx, OperationType::Update, &credentials)
                    .await
            }
            Err(e) => {
                engine::remote_failure(self, ctx, OperationType::Update, "get_binding", e)
                    .await
                    .map(Some)
            }
        }
    }
}

#[async_trait]
impl Reconcilable for ServiceBinding {
    const COLLECTION: &'static str = "service_bindings";
    const REMOTE_DELETE: &'static str = "unbind";

    fn store(ctx: &Reconciler) -> Arc<dyn ObjectStore<Self>> {
        Arc::clone(&ctx.bindings)
    }

    fn remote_id(&self) -> Option<&str> {
        self.binding_id()
    }

    fn set_remote_id(&mut self, id: Option<String>) {
        self.status_mut().binding_id = id;
    }

    fn operation(&self) -> Option<(String, OperationType)> {
        let status = self.status.as_ref()?;
        stored_operation(status.operation_url.as_ref(), status.operation_type)
    }

    fn set_operation(&mut self, operation: Option<(String, OperationType)>) {
        let status = self.status_mut();
        let (url, op) = operation.unzip();
        status.operation_url = url;
        status.operation_type = op;
    }

    fn observed_generation(&self) -> i64 {
        self.status.as_ref().map_or(0, |s| s.observed_generation)
    }

    fn set_observed_generation(&mut self, generation: i64) {
        self.status_mut().observed_generation = generation;
    }

    async fn gate(&mut self, ctx: &Reconciler) -> Result<Gate, ReconcilerError> {
        self.gate_on_instance(ctx).await
    }

    async fn find_remote(
        &self,
        ctx: &Reconciler,
        client: &dyn ServiceManagerClient,
    ) -> Result<Vec<RemoteMatch>, SmError> {
        let mut query = correlation_query(
            &self.external_name(),
            &ctx.config.cluster_id,
            &self.object_namespace(),
            &self.object_name(),
        );
        if let Some(instance_id) = self
            .status
            .as_ref()
            .and_then(|s| s.instance_id.as_deref())
            .filter(|id| !id.is_empty())
        {
            query = query.field_eq("service_instance_id", instance_id);
        }
        Ok(client
            .list_bindings(&query)
            .await?
            .into_iter()
            .map(|b| RemoteMatch {
                id: b.id,
                ready: b.ready,
                last_operation: b.last_operation,
            })
            .collect())
    }

    async fn create(
        &mut self,
        ctx: &Reconciler,
        client: &dyn ServiceManagerClient,
    ) -> Result<Action, ReconcilerError> {
        if non_empty(self.spec.secret_key.as_ref()) && non_empty(self.spec.secret_root_key.as_ref())
        {
            return engine::invalid(
                self,
                ctx,
                OperationType::Create,
                "secretKey and secretRootKey cannot both be set",
            )
            .await;
        }
        if let Some(message) = self.secret_conflict(ctx).await? {
            return engine::blocked(self, ctx, &message).await;
        }
        let Some(instance_id) = self
            .status
            .as_ref()
            .and_then(|s| s.instance_id.clone())
            .filter(|id| !id.is_empty())
        else {
            let message = format!(
                "waiting for ServiceInstance {} to report its ID",
                self.instance_reference()
            );
            self.set_in_progress(None, &message);
            persist(self, ctx).await?;
            return Ok(Action::requeue(ctx.config.long_poll_interval()));
        };
        let parameters = match build_parameters(
            ctx.secrets.as_ref(),
            &self.object_namespace(),
            self.spec.parameters.as_ref(),
            &self.spec.parameters_from,
        )
        .await
        {
            Ok(parameters) => parameters,
            Err(ParameterError::Invalid(message)) => {
                return engine::invalid(self, ctx, OperationType::Create, &message).await
            }
            Err(ParameterError::Store(e)) => return Err(e.into()),
        };

        let request = BindRequest {
            name: self.external_name(),
            service_instance_id: instance_id,
            parameters,
            labels: correlation_labels(
                &ctx.config.cluster_id,
                &self.object_namespace(),
                &self.object_name(),
            ),
            user_info: self.spec.user_info.clone(),
        };
        info!(instance = %request.service_instance_id, "creating binding {}", request.name);
        match client.bind(&request).await {
            Ok(Outcome::Done(remote)) => {
                metrics::record_remote_operation("bind", "success");
                self.set_remote_id(Some(remote.id.clone()));
                if let Some(action) = self
                    .settle_credentials(ctx, OperationType::Create, &remote)
                    .await?
                {
                    return Ok(action);
                }
                engine::completed(self, ctx, OperationType::Create).await
            }
            Ok(Outcome::Accepted {
                resource_id,
                operation_url,
            }) => {
                metrics::record_remote_operation("bind", "accepted");
                engine::accepted(
                    self,
                    ctx,
                    OperationType::Create,
                    Some(resource_id),
                    operation_url,
                )
                .await
            }
            Err(e) => engine::remote_failure(self, ctx, OperationType::Create, "bind", e).await,
        }
    }

    async fn update(
        &mut self,
        ctx: &Reconciler,
        client: &dyn ServiceManagerClient,
    ) -> Result<Action, ReconcilerError> {
        self.refresh(ctx, client, OperationType::Update, true).await
    }

    async fn finish(
        &mut self,
        ctx: &Reconciler,
        client: &dyn ServiceManagerClient,
        op: OperationType,
    ) -> Result<Action, ReconcilerError> {
        self.refresh(ctx, client, op, false).await
    }

    async fn delete_remote(
        &self,
        client: &dyn ServiceManagerClient,
        id: &str,
    ) -> Result<Outcome<()>, SmError> {
        client.unbind(id).await
    }

    async fn cleanup(&mut self, ctx: &Reconciler) -> Result<(), ReconcilerError> {
        secrets::delete_secret(ctx.secrets.as_ref(), self).await?;
        Ok(())
    }

    async fn maintain(&mut self, ctx: &Reconciler) -> Result<Option<Action>, ReconcilerError> {
        if self.is_stale() {
            return rotation::handle_stale(self, ctx).await.map(Some);
        }
        if rotation::rotation_due(self, Utc::now()) {
            let client = ctx.client_for(&self.object_namespace()).await?;
            return rotation::rotate(self, ctx, client.as_ref()).await.map(Some);
        }
        if self.binding_id().is_some() && conditions::is_true(self.conditions(), conditions::READY)
        {
            return self.restore_secret(ctx).await;
        }
        Ok(None)
    }

    fn resync_after(&self, ctx: &Reconciler) -> Option<Duration> {
        rotation::next_rotation_in(self, Utc::now())
            .map(|remaining| remaining.min(ctx.config.long_poll_interval()))
    }
}
