//! # ServiceInstance Reconciler
//!
//! Provisions, updates, shares and deprovisions remote instances.

use super::catalog::{self, CatalogError, ResolvedPlan};
use super::classify::is_transient;
use super::engine::{self, persist};
use super::parameters::{build_parameters, ParameterError};
use super::recovery::{correlation_labels, correlation_query};
use super::resource::{stored_operation, Reconcilable, RemoteMatch};
use super::types::{Reconciler, ReconcilerError};
use crate::controller::conditions::{self, reasons, Conditioned};
use crate::crd::{OperationType, ServiceInstance};
use crate::observability::metrics;
use crate::sm::{
    Outcome, ProvisionRequest, ServiceManagerClient, SmError, UpdateInstanceRequest,
};
use crate::store::ObjectStore;
use async_trait::async_trait;
use kube::runtime::controller::Action;
use std::sync::Arc;
use tracing::{info, warn};

/// Plan and parameters of a create or update request
struct Prepared {
    plan: ResolvedPlan,
    parameters: Option<serde_json::Value>,
}

impl ServiceInstance {
    fn object_namespace(&self) -> String {
        self.metadata.namespace.clone().unwrap_or_default()
    }

    fn object_name(&self) -> String {
        self.metadata.name.clone().unwrap_or_default()
    }

    /// Resolve the plan and build parameters; `Err(action)` when the request
    /// cannot be made and the failure was recorded
    async fn prepare(
        &mut self,
        ctx: &Reconciler,
        client: &dyn ServiceManagerClient,
        op: OperationType,
    ) -> Result<Result<Prepared, Action>, ReconcilerError> {
        let plan = match catalog::resolve_plan(
            client,
            &self.spec.service_offering_name,
            &self.spec.service_plan_name,
            self.spec.service_plan_id.as_deref(),
        )
        .await
        {
            Ok(plan) => plan,
            Err(CatalogError::Remote(e)) => {
                return engine::remote_failure(self, ctx, op, "catalog", e)
                    .await
                    .map(Err)
            }
            Err(e) => return engine::invalid(self, ctx, op, &e.to_string()).await.map(Err),
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
                return engine::invalid(self, ctx, op, &message).await.map(Err)
            }
            Err(ParameterError::Store(e)) => return Err(e.into()),
        };
        Ok(Ok(Prepared { plan, parameters }))
    }

    /// Offering tags followed by the custom tags
    fn record_tags(&mut self, offering_tags: &[String]) {
        let mut tags = offering_tags.to_vec();
        for tag in &self.spec.custom_tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        self.status_mut().tags = tags;
    }

    /// Desired sharing state when it differs from the recorded one
    fn sharing_change(&self) -> Option<bool> {
        let desired = self.spec.shared?;
        if !self.is_ready() || !conditions::is_true(self.conditions(), conditions::READY) {
            return None;
        }
        match conditions::find(self.conditions(), conditions::SHARED) {
            Some(current) if current.is_true() == desired => None,
            // Rejected for this generation; retried once the spec changes
            Some(current)
                if matches!(current.reason(), reasons::SHARE_FAILED | reasons::UNSHARE_FAILED)
                    && current.observed_generation == Some(self.generation()) =>
            {
                None
            }
            None if !desired => None,
            _ => Some(desired),
        }
    }

    /// Share or unshare the instance when the spec asks for a change
    async fn sync_sharing(
        &mut self,
        ctx: &Reconciler,
        client: &dyn ServiceManagerClient,
    ) -> Result<(), ReconcilerError> {
        let Some(shared) = self.sharing_change() else {
            return Ok(());
        };
        let id = self.instance_id().unwrap_or_default().to_string();
        match client.share_instance(&id, shared).await {
            Ok(()) => {
                metrics::record_remote_operation("share_instance", "success");
                let (reason, message) = if shared {
                    (reasons::SHARE_SUCCEEDED, "instance shared successfully")
                } else {
                    (reasons::UNSHARE_SUCCEEDED, "instance unshared successfully")
                };
                info!(shared, "updated instance sharing");
                self.set_shared(shared, reason, message);
                persist(self, ctx).await
            }
            Err(e) => {
                metrics::record_remote_operation("share_instance", "error");
                let reason = if shared {
                    reasons::SHARE_FAILED
                } else {
                    reasons::UNSHARE_FAILED
                };
                let message = e.to_string();
                warn!(shared, error = %message, "failed to update instance sharing");
                if is_transient(&e) {
                    return Err(ReconcilerError::Transient {
                        message,
                        retry_after: e.retry_after(),
                    });
                }
                self.set_shared(false, reason, &message);
                persist(self, ctx).await
            }
        }
    }
}

#[async_trait]
impl Reconcilable for ServiceInstance {
    const COLLECTION: &'static str = "service_instances";
    const REMOTE_DELETE: &'static str = "deprovision";

    fn store(ctx: &Reconciler) -> Arc<dyn ObjectStore<Self>> {
        Arc::clone(&ctx.instances)
    }

    fn remote_id(&self) -> Option<&str> {
        self.instance_id()
    }

    fn set_remote_id(&mut self, id: Option<String>) {
        self.status_mut().instance_id = id;
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

    fn spec_unchanged(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.hash_spec.as_deref())
            .is_some_and(|hash| hash == self.spec_hash())
    }

    fn record_spec(&mut self) {
        let hash = self.spec_hash();
        self.status_mut().hash_spec = Some(hash);
    }

    async fn find_remote(
        &self,
        ctx: &Reconciler,
        client: &dyn ServiceManagerClient,
    ) -> Result<Vec<RemoteMatch>, SmError> {
        let query = correlation_query(
            &self.external_name(),
            &ctx.config.cluster_id,
            &self.object_namespace(),
            &self.object_name(),
        );
        Ok(client
            .list_instances(&query)
            .await?
            .into_iter()
            .map(|i| RemoteMatch {
                id: i.id,
                ready: i.ready,
                last_operation: i.last_operation,
            })
            .collect())
    }

    async fn create(
        &mut self,
        ctx: &Reconciler,
        client: &dyn ServiceManagerClient,
    ) -> Result<Action, ReconcilerError> {
        let prepared = match self.prepare(ctx, client, OperationType::Create).await? {
            Ok(prepared) => prepared,
            Err(action) => return Ok(action),
        };
        self.record_tags(&prepared.plan.tags);
        let request = ProvisionRequest {
            name: self.external_name(),
            service_plan_id: prepared.plan.plan_id,
            parameters: prepared.parameters,
            labels: correlation_labels(&ctx.config.cluster_id, &self.object_namespace(), &self.object_name()),
            shared: self.spec.shared.filter(|s| *s),
            user_info: self.spec.user_info.clone(),
        };
        info!(
            offering = %self.spec.service_offering_name,
            plan = %self.spec.service_plan_name,
            "provisioning instance {}",
            request.name
        );
        match client.provision(&request).await {
            Ok(Outcome::Done(id)) => {
                metrics::record_remote_operation("provision", "success");
                self.set_remote_id(Some(id));
                if request.shared == Some(true) {
                    self.set_shared(true, reasons::SHARE_SUCCEEDED, "instance shared successfully");
                }
                engine::completed(self, ctx, OperationType::Create).await
            }
            Ok(Outcome::Accepted {
                resource_id,
                operation_url,
            }) => {
                metrics::record_remote_operation("provision", "accepted");
                engine::accepted(
                    self,
                    ctx,
                    OperationType::Create,
                    Some(resource_id),
                    operation_url,
                )
                .await
            }
            Err(e) => engine::remote_failure(self, ctx, OperationType::Create, "provision", e).await,
        }
    }

    async fn update(
        &mut self,
        ctx: &Reconciler,
        client: &dyn ServiceManagerClient,
    ) -> Result<Action, ReconcilerError> {
        let Some(id) = self.instance_id().map(str::to_string) else {
            return self.create(ctx, client).await;
        };
        let prepared = match self.prepare(ctx, client, OperationType::Update).await? {
            Ok(prepared) => prepared,
            Err(action) => return Ok(action),
        };
        self.record_tags(&prepared.plan.tags);
        let request = UpdateInstanceRequest {
            name: self.external_name(),
            service_plan_id: prepared.plan.plan_id,
            parameters: prepared.parameters,
            user_info: self.spec.user_info.clone(),
        };
        info!(remote_id = %id, "updating instance {}", request.name);
        match client.update_instance(&id, &request).await {
            Ok(Outcome::Done(())) => {
                metrics::record_remote_operation("update_instance", "success");
                let action = engine::completed(self, ctx, OperationType::Update).await?;
                self.sync_sharing(ctx, client).await?;
                Ok(action)
            }
            Ok(Outcome::Accepted {
                resource_id,
                operation_url,
            }) => {
                metrics::record_remote_operation("update_instance", "accepted");
                engine::accepted(
                    self,
                    ctx,
                    OperationType::Update,
                    Some(resource_id),
                    operation_url,
                )
                .await
            }
            Err(e) => {
                engine::remote_failure(self, ctx, OperationType::Update, "update_instance", e).await
            }
        }
    }

    async fn finish(
        &mut self,
        ctx: &Reconciler,
        client: &dyn ServiceManagerClient,
        op: OperationType,
    ) -> Result<Action, ReconcilerError> {
        let action = engine::mark_succeeded(self, ctx, op).await?;
        self.sync_sharing(ctx, client).await?;
        Ok(action)
    }

    async fn delete_remote(
        &self,
        client: &dyn ServiceManagerClient,
        id: &str,
    ) -> Result<Outcome<()>, SmError> {
        client.deprovision(id).await
    }

    async fn maintain(&mut self, ctx: &Reconciler) -> Result<Option<Action>, ReconcilerError> {
        if self.sharing_change().is_none() {
            return Ok(None);
        }
        let client = ctx.client_for(&self.object_namespace()).await?;
        self.sync_sharing(ctx, client.as_ref()).await?;
        Ok(None)
    }
}
