//! # Service Manager Client
//!
//! Client for the remote provisioning service.
//!
//! ## Module Structure
//!
//! - `error.rs` - `SmError`, the failure type of every remote call
//! - `query.rs` - `ListQuery`, field and label query expressions
//! - `rest.rs` - `ServiceManagerRest`, the `reqwest` implementation
//!
//! Every mutating call may complete synchronously (`Outcome::Done`) or be
//! accepted as a long-running operation (`Outcome::Accepted`) whose URL is
//! polled through [`ServiceManagerClient::status`].

mod error;
mod query;
mod rest;

pub use error::SmError;
pub use query::{ListQuery, Predicate, PredicateOp};
pub use rest::{parse_operation_location, ServiceManagerRest, ServiceManagerRestConfig};

use crate::crd::{OperationType, UserInfo};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Remote labels: each key maps to a list of values
pub type Labels = BTreeMap<String, Vec<String>>;

/// Result of a mutating remote call
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// Completed synchronously (200/201)
    Done(T),
    /// Accepted as a long-running operation (202 + Location)
    Accepted {
        /// ID of the remote resource the operation acts on
        resource_id: String,
        operation_url: String,
    },
}

/// State of a remote operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum OperationState {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
}

/// A remote long-running operation
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Operation {
    pub id: String,
    /// `create`, `update` or `delete`
    pub r#type: String,
    pub state: OperationState,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub resource_id: Option<String>,
    /// Error details of a failed operation
    #[serde(default)]
    pub errors: Option<serde_json::Value>,
}

impl Operation {
    #[must_use]
    pub fn operation_type(&self) -> Option<OperationType> {
        OperationType::parse(&self.r#type)
    }

    /// Human-readable failure details
    #[must_use]
    pub fn error_text(&self) -> String {
        match (&self.errors, &self.description) {
            (Some(errors), _) if !errors.is_null() => errors.to_string(),
            (_, Some(description)) => description.clone(),
            _ => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RemoteInstance {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub service_plan_id: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub shared: Option<bool>,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub last_operation: Option<Operation>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RemoteBinding {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub service_instance_id: String,
    #[serde(default)]
    pub ready: bool,
    /// Credentials document issued by the broker
    #[serde(default)]
    pub credentials: Option<serde_json::Value>,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub last_operation: Option<Operation>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServiceOffering {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub catalog_name: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServicePlan {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub catalog_name: String,
    #[serde(default)]
    pub service_offering_id: String,
}

/// Request body for instance provisioning
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProvisionRequest {
    pub name: String,
    pub service_plan_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
    pub labels: Labels,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
}

/// Request body for instance update
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateInstanceRequest {
    pub name: String,
    pub service_plan_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
}

/// Request body for binding creation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BindRequest {
    pub name: String,
    pub service_instance_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
    pub labels: Labels,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
}

/// Client trait for the remote provisioning service
///
/// Implementations must be cheap to share across reconciles; the controller
/// holds one per namespace behind an `Arc`.
#[async_trait]
pub trait ServiceManagerClient: Send + Sync {
    async fn provision(&self, request: &ProvisionRequest) -> Result<Outcome<String>, SmError>;

    async fn update_instance(
        &self,
        instance_id: &str,
        request: &UpdateInstanceRequest,
    ) -> Result<Outcome<()>, SmError>;

    /// Delete an instance. A 404 or 410 is reported as `Done`.
    async fn deprovision(&self, instance_id: &str) -> Result<Outcome<()>, SmError>;

    /// Share or unshare an instance
    async fn share_instance(&self, instance_id: &str, shared: bool) -> Result<(), SmError>;

    async fn bind(&self, request: &BindRequest) -> Result<Outcome<RemoteBinding>, SmError>;

    /// Delete a binding. A 404 or 410 is reported as `Done`.
    async fn unbind(&self, binding_id: &str) -> Result<Outcome<()>, SmError>;

    async fn get_binding(&self, binding_id: &str) -> Result<RemoteBinding, SmError>;

    /// Rename a binding and replace its `_k8sname` label
    async fn rename_binding(
        &self,
        binding_id: &str,
        new_name: &str,
        new_k8s_name: &str,
    ) -> Result<(), SmError>;

    async fn list_instances(&self, query: &ListQuery) -> Result<Vec<RemoteInstance>, SmError>;

    async fn list_bindings(&self, query: &ListQuery) -> Result<Vec<RemoteBinding>, SmError>;

    /// Fetch the state of a long-running operation
    async fn status(&self, operation_url: &str) -> Result<Operation, SmError>;

    async fn list_offerings(&self, query: &ListQuery) -> Result<Vec<ServiceOffering>, SmError>;

    async fn list_plans(&self, query: &ListQuery) -> Result<Vec<ServicePlan>, SmError>;
}
