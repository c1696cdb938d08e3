//! # ServiceInstance
//!
//! A remote provisioned resource tracked by a local custom resource.

use crate::crd::{Condition, OperationType, ParametersFromSource, UserInfo};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// ServiceInstance Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: services.operator.io/v1
/// kind: ServiceInstance
/// metadata:
///   name: orders-db
///   namespace: shop
/// spec:
///   serviceOfferingName: mongo
///   servicePlanName: small
///   parameters:
///     storageGB: 10
/// ```
#[derive(kube::CustomResource, Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "ServiceInstance",
    group = "services.operator.io",
    version = "v1",
    namespaced,
    status = "ServiceInstanceStatus",
    shortname = "si",
    printcolumn = r#"{"name":"Offering", "type":"string", "jsonPath":".spec.serviceOfferingName"}, {"name":"Plan", "type":"string", "jsonPath":".spec.servicePlanName"}, {"name":"Status", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Succeeded\")].reason"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceSpec {
    /// Catalog name of the offering
    pub service_offering_name: String,
    /// Catalog name of the plan within the offering
    pub service_plan_name: String,
    /// Plan ID, used to disambiguate plans sharing a catalog name
    #[serde(default)]
    pub service_plan_id: Option<String>,
    /// Display name in the remote system (defaults to the resource name)
    #[serde(default)]
    pub external_name: Option<String>,
    /// Provisioning parameters passed to the remote system as-is
    #[serde(default)]
    #[schemars(schema_with = "crate::crd::preserve_unknown_fields")]
    pub parameters: Option<serde_json::Value>,
    /// Secrets whose JSON content is merged into `parameters`
    #[serde(default)]
    pub parameters_from: Vec<ParametersFromSource>,
    /// Share the instance with other environments of the same subaccount
    #[serde(default)]
    pub shared: Option<bool>,
    /// Tags added to the offering tags in binding secrets
    #[serde(default)]
    pub custom_tags: Vec<String>,
    /// Last modifying user, filled by admission
    #[serde(default)]
    pub user_info: Option<UserInfo>,
}

/// ServiceInstance status
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceStatus {
    /// Remote instance ID, empty until created or recovered
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Tags mirrored from the remote offering
    #[serde(default)]
    pub tags: Vec<String>,
    /// URL of the ongoing remote operation
    #[serde(default)]
    pub operation_url: Option<String>,
    /// Type of the ongoing remote operation
    #[serde(default)]
    pub operation_type: Option<OperationType>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Spec generation last acted upon
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub ready: bool,
    /// Content hash of the spec at the last remote create or update
    #[serde(default)]
    pub hash_spec: Option<String>,
}

impl ServiceInstance {
    /// Display name in the remote system
    #[must_use]
    pub fn external_name(&self) -> String {
        match self.spec.external_name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.metadata.name.clone().unwrap_or_default(),
        }
    }

    /// Remote instance ID, if known
    #[must_use]
    pub fn instance_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.instance_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    /// Whether the instance reached Ready in the remote system
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.ready)
    }

    /// Hex SHA-256 of the spec, excluding the audit snapshot
    ///
    /// Metadata-only edits bump the generation without changing this value,
    /// which lets the reconciler skip remote updates that would be no-ops.
    #[must_use]
    pub fn spec_hash(&self) -> String {
        let mut spec = self.spec.clone();
        spec.user_info = None;
        let bytes = serde_json::to_vec(&spec).unwrap_or_default();
        format!("{:x}", Sha256::digest(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> ServiceInstance {
        let mut instance = ServiceInstance::new(
            "orders-db",
            ServiceInstanceSpec {
                service_offering_name: "mongo".to_string(),
                service_plan_name: "small".to_string(),
                service_plan_id: None,
                external_name: None,
                parameters: None,
                parameters_from: vec![],
                shared: None,
                custom_tags: vec![],
                user_info: None,
            },
        );
        instance.metadata.namespace = Some("shop".to_string());
        instance
    }

    #[test]
    fn test_external_name_defaults_to_resource_name() {
        let mut instance = instance();
        assert_eq!(instance.external_name(), "orders-db");
        instance.spec.external_name = Some("orders-prod".to_string());
        assert_eq!(instance.external_name(), "orders-prod");
    }

    #[test]
    fn test_spec_hash_ignores_user_info() {
        let mut instance = instance();
        let before = instance.spec_hash();
        instance.spec.user_info = Some(UserInfo {
            username: "alice".to_string(),
            ..Default::default()
        });
        assert_eq!(before, instance.spec_hash());

        instance.spec.service_plan_name = "large".to_string();
        assert_ne!(before, instance.spec_hash());
    }

    #[test]
    fn test_empty_instance_id_is_unknown() {
        let mut instance = instance();
        instance.status = Some(ServiceInstanceStatus {
            instance_id: Some(String::new()),
            ..Default::default()
        });
        assert_eq!(instance.instance_id(), None);
    }
}
