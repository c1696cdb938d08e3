//! # ServiceBinding
//!
//! Credentials for one `ServiceInstance`, materialized as a Secret.

use crate::crd::{Condition, OperationType, ParametersFromSource, UserInfo};
use serde::{Deserialize, Serialize};

/// ServiceBinding Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: services.operator.io/v1
/// kind: ServiceBinding
/// metadata:
///   name: orders-db-creds
///   namespace: shop
/// spec:
///   serviceInstanceName: orders-db
///   secretName: orders-db-creds
///   credRotationPolicy:
///     enabled: true
///     rotationFrequency: 720h
///     rotatedBindingTTL: 24h
/// ```
#[derive(kube::CustomResource, Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "ServiceBinding",
    group = "services.operator.io",
    version = "v1",
    namespaced,
    status = "ServiceBindingStatus",
    shortname = "sb",
    printcolumn = r#"{"name":"Instance", "type":"string", "jsonPath":".spec.serviceInstanceName"}, {"name":"Status", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Succeeded\")].reason"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingSpec {
    /// Name of the instance to bind to
    pub service_instance_name: String,
    /// Namespace of the instance (defaults to the binding namespace)
    #[serde(default)]
    pub service_instance_namespace: Option<String>,
    /// Display name in the remote system (defaults to the resource name)
    #[serde(default)]
    pub external_name: Option<String>,
    /// Name of the Secret holding the credentials (defaults to the resource name)
    #[serde(default)]
    pub secret_name: Option<String>,
    /// Store the raw credentials document under this single key
    #[serde(default)]
    pub secret_key: Option<String>,
    /// Store all computed keys as one JSON object under this key
    #[serde(default)]
    pub secret_root_key: Option<String>,
    /// Template rendering the Secret from `credentials` and `instance`
    #[serde(default)]
    pub secret_template: Option<String>,
    /// Binding parameters passed to the remote system as-is
    #[serde(default)]
    #[schemars(schema_with = "crate::crd::preserve_unknown_fields")]
    pub parameters: Option<serde_json::Value>,
    /// Secrets whose JSON content is merged into `parameters`
    #[serde(default)]
    pub parameters_from: Vec<ParametersFromSource>,
    /// Last modifying user, filled by admission
    #[serde(default)]
    pub user_info: Option<UserInfo>,
    #[serde(default)]
    pub cred_rotation_policy: Option<CredentialRotationPolicy>,
}

/// Credential rotation policy
///
/// Durations use the Kubernetes format (`30s`, `15m`, `24h`, `7d`).
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRotationPolicy {
    #[serde(default)]
    pub enabled: bool,
    /// How often new credentials are issued
    #[serde(default)]
    pub rotation_frequency: String,
    /// How long the previous credentials stay valid after a rotation
    #[serde(default, rename = "rotatedBindingTTL")]
    pub rotated_binding_ttl: String,
}

/// ServiceBinding status
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingStatus {
    /// Remote ID of the bound instance
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Remote binding ID, empty until created or recovered
    #[serde(default)]
    pub binding_id: Option<String>,
    #[serde(default)]
    pub operation_url: Option<String>,
    #[serde(default)]
    pub operation_type: Option<OperationType>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub ready: bool,
    /// Time of the last completed credential rotation (RFC3339)
    #[serde(default)]
    pub last_credentials_rotation_time: Option<String>,
    /// Suffix of the stale names while a rotation is under way
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_suffix: Option<String>,
}

impl ServiceBinding {
    #[must_use]
    pub fn external_name(&self) -> String {
        match self.spec.external_name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.metadata.name.clone().unwrap_or_default(),
        }
    }

    /// Name of the Secret the credentials are written to
    #[must_use]
    pub fn secret_name(&self) -> String {
        match self.spec.secret_name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.metadata.name.clone().unwrap_or_default(),
        }
    }

    /// Namespace of the referenced instance
    #[must_use]
    pub fn instance_namespace(&self) -> String {
        match self.spec.service_instance_namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns.to_string(),
            _ => self.metadata.namespace.clone().unwrap_or_default(),
        }
    }

    #[must_use]
    pub fn binding_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.binding_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    /// Whether this binding is a leftover of a credential rotation
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.metadata
            .labels
            .as_ref()
            .is_some_and(|l| l.contains_key(crate::constants::STALE_BINDING_ID_LABEL))
    }

    #[must_use]
    pub fn rotation_enabled(&self) -> bool {
        self.spec
            .cred_rotation_policy
            .as_ref()
            .is_some_and(|p| p.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_policy_uses_ttl_spelling() {
        let policy: CredentialRotationPolicy = serde_json::from_value(serde_json::json!({
            "enabled": true,
            "rotationFrequency": "1h",
            "rotatedBindingTTL": "10m"
        }))
        .unwrap();
        assert!(policy.enabled);
        assert_eq!(policy.rotated_binding_ttl, "10m");
    }

    #[test]
    fn test_secret_name_and_instance_namespace_defaults() {
        let mut binding = ServiceBinding::new(
            "creds",
            serde_json::from_value(serde_json::json!({"serviceInstanceName": "db"})).unwrap(),
        );
        binding.metadata.namespace = Some("shop".to_string());
        assert_eq!(binding.secret_name(), "creds");
        assert_eq!(binding.instance_namespace(), "shop");
        assert!(!binding.is_stale());
        assert!(!binding.rotation_enabled());
    }
}
