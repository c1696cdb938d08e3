//! # Secret Materializer
//!
//! Turns remote binding credentials into the Secret of a `ServiceBinding`.
//!
//! ## Strategies
//!
//! - **default** - every credential key becomes a secret key (see [`normalize`])
//! - **`secretKey`** - the whole credential document, JSON encoded, under one key
//! - **`secretRootKey`** - credentials plus instance metadata as one JSON object under one key
//! - **template** - a user supplied manifest (see [`template`]); renders with no
//!   data fall back to the default strategy but keep their labels and annotations
//!
//! Except for `secretRootKey`, instance metadata keys are added next to the
//! credentials and a `.metadata` document lists every key with its origin
//! and encoding.

pub mod normalize;
pub mod template;

use crate::constants::{SECRET_BINDING_LABEL, SECRET_METADATA_KEY};
use crate::crd::{ServiceBinding, ServiceBindingSpec};
use crate::store::{ObjectStore, StoreError};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::Resource;
use normalize::{flatten_value, normalize_credentials, PropertyFormat, PropertyMeta, SecretMetadata};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SecretError {
    /// The credentials or the template cannot produce a valid secret
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Instance metadata injected into every secret
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InstanceInfo {
    pub instance_name: String,
    pub instance_guid: String,
    pub plan: String,
    /// Offering name
    pub offering: String,
    pub tags: Vec<String>,
}

impl InstanceInfo {
    /// Computed keys in the order they are written
    #[must_use]
    pub fn entries(&self) -> Vec<(&'static str, serde_json::Value)> {
        vec![
            ("instance_name", serde_json::json!(self.instance_name)),
            ("instance_guid", serde_json::json!(self.instance_guid)),
            ("plan", serde_json::json!(self.plan)),
            ("label", serde_json::json!(self.offering)),
            ("type", serde_json::json!(self.offering)),
            ("tags", serde_json::json!(self.tags)),
        ]
    }

    pub(crate) fn template_value(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.entries()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }
}

/// Materialized secret payload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecretContent {
    pub data: BTreeMap<String, Vec<u8>>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|v| !v.is_empty())
}

/// Build the secret payload for a binding
pub fn render_content(
    spec: &ServiceBindingSpec,
    credentials: &serde_json::Value,
    instance: &InstanceInfo,
) -> Result<SecretContent, SecretError> {
    if let Some(template) = non_empty(spec.secret_template.as_ref()) {
        let rendered = template::render_secret_template(template, credentials, instance)?;
        if !rendered.data.is_empty() {
            return Ok(rendered);
        }
        debug!("secret template rendered no data, using normalized credentials");
        let mut content = keyed_content(spec, credentials, instance)?;
        content.labels = rendered.labels;
        content.annotations = rendered.annotations;
        return Ok(content);
    }
    keyed_content(spec, credentials, instance)
}

fn keyed_content(
    spec: &ServiceBindingSpec,
    credentials: &serde_json::Value,
    instance: &InstanceInfo,
) -> Result<SecretContent, SecretError> {
    let secret_key = non_empty(spec.secret_key.as_ref());
    let root_key = non_empty(spec.secret_root_key.as_ref());

    let mut content = SecretContent::default();
    let mut metadata = SecretMetadata::default();
    match (secret_key, root_key) {
        (Some(_), Some(_)) => {
            return Err(SecretError::Invalid(
                "secretKey and secretRootKey are mutually exclusive".to_string(),
            ))
        }
        (None, Some(root)) => {
            let mut document = credentials.as_object().cloned().ok_or_else(|| {
                SecretError::Invalid("binding credentials are not a JSON object".to_string())
            })?;
            for (key, value) in instance.entries() {
                document.entry(key.to_string()).or_insert(value);
            }
            let bytes = serde_json::to_vec(&document)
                .map_err(|e| SecretError::Invalid(format!("failed to encode credentials: {e}")))?;
            content.data.insert(root.to_string(), bytes);
            return Ok(content);
        }
        (Some(key), None) => {
            let bytes = serde_json::to_vec(credentials)
                .map_err(|e| SecretError::Invalid(format!("failed to encode credentials: {e}")))?;
            content.data.insert(key.to_string(), bytes);
            metadata.credential_properties.push(PropertyMeta {
                name: key.to_string(),
                format: PropertyFormat::Json,
                container: true,
            });
        }
        (None, None) => {
            let flat = normalize_credentials(credentials).ok_or_else(|| {
                SecretError::Invalid("binding credentials are not a JSON object".to_string())
            })?;
            for value in flat {
                metadata
                    .credential_properties
                    .push(PropertyMeta::new(&value.key, value.format));
                content.data.insert(value.key, value.bytes);
            }
        }
    }

    for (key, value) in instance.entries() {
        if content.data.contains_key(key) {
            continue;
        }
        let flat = flatten_value(key, &value);
        metadata
            .metadata_properties
            .push(PropertyMeta::new(key, flat.format));
        content.data.insert(flat.key, flat.bytes);
    }
    let document = serde_json::to_vec(&metadata)
        .map_err(|e| SecretError::Invalid(format!("failed to encode secret metadata: {e}")))?;
    content.data.insert(SECRET_METADATA_KEY.to_string(), document);
    Ok(content)
}

/// Name of the binding a secret belongs to, from its label
#[must_use]
pub fn secret_owner(secret: &Secret) -> Option<&str> {
    secret
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(SECRET_BINDING_LABEL))
        .map(String::as_str)
}

fn build_secret(binding: &ServiceBinding, content: SecretContent) -> Secret {
    let binding_name = binding.metadata.name.clone().unwrap_or_default();
    let mut labels = content.labels;
    labels.insert(SECRET_BINDING_LABEL.to_string(), binding_name);

    let mut secret = Secret::default();
    secret.metadata.name = Some(binding.secret_name());
    secret.metadata.namespace = binding.metadata.namespace.clone();
    secret.metadata.labels = Some(labels);
    if !content.annotations.is_empty() {
        secret.metadata.annotations = Some(content.annotations);
    }
    secret.metadata.owner_references = binding.controller_owner_ref(&()).map(|r| vec![r]);
    secret.data = Some(
        content
            .data
            .into_iter()
            .map(|(k, v)| (k, ByteString(v)))
            .collect(),
    );
    secret
}

/// Create or replace the binding's secret
///
/// A concurrent create of the same secret is treated as done: the existing
/// object is replaced with this content.
pub async fn write_secret(
    secrets: &dyn ObjectStore<Secret>,
    binding: &ServiceBinding,
    content: SecretContent,
) -> Result<Secret, SecretError> {
    let namespace = binding.metadata.namespace.clone().unwrap_or_default();
    let mut desired = build_secret(binding, content);
    let name = binding.secret_name();

    let existing = match secrets.get(&namespace, &name).await? {
        Some(existing) => existing,
        None => match secrets.create(&desired).await {
            Ok(created) => {
                info!(secret = %name, "created binding secret");
                return Ok(created);
            }
            Err(StoreError::AlreadyExists(_)) => {
                debug!(secret = %name, "secret was created concurrently, replacing it");
                secrets.get(&namespace, &name).await?.ok_or_else(|| StoreError::NotFound {
                    kind: "Secret".to_string(),
                    namespace: namespace.clone(),
                    name: name.clone(),
                })?
            }
            Err(e) => return Err(e.into()),
        },
    };
    desired.metadata.resource_version = existing.metadata.resource_version;
    let replaced = secrets.replace(&desired).await?;
    debug!(secret = %name, "updated binding secret");
    Ok(replaced)
}

/// Delete the binding's secret when it belongs to this binding
pub async fn delete_secret(
    secrets: &dyn ObjectStore<Secret>,
    binding: &ServiceBinding,
) -> Result<(), StoreError> {
    let namespace = binding.metadata.namespace.as_deref().unwrap_or_default();
    let name = binding.secret_name();
    let Some(secret) = secrets.get(namespace, &name).await? else {
        return Ok(());
    };
    if secret_owner(&secret) != binding.metadata.name.as_deref() {
        debug!(secret = %name, "secret belongs to another binding, leaving it");
        return Ok(());
    }
    secrets.delete(namespace, &name).await?;
    info!(secret = %name, "deleted binding secret");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(extra: serde_json::Value) -> ServiceBindingSpec {
        let mut base = serde_json::json!({"serviceInstanceName": "db"});
        if let (Some(base), Some(extra)) = (base.as_object_mut(), extra.as_object()) {
            base.extend(extra.clone());
        }
        serde_json::from_value(base).unwrap()
    }

    fn instance() -> InstanceInfo {
        InstanceInfo {
            instance_name: "orders-db".to_string(),
            instance_guid: "instance-1".to_string(),
            plan: "small".to_string(),
            offering: "mongo".to_string(),
            tags: vec!["mongo".to_string(), "nosql".to_string()],
        }
    }

    fn credentials() -> serde_json::Value {
        serde_json::json!({"username": "admin", "port": 27017, "plan": "from-broker"})
    }

    fn metadata_of(content: &SecretContent) -> SecretMetadata {
        serde_json::from_slice(&content.data[SECRET_METADATA_KEY]).unwrap()
    }

    #[test]
    fn test_default_strategy_adds_instance_keys_without_overriding_credentials() {
        let content = render_content(&spec(serde_json::json!({})), &credentials(), &instance())
            .unwrap();
        assert_eq!(content.data["username"], b"admin");
        assert_eq!(content.data["plan"], b"from-broker");
        assert_eq!(content.data["instance_guid"], b"instance-1");
        assert_eq!(content.data["tags"], br#"["mongo","nosql"]"#);

        let metadata = metadata_of(&content);
        assert_eq!(metadata.credential_properties.len(), 3);
        assert!(metadata
            .metadata_properties
            .iter()
            .all(|p| p.name != "plan"));
        assert!(metadata
            .metadata_properties
            .contains(&PropertyMeta::new("tags", PropertyFormat::Json)));
    }

    #[test]
    fn test_secret_key_holds_the_exact_credential_document() {
        let content = render_content(
            &spec(serde_json::json!({"secretKey": "creds"})),
            &credentials(),
            &instance(),
        )
        .unwrap();
        let decoded: serde_json::Value = serde_json::from_slice(&content.data["creds"]).unwrap();
        assert_eq!(decoded, credentials());
        assert!(!content.data.contains_key("username"));
        assert!(metadata_of(&content).credential_properties[0].container);
    }

    #[test]
    fn test_root_key_nests_everything_without_metadata_document() {
        let content = render_content(
            &spec(serde_json::json!({"secretRootKey": "binding"})),
            &credentials(),
            &instance(),
        )
        .unwrap();
        assert_eq!(content.data.len(), 1);
        let decoded: serde_json::Value = serde_json::from_slice(&content.data["binding"]).unwrap();
        assert_eq!(decoded["username"], "admin");
        assert_eq!(decoded["instance_name"], "orders-db");
        assert_eq!(decoded["tags"], serde_json::json!(["mongo", "nosql"]));
    }

    #[test]
    fn test_secret_key_and_root_key_are_exclusive() {
        let err = render_content(
            &spec(serde_json::json!({"secretKey": "a", "secretRootKey": "b"})),
            &credentials(),
            &instance(),
        )
        .unwrap_err();
        assert!(matches!(err, SecretError::Invalid(_)));
    }

    #[test]
    fn test_template_without_data_falls_back_and_keeps_labels() {
        let content = render_content(
            &spec(serde_json::json!({
                "secretTemplate": "kind: Secret\nmetadata:\n  labels:\n    team: shop\n"
            })),
            &credentials(),
            &instance(),
        )
        .unwrap();
        assert_eq!(content.data["username"], b"admin");
        assert_eq!(content.labels["team"], "shop");
    }
}
