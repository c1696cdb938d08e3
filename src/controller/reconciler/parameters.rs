//! # Parameters
//!
//! Builds the parameter document sent with create and update calls.
//!
//! Inline `parameters` and every `parametersFrom` secret must each be a JSON
//! object. Their top-level keys are merged, and a key defined by more than
//! one source is rejected rather than silently overridden.

use crate::crd::ParametersFromSource;
use crate::store::{ObjectStore, StoreError};
use k8s_openapi::api::core::v1::Secret;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParameterError {
    /// The user supplied parameters cannot be used as they are
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn merge_into(
    merged: &mut Map<String, Value>,
    source: &str,
    document: Value,
) -> Result<(), ParameterError> {
    let Value::Object(fields) = document else {
        return Err(ParameterError::Invalid(format!(
            "parameters from {source} must be a JSON object"
        )));
    };
    for (key, value) in fields {
        if merged.contains_key(&key) {
            return Err(ParameterError::Invalid(format!(
                "parameter {key} is defined more than once (again in {source})"
            )));
        }
        merged.insert(key, value);
    }
    Ok(())
}

async fn secret_parameters(
    secrets: &dyn ObjectStore<Secret>,
    namespace: &str,
    name: &str,
    key: &str,
) -> Result<Value, ParameterError> {
    let secret = secrets.get(namespace, name).await?.ok_or_else(|| {
        ParameterError::Invalid(format!("parameters secret {namespace}/{name} not found"))
    })?;
    let bytes = secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|b| b.0.clone())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|d| d.get(key))
                .map(|s| s.as_bytes().to_vec())
        })
        .ok_or_else(|| {
            ParameterError::Invalid(format!(
                "parameters secret {namespace}/{name} has no key {key}"
            ))
        })?;
    serde_json::from_slice(&bytes).map_err(|e| {
        ParameterError::Invalid(format!(
            "parameters secret {namespace}/{name} key {key} is not valid JSON: {e}"
        ))
    })
}

/// Merge inline parameters with `parametersFrom` secrets
///
/// Returns `None` when there are no parameters at all.
pub async fn build_parameters(
    secrets: &dyn ObjectStore<Secret>,
    namespace: &str,
    inline: Option<&Value>,
    from: &[ParametersFromSource],
) -> Result<Option<Value>, ParameterError> {
    let mut merged = Map::new();
    if let Some(inline) = inline.filter(|v| !v.is_null()) {
        merge_into(&mut merged, "spec.parameters", inline.clone())?;
    }
    for source in from {
        let Some(reference) = &source.secret_key_ref else {
            continue;
        };
        let document =
            secret_parameters(secrets, namespace, &reference.name, &reference.key).await?;
        merge_into(
            &mut merged,
            &format!("secret {}/{}", reference.name, reference.key),
            document,
        )?;
    }
    Ok((!merged.is_empty()).then_some(Value::Object(merged)))
}
