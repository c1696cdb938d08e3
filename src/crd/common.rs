//! # Shared Spec Types
//!
//! Types used by both `ServiceInstance` and `ServiceBinding` specs.

use serde::{Deserialize, Serialize};

/// A source of request parameters stored outside the resource
///
/// The referenced secret key must hold a JSON object. Its top-level keys are
/// merged with the inline `parameters`; a key may appear in only one source.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ParametersFromSource {
    /// Secret in the resource namespace holding the parameters
    #[serde(default)]
    pub secret_key_ref: Option<SecretKeyReference>,
}

/// Reference to one key of a Secret in the resource namespace
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyReference {
    pub name: String,
    pub key: String,
}

/// Snapshot of the user who last modified the resource, forwarded to the remote system
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}
