//! # Credential Normalization
//!
//! Flattens a remote credential document into secret keys.
//!
//! Top-level string values are stored as-is. Every other value is stored as
//! its JSON encoding, so `{"port": 27017, "hosts": ["a"]}` becomes the keys
//! `port=27017` and `hosts=["a"]`. The secret metadata document records which
//! keys hold JSON so consumers know to parse them.

use serde::{Deserialize, Serialize};

/// How a secret value is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyFormat {
    Text,
    Json,
}

/// One entry of the secret metadata document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyMeta {
    pub name: String,
    pub format: PropertyFormat,
    /// The value is the whole credential document under a single key
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub container: bool,
}

impl PropertyMeta {
    pub fn new(name: impl Into<String>, format: PropertyFormat) -> Self {
        Self {
            name: name.into(),
            format,
            container: false,
        }
    }
}

/// Document stored under the `.metadata` key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretMetadata {
    pub credential_properties: Vec<PropertyMeta>,
    #[serde(rename = "metaDataProperties")]
    pub metadata_properties: Vec<PropertyMeta>,
}

/// A single flattened value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatValue {
    pub key: String,
    pub bytes: Vec<u8>,
    pub format: PropertyFormat,
}

/// Encode one value: strings verbatim, anything else as JSON
#[must_use]
pub fn flatten_value(key: &str, value: &serde_json::Value) -> FlatValue {
    match value {
        serde_json::Value::String(s) => FlatValue {
            key: key.to_string(),
            bytes: s.as_bytes().to_vec(),
            format: PropertyFormat::Text,
        },
        other => FlatValue {
            key: key.to_string(),
            bytes: serde_json::to_vec(other).unwrap_or_default(),
            format: PropertyFormat::Json,
        },
    }
}

/// Flatten the top-level keys of a credential object
///
/// Returns `None` when the document is not a JSON object.
#[must_use]
pub fn normalize_credentials(credentials: &serde_json::Value) -> Option<Vec<FlatValue>> {
    let fields = credentials.as_object()?;
    Some(
        fields
            .iter()
            .map(|(key, value)| flatten_value(key, value))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strings_stay_unquoted_and_nested_values_are_json() {
        let flat = normalize_credentials(&serde_json::json!({
            "username": "admin",
            "port": 27017,
            "hosts": ["a", "b"],
            "tls": {"enabled": true}
        }))
        .unwrap();

        let get = |k: &str| flat.iter().find(|f| f.key == k).unwrap();
        assert_eq!(get("username").bytes, b"admin");
        assert_eq!(get("username").format, PropertyFormat::Text);
        assert_eq!(get("port").bytes, b"27017");
        assert_eq!(get("hosts").bytes, br#"["a","b"]"#);
        assert_eq!(get("tls").format, PropertyFormat::Json);
    }

    #[test]
    fn test_non_object_credentials_are_rejected() {
        assert!(normalize_credentials(&serde_json::json!("token")).is_none());
    }

    #[test]
    fn test_metadata_document_shape() {
        let doc = SecretMetadata {
            credential_properties: vec![PropertyMeta {
                name: "creds".to_string(),
                format: PropertyFormat::Json,
                container: true,
            }],
            metadata_properties: vec![PropertyMeta::new("plan", PropertyFormat::Text)],
        };
        assert_eq!(
            serde_json::to_value(&doc).unwrap(),
            serde_json::json!({
                "credentialProperties": [{"name": "creds", "format": "json", "container": true}],
                "metaDataProperties": [{"name": "plan", "format": "text"}]
            })
        );
    }
}
