//! # Remote Credentials
//!
//! Resolves the credentials of the remote provisioning service for a
//! namespace and hands out clients built from them.
//!
//! The well-known credentials secret is looked up in this order:
//!
//! 1. the resource namespace
//! 2. `<namespace>-<secret name>` in the management namespace
//! 3. the release namespace (cluster-wide default)

use crate::sm::{ServiceManagerClient, ServiceManagerRest, ServiceManagerRestConfig};
use crate::store::{ObjectStore, StoreError};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use zeroize::Zeroizing;

const CLIENT_ID_KEY: &str = "clientid";
const CLIENT_SECRET_KEY: &str = "clientsecret";
const SM_URL_KEY: &str = "sm_url";
const TOKEN_URL_KEY: &str = "tokenurl";

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("no service manager credentials secret found for namespace {0}")]
    NotFound(String),
    #[error("credentials secret {secret} is missing key {key}")]
    MissingKey { secret: String, key: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to create service manager client: {0}")]
    Client(String),
}

/// Finds the credentials secret for a namespace
pub struct SecretResolver {
    secrets: Arc<dyn ObjectStore<Secret>>,
    secret_name: String,
    management_namespace: String,
    release_namespace: String,
}

impl std::fmt::Debug for SecretResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretResolver")
            .field("secret_name", &self.secret_name)
            .field("management_namespace", &self.management_namespace)
            .field("release_namespace", &self.release_namespace)
            .finish_non_exhaustive()
    }
}

impl SecretResolver {
    pub fn new(
        secrets: Arc<dyn ObjectStore<Secret>>,
        secret_name: impl Into<String>,
        management_namespace: impl Into<String>,
        release_namespace: impl Into<String>,
    ) -> Self {
        Self {
            secrets,
            secret_name: secret_name.into(),
            management_namespace: management_namespace.into(),
            release_namespace: release_namespace.into(),
        }
    }

    /// Candidate `(namespace, name)` locations in lookup order
    #[must_use]
    pub fn candidates(&self, namespace: &str) -> Vec<(String, String)> {
        vec![
            (namespace.to_string(), self.secret_name.clone()),
            (
                self.management_namespace.clone(),
                format!("{}-{}", namespace, self.secret_name),
            ),
            (self.release_namespace.clone(), self.secret_name.clone()),
        ]
    }

    /// Find the credentials secret for `namespace`
    pub async fn resolve(&self, namespace: &str) -> Result<Secret, CredentialsError> {
        for (ns, name) in self.candidates(namespace) {
            if let Some(secret) = self.secrets.get(&ns, &name).await? {
                debug!("Using service manager credentials {}/{}", ns, name);
                return Ok(secret);
            }
        }
        Err(CredentialsError::NotFound(namespace.to_string()))
    }

    /// Resolve and parse the connection settings for `namespace`
    pub async fn settings(
        &self,
        namespace: &str,
    ) -> Result<ServiceManagerRestConfig, CredentialsError> {
        let secret = self.resolve(namespace).await?;
        parse_settings(&secret)
    }
}

fn value(secret: &Secret, key: &str) -> Result<String, CredentialsError> {
    let from_data = secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .and_then(|v| String::from_utf8(v.0.clone()).ok());
    let from_string_data = || secret.string_data.as_ref().and_then(|d| d.get(key)).cloned();
    from_data
        .or_else(from_string_data)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CredentialsError::MissingKey {
            secret: crate::store::object_key(secret),
            key: key.to_string(),
        })
}

/// Parse connection settings from a credentials secret
pub fn parse_settings(secret: &Secret) -> Result<ServiceManagerRestConfig, CredentialsError> {
    Ok(ServiceManagerRestConfig {
        sm_url: value(secret, SM_URL_KEY)?,
        token_url: value(secret, TOKEN_URL_KEY)?,
        client_id: value(secret, CLIENT_ID_KEY)?,
        client_secret: Zeroizing::new(value(secret, CLIENT_SECRET_KEY)?),
    })
}

fn fingerprint(settings: &ServiceManagerRestConfig) -> String {
    let mut hasher = Sha256::new();
    hasher.update(settings.sm_url.as_bytes());
    hasher.update(settings.token_url.as_bytes());
    hasher.update(settings.client_id.as_bytes());
    hasher.update(settings.client_secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Hands out a remote client for a namespace
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn client_for(
        &self,
        namespace: &str,
    ) -> Result<Arc<dyn ServiceManagerClient>, CredentialsError>;
}

/// Builds REST clients from resolved credentials and reuses them while the
/// credentials stay the same
pub struct RestClientFactory {
    resolver: SecretResolver,
    clients: Mutex<HashMap<String, (String, Arc<dyn ServiceManagerClient>)>>,
}

impl std::fmt::Debug for RestClientFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClientFactory")
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

impl RestClientFactory {
    #[must_use]
    pub fn new(resolver: SecretResolver) -> Self {
        Self {
            resolver,
            clients: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ClientFactory for RestClientFactory {
    async fn client_for(
        &self,
        namespace: &str,
    ) -> Result<Arc<dyn ServiceManagerClient>, CredentialsError> {
        let settings = self.resolver.settings(namespace).await?;
        let print = fingerprint(&settings);

        let mut clients = self.clients.lock().await;
        if let Some((cached_print, client)) = clients.get(namespace) {
            if *cached_print == print {
                return Ok(Arc::clone(client));
            }
        }

        info!("Creating service manager client for namespace {}", namespace);
        let client: Arc<dyn ServiceManagerClient> = Arc::new(
            ServiceManagerRest::new(settings)
                .map_err(|e| CredentialsError::Client(e.to_string()))?,
        );
        clients.insert(namespace.to_string(), (print, Arc::clone(&client)));
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn secret(data: &[(&str, &str)]) -> Secret {
        let mut secret = Secret::default();
        secret.metadata.name = Some("service-manager-credentials".to_string());
        secret.metadata.namespace = Some("shop".to_string());
        secret.data = Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect::<BTreeMap<_, _>>(),
        );
        secret
    }

    #[test]
    fn test_parse_settings() {
        let settings = parse_settings(&secret(&[
            ("clientid", "id"),
            ("clientsecret", "s3cret"),
            ("sm_url", "https://sm"),
            ("tokenurl", "https://uaa"),
        ]))
        .unwrap();
        assert_eq!(settings.client_id, "id");
        assert_eq!(settings.client_secret.as_str(), "s3cret");
        assert_eq!(settings.sm_url, "https://sm");
    }

    #[test]
    fn test_parse_settings_reports_missing_key() {
        let err = parse_settings(&secret(&[("clientid", "id")])).unwrap_err();
        assert!(err.to_string().contains("missing key"));
    }

    #[test]
    fn test_fingerprint_changes_with_secret() {
        let mut settings = parse_settings(&secret(&[
            ("clientid", "id"),
            ("clientsecret", "a"),
            ("sm_url", "https://sm"),
            ("tokenurl", "https://uaa"),
        ]))
        .unwrap();
        let first = fingerprint(&settings);
        settings.client_secret = Zeroizing::new("b".to_string());
        assert_ne!(first, fingerprint(&settings));
    }
}
