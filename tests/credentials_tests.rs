//! # Credentials Resolution Tests
//!
//! Lookup order of the service manager credentials secret.

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use service_manager_controller::credentials::{CredentialsError, SecretResolver};
use service_manager_controller::store::ObjectStore;
use service_manager_controller::testing::MemoryStore;
use std::collections::BTreeMap;
use std::sync::Arc;

const SECRET_NAME: &str = "service-manager-credentials";

fn credentials(namespace: &str, name: &str, client_id: &str) -> Secret {
    let mut secret = Secret::default();
    secret.metadata.name = Some(name.to_string());
    secret.metadata.namespace = Some(namespace.to_string());
    let data: BTreeMap<String, ByteString> = [
        ("clientid", client_id),
        ("clientsecret", "s3cret"),
        ("sm_url", "https://sm.example.com"),
        ("tokenurl", "https://uaa.example.com"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
    .collect();
    secret.data = Some(data);
    secret
}

fn resolver(secrets: &Arc<MemoryStore<Secret>>) -> SecretResolver {
    SecretResolver::new(
        Arc::<MemoryStore<Secret>>::clone(secrets) as Arc<dyn ObjectStore<Secret>>,
        SECRET_NAME,
        "operator-mgmt",
        "operator",
    )
}

#[tokio::test]
async fn test_namespace_secret_wins() {
    let secrets = Arc::new(MemoryStore::<Secret>::new());
    secrets.insert(credentials("shop", SECRET_NAME, "local"));
    secrets.insert(credentials(
        "operator-mgmt",
        &format!("shop-{SECRET_NAME}"),
        "managed",
    ));
    secrets.insert(credentials("operator", SECRET_NAME, "cluster"));

    let settings = resolver(&secrets).settings("shop").await.unwrap();
    assert_eq!(settings.client_id, "local");
}

#[tokio::test]
async fn test_management_namespace_before_cluster_default() {
    let secrets = Arc::new(MemoryStore::<Secret>::new());
    secrets.insert(credentials(
        "operator-mgmt",
        &format!("shop-{SECRET_NAME}"),
        "managed",
    ));
    secrets.insert(credentials("operator", SECRET_NAME, "cluster"));

    let settings = resolver(&secrets).settings("shop").await.unwrap();
    assert_eq!(settings.client_id, "managed");

    let other = resolver(&secrets).settings("billing").await.unwrap();
    assert_eq!(other.client_id, "cluster");
}

#[tokio::test]
async fn test_missing_credentials_are_reported() {
    let secrets = Arc::new(MemoryStore::<Secret>::new());
    let err = resolver(&secrets).resolve("shop").await.unwrap_err();
    assert!(matches!(err, CredentialsError::NotFound(ns) if ns == "shop"));
}

#[test]
fn test_candidates_follow_lookup_order() {
    let secrets = Arc::new(MemoryStore::<Secret>::new());
    let candidates = resolver(&secrets).candidates("shop");
    assert_eq!(
        candidates,
        vec![
            ("shop".to_string(), SECRET_NAME.to_string()),
            ("operator-mgmt".to_string(), format!("shop-{SECRET_NAME}")),
            ("operator".to_string(), SECRET_NAME.to_string()),
        ]
    );
}
