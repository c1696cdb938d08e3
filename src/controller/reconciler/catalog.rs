//! # Catalog Lookup
//!
//! Resolves an offering and plan name to the remote plan ID.

use crate::sm::{ListQuery, ServiceManagerClient, SmError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Remote(#[from] SmError),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Ambiguous(String),
}

/// Plan and offering a request is made against
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPlan {
    pub plan_id: String,
    pub offering_id: String,
    /// Offering tags, mirrored into the instance status
    pub tags: Vec<String>,
}

/// Resolve `offering`/`plan` to remote IDs
///
/// When `plan_id` is given it must belong to the named offering.
pub async fn resolve_plan(
    client: &dyn ServiceManagerClient,
    offering: &str,
    plan: &str,
    plan_id: Option<&str>,
) -> Result<ResolvedPlan, CatalogError> {
    let mut offerings = client
        .list_offerings(&ListQuery::new().field_eq("catalog_name", offering))
        .await?;
    let offering_entry = match offerings.len() {
        0 => {
            return Err(CatalogError::NotFound(format!(
                "couldn't find the service offering '{offering}'"
            )))
        }
        1 => offerings.remove(0),
        n => {
            return Err(CatalogError::Ambiguous(format!(
                "found {n} service offerings named '{offering}'"
            )))
        }
    };

    let mut query = ListQuery::new()
        .field_eq("catalog_name", plan)
        .field_eq("service_offering_id", &offering_entry.id);
    if let Some(id) = plan_id.filter(|id| !id.is_empty()) {
        query = query.field_eq("id", id);
    }
    let mut plans = client.list_plans(&query).await?;
    let plan_entry = match plans.len() {
        0 => {
            return Err(CatalogError::NotFound(format!(
                "couldn't find the service plan '{plan}' for the service offering '{offering}'"
            )))
        }
        1 => plans.remove(0),
        n => {
            return Err(CatalogError::Ambiguous(format!(
                "found {n} service plans named '{plan}' for the service offering '{offering}', set servicePlanID"
            )))
        }
    };

    Ok(ResolvedPlan {
        plan_id: plan_entry.id,
        offering_id: offering_entry.id,
        tags: offering_entry.tags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeServiceManager;

    #[tokio::test]
    async fn test_resolves_plan_and_tags() {
        let fake = FakeServiceManager::new();
        let resolved = resolve_plan(&fake, "mongo", "small", None).await.unwrap();
        assert_eq!(resolved.plan_id, "plan-mongo-small");
        assert_eq!(resolved.offering_id, "offering-mongo");
        assert_eq!(resolved.tags, vec!["mongo", "nosql"]);
    }

    #[tokio::test]
    async fn test_unknown_names_are_not_found() {
        let fake = FakeServiceManager::new();
        assert!(matches!(
            resolve_plan(&fake, "redis", "small", None).await,
            Err(CatalogError::NotFound(_))
        ));
        assert!(matches!(
            resolve_plan(&fake, "mongo", "huge", None).await,
            Err(CatalogError::NotFound(_))
        ));
        assert!(matches!(
            resolve_plan(&fake, "mongo", "small", Some("plan-other")).await,
            Err(CatalogError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remote_errors_pass_through() {
        let fake = FakeServiceManager::new();
        fake.fail_next("list_offerings", SmError::api(503, "unavailable"));
        assert!(matches!(
            resolve_plan(&fake, "mongo", "small", None).await,
            Err(CatalogError::Remote(_))
        ));
    }
}
