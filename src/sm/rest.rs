//! # Service Manager REST Client
//!
//! `reqwest` implementation of [`ServiceManagerClient`] against the v1 REST API.
//!
//! Authentication uses the OAuth2 client-credentials grant. The token is
//! cached until shortly before it expires.

use super::{
    BindRequest, ListQuery, Operation, Outcome, ProvisionRequest, RemoteBinding, RemoteInstance,
    ServiceManagerClient, ServiceOffering, ServicePlan, SmError, UpdateInstanceRequest,
};
use async_trait::async_trait;
use reqwest::{header, Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};
use zeroize::Zeroizing;

const INSTANCES: &str = "/v1/service_instances";
const BINDINGS: &str = "/v1/service_bindings";
const OFFERINGS: &str = "/v1/service_offerings";
const PLANS: &str = "/v1/service_plans";

/// Refresh the token this long before it expires
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// Connection settings read from the credentials secret
pub struct ServiceManagerRestConfig {
    pub sm_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: Zeroizing<String>,
}

impl std::fmt::Debug for ServiceManagerRestConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceManagerRestConfig")
            .field("sm_url", &self.sm_url)
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .finish()
    }
}

struct CachedToken {
    value: Zeroizing<String>,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    broker_error: Option<String>,
    #[serde(default)]
    broker_status_code: Option<u16>,
}

#[derive(Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    #[serde(default)]
    token: Option<String>,
}

/// Service Manager REST client
pub struct ServiceManagerRest {
    http_client: Client,
    config: ServiceManagerRestConfig,
    token: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for ServiceManagerRest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceManagerRest")
            .field("sm_url", &self.config.sm_url)
            .finish_non_exhaustive()
    }
}

/// Extract the resource ID from a `/v1/<collection>/<id>/operations/<op>` location
#[must_use]
pub fn parse_operation_location(location: &str) -> Option<String> {
    let path = location
        .split_once("://")
        .map_or(location, |(_, rest)| rest.find('/').map_or("", |i| &rest[i..]));
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match segments.as_slice() {
        ["v1", _collection, id, "operations", _op] if !id.is_empty() => Some((*id).to_string()),
        _ => None,
    }
}

impl ServiceManagerRest {
    /// Create a new client
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built
    pub fn new(config: ServiceManagerRestConfig) -> Result<Self, SmError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| SmError::Transport(format!("failed to create HTTP client: {e}")))?;
        info!("Initializing service manager client for {}", config.sm_url);
        Ok(Self {
            http_client,
            config,
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<Zeroizing<String>, SmError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        debug!("Fetching service manager access token");
        let url = format!(
            "{}/oauth/token",
            self.config.token_url.trim_end_matches('/')
        );
        let response = self
            .http_client
            .post(&url)
            .basic_auth(&self.config.client_id, Some(self.config.client_secret.as_str()))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.client_id.as_str()),
            ])
            .send()
            .await
            .map_err(|e| SmError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| SmError::MalformedResponse(format!("token response: {e}")))?;

        let lifetime = Duration::from_secs(body.expires_in.unwrap_or(3600));
        let value = Zeroizing::new(body.access_token);
        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_MARGIN),
        });
        Ok(value)
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, SmError> {
        let token = self.access_token().await?;
        let url = if path.starts_with("http") {
            path.to_string()
        } else {
            format!("{}{}", self.config.sm_url.trim_end_matches('/'), path)
        };
        Ok(self
            .http_client
            .request(method, url)
            .bearer_auth(token.as_str())
            .header(header::ACCEPT, "application/json"))
    }

    async fn send(request: RequestBuilder) -> Result<Response, SmError> {
        request
            .send()
            .await
            .map_err(|e| SmError::Transport(e.to_string()))
    }

    async fn error_from(response: Response) -> SmError {
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => SmError::Api {
                status,
                error_type: body.error,
                description: body.description.unwrap_or(text),
                broker_status: body.broker_status_code,
                broker_error: body.broker_error,
                retry_after,
            },
            Err(_) => SmError::Api {
                status,
                error_type: None,
                description: text,
                broker_status: None,
                broker_error: None,
                retry_after,
            },
        }
    }

    async fn json<T: DeserializeOwned>(response: Response) -> Result<T, SmError> {
        response
            .json()
            .await
            .map_err(|e| SmError::MalformedResponse(e.to_string()))
    }

    /// Accepted operation: read the Location header
    fn accepted(response: &Response, known_id: Option<&str>) -> Result<(String, String), SmError> {
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                SmError::MalformedResponse("202 response without Location header".to_string())
            })?
            .to_string();
        let resource_id = parse_operation_location(&location)
            .or_else(|| known_id.map(str::to_string))
            .ok_or_else(|| {
                SmError::MalformedResponse(format!(
                    "cannot extract resource ID from Location {location}"
                ))
            })?;
        Ok((resource_id, location))
    }

    async fn mutate(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        known_id: Option<&str>,
    ) -> Result<Outcome<Response>, SmError> {
        let mut request = self
            .request(method, path)
            .await?
            .query(&[("async", "true")]);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = Self::send(request).await?;
        match response.status() {
            StatusCode::ACCEPTED => {
                let (resource_id, operation_url) = Self::accepted(&response, known_id)?;
                Ok(Outcome::Accepted {
                    resource_id,
                    operation_url,
                })
            }
            s if s.is_success() => Ok(Outcome::Done(response)),
            _ => Err(Self::error_from(response).await),
        }
    }

    async fn list<T: DeserializeOwned>(
        &self,
        collection: &str,
        query: &ListQuery,
    ) -> Result<Vec<T>, SmError> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .request(Method::GET, collection)
                .await?
                .query(&query.to_params());
            if let Some(token) = &page_token {
                request = request.query(&[("token", token)]);
            }
            let response = Self::send(request).await?;
            if !response.status().is_success() {
                return Err(Self::error_from(response).await);
            }
            let page: Page<T> = Self::json(response).await?;
            items.extend(page.items);
            match page.token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(items),
            }
        }
    }

    fn to_body<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, SmError> {
        serde_json::to_value(value).map_err(|e| SmError::InvalidRequest(e.to_string()))
    }

    async fn delete(&self, path: &str, id: &str) -> Result<Outcome<()>, SmError> {
        match self.mutate(Method::DELETE, path, None, Some(id)).await {
            Ok(Outcome::Done(_)) => Ok(Outcome::Done(())),
            Ok(Outcome::Accepted {
                resource_id,
                operation_url,
            }) => Ok(Outcome::Accepted {
                resource_id,
                operation_url,
            }),
            Err(e) if e.is_gone() => {
                debug!("{} already deleted", path);
                Ok(Outcome::Done(()))
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ServiceManagerClient for ServiceManagerRest {
    async fn provision(&self, request: &ProvisionRequest) -> Result<Outcome<String>, SmError> {
        let body = Self::to_body(request)?;
        match self.mutate(Method::POST, INSTANCES, Some(body), None).await? {
            Outcome::Done(response) => {
                let instance: RemoteInstance = Self::json(response).await?;
                Ok(Outcome::Done(instance.id))
            }
            Outcome::Accepted {
                resource_id,
                operation_url,
            } => Ok(Outcome::Accepted {
                resource_id,
                operation_url,
            }),
        }
    }

    async fn update_instance(
        &self,
        instance_id: &str,
        request: &UpdateInstanceRequest,
    ) -> Result<Outcome<()>, SmError> {
        let body = Self::to_body(request)?;
        let path = format!("{INSTANCES}/{instance_id}");
        match self
            .mutate(Method::PATCH, &path, Some(body), Some(instance_id))
            .await?
        {
            Outcome::Done(_) => Ok(Outcome::Done(())),
            Outcome::Accepted {
                resource_id,
                operation_url,
            } => Ok(Outcome::Accepted {
                resource_id,
                operation_url,
            }),
        }
    }

    async fn deprovision(&self, instance_id: &str) -> Result<Outcome<()>, SmError> {
        self.delete(&format!("{INSTANCES}/{instance_id}"), instance_id)
            .await
    }

    async fn share_instance(&self, instance_id: &str, shared: bool) -> Result<(), SmError> {
        let path = format!("{INSTANCES}/{instance_id}");
        let request = self
            .request(Method::PATCH, &path)
            .await?
            .json(&serde_json::json!({ "shared": shared }));
        let response = Self::send(request).await?;
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        Ok(())
    }

    async fn bind(&self, request: &BindRequest) -> Result<Outcome<RemoteBinding>, SmError> {
        let body = Self::to_body(request)?;
        match self.mutate(Method::POST, BINDINGS, Some(body), None).await? {
            Outcome::Done(response) => Ok(Outcome::Done(Self::json(response).await?)),
            Outcome::Accepted {
                resource_id,
                operation_url,
            } => Ok(Outcome::Accepted {
                resource_id,
                operation_url,
            }),
        }
    }

    async fn unbind(&self, binding_id: &str) -> Result<Outcome<()>, SmError> {
        self.delete(&format!("{BINDINGS}/{binding_id}"), binding_id)
            .await
    }

    async fn get_binding(&self, binding_id: &str) -> Result<RemoteBinding, SmError> {
        let path = format!("{BINDINGS}/{binding_id}");
        let response = Self::send(self.request(Method::GET, &path).await?).await?;
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        Self::json(response).await
    }

    async fn rename_binding(
        &self,
        binding_id: &str,
        new_name: &str,
        new_k8s_name: &str,
    ) -> Result<(), SmError> {
        let path = format!("{BINDINGS}/{binding_id}");
        let body = serde_json::json!({
            "name": new_name,
            "labels": [{
                "op": "replace",
                "key": crate::constants::REMOTE_K8S_NAME_LABEL,
                "values": [new_k8s_name]
            }]
        });
        let response = Self::send(self.request(Method::PATCH, &path).await?.json(&body)).await?;
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        Ok(())
    }

    async fn list_instances(&self, query: &ListQuery) -> Result<Vec<RemoteInstance>, SmError> {
        self.list(INSTANCES, query).await
    }

    async fn list_bindings(&self, query: &ListQuery) -> Result<Vec<RemoteBinding>, SmError> {
        self.list(BINDINGS, query).await
    }

    async fn status(&self, operation_url: &str) -> Result<Operation, SmError> {
        let response = Self::send(self.request(Method::GET, operation_url).await?).await?;
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        Self::json(response).await
    }

    async fn list_offerings(&self, query: &ListQuery) -> Result<Vec<ServiceOffering>, SmError> {
        self.list(OFFERINGS, query).await
    }

    async fn list_plans(&self, query: &ListQuery) -> Result<Vec<ServicePlan>, SmError> {
        self.list(PLANS, query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_operation_location() {
        assert_eq!(
            parse_operation_location("/v1/service_instances/12345/operations/1234").as_deref(),
            Some("12345")
        );
        assert_eq!(
            parse_operation_location("https://sm.example.com/v1/service_bindings/b-1/operations/9")
                .as_deref(),
            Some("b-1")
        );
        assert_eq!(parse_operation_location("/v1/service_instances/12345"), None);
        assert_eq!(parse_operation_location(""), None);
    }

    #[test]
    fn test_config_debug_hides_secret() {
        let config = ServiceManagerRestConfig {
            sm_url: "https://sm".to_string(),
            token_url: "https://uaa".to_string(),
            client_id: "id".to_string(),
            client_secret: Zeroizing::new("hunter2".to_string()),
        };
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
