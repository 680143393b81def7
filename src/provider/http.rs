//! HTTP control-plane client.
//!
//! Speaks a small JSON API:
//! `POST /v1/resources`, `PUT|DELETE|GET /v1/resources/{id}` and
//! `GET /v1/resources/{id}/health`.

use async_trait::async_trait;
use reqwest::{header, Client, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{ProviderError, Result, StackformError};
use crate::resource::{Attributes, ResourceKind, ResourceSpec};

use super::{Provider, ProviderRecord, ProviderResult, References, ResourceHealth};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Retry-After value assumed when a 429 does not carry one.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// HTTP control-plane provider.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Base URL without trailing slash.
    endpoint: String,
    /// Bearer token, if the control plane requires one.
    token: Option<String>,
}

/// Body of create and update requests.
#[derive(Debug, Serialize)]
struct ResourceRequest<'a> {
    resource_id: &'a str,
    kind: ResourceKind,
    attributes: &'a Attributes,
    depends_on: Vec<&'a str>,
    references: &'a References,
}

/// Error body returned by the control plane.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

impl HttpProvider {
    /// Creates a new client for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, token: Option<String>) -> Result<Self> {
        Self::with_timeout(endpoint, token, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a client with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(endpoint: &str, token: Option<String>, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| {
                StackformError::Provider(ProviderError::network(format!(
                    "Failed to create HTTP client: {e}"
                )))
            })?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{path}", self.endpoint);
        trace!("{method} {url}");
        let builder = self
            .client
            .request(method, url)
            .header(header::ACCEPT, "application/json");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Sends a request and maps transport and status failures.
    async fn send(&self, builder: RequestBuilder, target: &str) -> ProviderResult<Response> {
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout {
                    operation: format!("request for {target}"),
                }
            } else {
                ProviderError::network(format!("Request failed: {e}"))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            return Err(ProviderError::Throttled {
                retry_after_secs: Some(retry_after),
            });
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body).map_or(body, |b| b.message);
        Err(Self::map_status(status, message, target))
    }

    fn map_status(status: StatusCode, message: String, target: &str) -> ProviderError {
        match status.as_u16() {
            502..=504 => ProviderError::Unavailable { message },
            400 | 422 => ProviderError::Validation { message },
            409 => ProviderError::Conflict { message },
            404 => ProviderError::NotFound {
                provider_id: target.to_string(),
            },
            code => ProviderError::api(code, message),
        }
    }

    async fn json<T: DeserializeOwned>(response: Response) -> ProviderResult<T> {
        response.json().await.map_err(|e| ProviderError::InvalidResponse {
            message: format!("Failed to parse response: {e}"),
        })
    }

    fn body<'a>(spec: &'a ResourceSpec, references: &'a References) -> ResourceRequest<'a> {
        ResourceRequest {
            resource_id: &spec.id,
            kind: spec.kind,
            attributes: &spec.attributes,
            depends_on: spec.depends_on.iter().map(String::as_str).collect(),
            references,
        }
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn create(&self, spec: &ResourceSpec, references: &References) -> ProviderResult<ProviderRecord> {
        debug!("Creating {spec}");
        let builder = self
            .request(Method::POST, "/v1/resources")
            .json(&Self::body(spec, references));
        let response = self.send(builder, &spec.id).await?;
        Self::json(response).await
    }

    async fn update(
        &self,
        provider_id: &str,
        spec: &ResourceSpec,
        references: &References,
    ) -> ProviderResult<ProviderRecord> {
        debug!("Updating {spec} ({provider_id})");
        let builder = self
            .request(Method::PUT, &format!("/v1/resources/{provider_id}"))
            .json(&Self::body(spec, references));
        let response = self.send(builder, provider_id).await?;
        Self::json(response).await
    }

    async fn delete(&self, provider_id: &str, kind: ResourceKind) -> ProviderResult<()> {
        debug!("Deleting {kind} {provider_id}");
        let builder = self
            .request(Method::DELETE, &format!("/v1/resources/{provider_id}"))
            .query(&[("kind", kind.as_str())]);
        self.send(builder, provider_id).await?;
        Ok(())
    }

    async fn read(&self, provider_id: &str) -> ProviderResult<ProviderRecord> {
        let builder = self.request(Method::GET, &format!("/v1/resources/{provider_id}"));
        let response = self.send(builder, provider_id).await?;
        Self::json(response).await
    }

    async fn health(&self, provider_id: &str) -> ProviderResult<ResourceHealth> {
        let builder = self.request(Method::GET, &format!("/v1/resources/{provider_id}/health"));
        let response = self.send(builder, provider_id).await?;
        Self::json(response).await
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cluster() -> ResourceSpec {
        ResourceSpec::new("cluster", ResourceKind::Cluster).with_attr("name", "main")
    }

    async fn provider(server: &MockServer) -> HttpProvider {
        HttpProvider::new(&server.uri(), Some(String::from("secret"))).expect("Failed to create provider")
    }

    #[tokio::test]
    async fn test_create_posts_spec() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/resources"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(json!({"resource_id": "cluster", "kind": "cluster"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "provider_id": "arn:cluster/main",
                "kind": "cluster",
                "attributes": {"name": "main"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let record = provider(&server)
            .await
            .create(&cluster(), &References::new())
            .await
            .expect("Create should succeed");
        assert_eq!(record.provider_id, "arn:cluster/main");
    }

    #[tokio::test]
    async fn test_throttle_maps_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let err = provider(&server)
            .await
            .create(&cluster(), &References::new())
            .await
            .expect_err("429 should fail the call");
        assert_eq!(err, ProviderError::Throttled { retry_after_secs: Some(7) });
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        for (id, status) in [("a", 503), ("b", 422), ("c", 409), ("d", 404), ("e", 500)] {
            Mock::given(method("GET"))
                .and(path(format!("/v1/resources/{id}")))
                .respond_with(ResponseTemplate::new(status).set_body_json(json!({"message": "nope"})))
                .mount(&server)
                .await;
        }

        let p = provider(&server).await;
        assert!(matches!(p.read("a").await, Err(ProviderError::Unavailable { .. })));
        assert!(matches!(p.read("b").await, Err(ProviderError::Validation { .. })));
        assert!(matches!(p.read("c").await, Err(ProviderError::Conflict { .. })));
        assert!(matches!(p.read("d").await, Err(ProviderError::NotFound { .. })));
        assert_eq!(p.read("e").await, Err(ProviderError::api(500, "nope")));
    }

    #[tokio::test]
    async fn test_delete_sends_kind() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/resources/svc-1"))
            .and(query_param("kind", "service"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        provider(&server)
            .await
            .delete("svc-1", ResourceKind::Service)
            .await
            .expect("Delete should succeed");
    }

    #[tokio::test]
    async fn test_health_parses_tagged_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/resources/svc-1/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "unhealthy",
                "reason": "circuit breaker tripped"
            })))
            .mount(&server)
            .await;

        let health = provider(&server)
            .await
            .health("svc-1")
            .await
            .expect("Health should parse");
        assert!(health.is_unhealthy());
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let p = HttpProvider::with_timeout(&server.uri(), None, 1).expect("Failed to create provider");
        let err = p.read("slow").await.expect_err("Slow response should time out");
        assert!(matches!(err, ProviderError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_update_sends_dependency_provider_ids() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/resources/svc-1"))
            .and(body_partial_json(json!({
                "depends_on": ["cluster"],
                "references": {"cluster": "arn:cluster/main-2"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "provider_id": "svc-1",
                "kind": "service"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let service = ResourceSpec::new("service", ResourceKind::Service).depends_on("cluster");
        let references = References::from([(String::from("cluster"), String::from("arn:cluster/main-2"))]);
        let record = provider(&server)
            .await
            .update("svc-1", &service, &references)
            .await
            .expect("Update should succeed");
        assert_eq!(record.kind, ResourceKind::Service);
    }
}
