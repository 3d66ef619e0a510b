//! A small read-only client for the Kubernetes REST API.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

use super::{
    config::ConnectionConfig, resources::Status, ControlPlane, Endpoints, Service,
    ServiceIdentity,
};
use crate::{connect_via::permanent, prelude::*};

/// Talks to the API server described by a [`ConnectionConfig`].
#[derive(Clone, Debug)]
pub struct ApiClient {
    config: ConnectionConfig,
    client: Client,
}

impl ApiClient {
    /// Create a new client.
    pub fn new(config: ConnectionConfig) -> Result<ApiClient> {
        let client = config.http_client()?;
        Ok(ApiClient { config, client })
    }

    /// Build a URL under the API server's base URL. The server URL may
    /// itself have a path, as it does behind Rancher and similar gateways.
    fn api_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.config.server.clone();
        url.path_segments_mut()
            .map_err(|_| format_err!("API server URL {} cannot be a base", self.config.server))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Fetch a core `v1` object, returning `None` if it doesn't exist.
    async fn get_core_v1<T: DeserializeOwned>(
        &self,
        resource: &str,
        id: &ServiceIdentity,
    ) -> Result<Option<T>> {
        let url = self.api_url(&[
            "api",
            "v1",
            "namespaces",
            id.namespace.as_str(),
            resource,
            id.name.as_str(),
        ])?;
        self.config
            .via
            .retry_if_appropriate(|| self.get_json(url.clone()))
            .await
    }

    /// Make a single GET request.
    #[tracing::instrument(level = "debug", skip(self, url), fields(url = %url))]
    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<Option<T>> {
        let resp = self
            .config
            .authenticate(self.client.get(url.clone()))
            .send()
            .await
            .with_context(|| format!("error requesting {}", url))?;

        let status = resp.status();
        trace!("{} returned {}", url, status);
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Status>(&body)
                .ok()
                .and_then(|s| s.message)
                .unwrap_or(body);
            let err = format_err!("{} returned {}: {}", url, status, message.trim());
            // Server errors and throttling may clear up. Other client errors
            // won't.
            if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
                return Err(permanent(err));
            }
            return Err(err);
        }
        let body = resp
            .bytes()
            .await
            .with_context(|| format!("error reading response from {}", url))?;
        let value = serde_json::from_slice::<T>(&body)
            .with_context(|| format!("error parsing response from {}", url))
            .map_err(permanent)?;
        Ok(Some(value))
    }
}

#[async_trait]
impl ControlPlane for ApiClient {
    async fn get_service(&self, id: &ServiceIdentity) -> Result<Option<Service>> {
        self.get_core_v1("services", id).await
    }

    async fn get_endpoints(&self, id: &ServiceIdentity) -> Result<Option<Endpoints>> {
        self.get_core_v1("endpoints", id).await
    }
}

#[cfg(test)]
fn test_client(base_url: &str, token: Option<&str>) -> ApiClient {
    let mut config = ConnectionConfig::anonymous(Url::parse(base_url).unwrap());
    config.token = token.map(|t| t.to_owned());
    ApiClient::new(config).expect("could not build client")
}

#[tokio::test]
async fn get_endpoints_decodes_found_objects() {
    use httpmock::prelude::*;

    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/api/v1/namespaces/kube-system/endpoints/kubernetes-dashboard")
                .header("authorization", "Bearer s3cret");
            then.status(200).json_body(serde_json::json!({
                "metadata": { "name": "kubernetes-dashboard", "namespace": "kube-system" },
                "subsets": [
                    { "addresses": [ { "ip": "10.0.0.5" } ], "ports": [ { "port": 443 } ] }
                ]
            }));
        })
        .await;

    let client = test_client(&server.base_url(), Some("s3cret"));
    let id = ServiceIdentity::new("kube-system", "kubernetes-dashboard");
    let endpoints = client
        .get_endpoints(&id)
        .await
        .expect("request failed")
        .expect("endpoints missing");
    mock.assert_async().await;
    assert_eq!(endpoints.subsets()[0].addresses()[0].ip, "10.0.0.5");
}

#[tokio::test]
async fn not_found_is_none_and_other_errors_are_errors() {
    use httpmock::prelude::*;

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/v1/namespaces/kube-system/services/missing");
            then.status(404).json_body(serde_json::json!({
                "kind": "Status",
                "status": "Failure",
                "message": "services \"missing\" not found",
                "reason": "NotFound",
                "code": 404
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/v1/namespaces/kube-system/services/forbidden");
            then.status(403).json_body(serde_json::json!({
                "kind": "Status",
                "message": "services \"forbidden\" is forbidden",
                "reason": "Forbidden",
                "code": 403
            }));
        })
        .await;

    let client = test_client(&server.base_url(), None);
    let missing = client
        .get_service(&ServiceIdentity::new("kube-system", "missing"))
        .await
        .expect("404 should not be an error");
    assert!(missing.is_none());

    let err = client
        .get_service(&ServiceIdentity::new("kube-system", "forbidden"))
        .await
        .expect_err("403 should be an error");
    let msg = format!("{}", err);
    assert!(msg.contains("403"), "unexpected message: {}", msg);
    assert!(msg.contains("is forbidden"), "unexpected message: {}", msg);
}

#[tokio::test]
async fn in_cluster_clients_do_not_retry_forbidden_requests() {
    use httpmock::prelude::*;
    use std::time::Duration;

    let server = MockServer::start_async().await;
    let forbidden = server
        .mock_async(|when, then| {
            when.method(GET).path("/api/v1/namespaces/kube-system/services/ui");
            then.status(403).json_body(serde_json::json!({
                "kind": "Status",
                "message": "services \"ui\" is forbidden",
                "code": 403
            }));
        })
        .await;

    let mut config = ConnectionConfig::anonymous(Url::parse(&server.base_url()).unwrap());
    config.via = ConnectVia::Cluster;
    let client = ApiClient::new(config).expect("could not build client");
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        client.get_service(&ServiceIdentity::new("kube-system", "ui")),
    )
    .await
    .expect("403 was retried");
    assert!(result.is_err());
    forbidden.assert_hits_async(1).await;
}

#[tokio::test]
async fn in_cluster_clients_retry_server_errors() {
    use httpmock::prelude::*;
    use std::time::Duration;

    let server = MockServer::start_async().await;
    let unavailable = server
        .mock_async(|when, then| {
            when.method(GET).path("/api/v1/namespaces/kube-system/services/ui");
            then.status(503).body("try again");
        })
        .await;

    let mut config = ConnectionConfig::anonymous(Url::parse(&server.base_url()).unwrap());
    config.via = ConnectVia::Cluster;
    let client = ApiClient::new(config).expect("could not build client");
    let id = ServiceIdentity::new("kube-system", "ui");
    // Give up waiting well before the backoff does.
    let waited = tokio::time::timeout(Duration::from_secs(3), client.get_service(&id)).await;
    assert!(waited.is_err(), "503 should have been retried");
    assert!(unavailable.hits_async().await >= 2);
}

#[test]
fn api_urls_keep_server_path_prefix() {
    let client = test_client("https://k8s.example.com/k8s/clusters/c-1/", None);
    let url = client
        .api_url(&["api", "v1", "namespaces", "kube-system", "services", "ui"])
        .unwrap();
    assert_eq!(
        url.as_str(),
        "https://k8s.example.com/k8s/clusters/c-1/api/v1/namespaces/kube-system/services/ui",
    );
}
