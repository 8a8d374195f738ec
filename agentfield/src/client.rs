//! Node-side lease client.
//!
//! Agent nodes register and renew their lease through these calls. Control
//! planes that predate the lease API answer 404 on the new paths, so
//! registration and renewal retry once against `/nodes/register` and
//! `/nodes/{id}/heartbeat`. Legacy endpoints may reply with an empty body; a
//! default lease is assumed in that case.

use agentfield_core::types::*;
use agentfield_core::{ControlPlaneError, Result};
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

/// Lease assumed when a legacy endpoint does not return one.
pub const LEGACY_LEASE_SECONDS: u64 = 120;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct LeaseClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

/// How to read a successful body.
#[derive(Clone, Copy)]
enum BodyMode {
    Strict,
    /// Empty or foreign bodies become a default lease.
    Legacy,
}

fn legacy_lease() -> LeaseResponse {
    LeaseResponse {
        lease_seconds: LEGACY_LEASE_SECONDS,
        next_lease_renewal: Utc::now() + ChronoDuration::seconds(LEGACY_LEASE_SECONDS as i64),
        pending_actions: Vec::new(),
    }
}

fn status_error(status: StatusCode, body: &str, node_id: &str) -> ControlPlaneError {
    match status {
        StatusCode::NOT_FOUND => ControlPlaneError::not_found("node", node_id),
        StatusCode::BAD_REQUEST => ControlPlaneError::validation(body.to_string()),
        StatusCode::CONFLICT => ControlPlaneError::conflict(body.to_string()),
        StatusCode::SERVICE_UNAVAILABLE => ControlPlaneError::unavailable(body.to_string()),
        _ => ControlPlaneError::delivery(format!("control plane returned {}: {}", status, body)),
    }
}

impl LeaseClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ControlPlaneError::config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    /// Send one request. `Ok(None)` means the path answered 404.
    async fn send<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<Option<(StatusCode, String)>> {
        let url = self.url(path);
        let response = self
            .client
            .request(method, &url)
            .json(body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ControlPlaneError::timeout(format!("request to {}", url))
                } else {
                    ControlPlaneError::delivery(format!("request to {}: {}", url, e))
                }
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let text = response
            .text()
            .await
            .map_err(|e| ControlPlaneError::delivery(format!("reading response from {}: {}", url, e)))?;
        Ok(Some((status, text)))
    }

    fn decode<T: DeserializeOwned>(status: StatusCode, text: &str, node_id: &str) -> Result<T> {
        if !status.is_success() {
            return Err(status_error(status, text, node_id));
        }
        Ok(serde_json::from_str(text)?)
    }

    fn decode_lease(status: StatusCode, text: &str, node_id: &str, mode: BodyMode) -> Result<LeaseResponse> {
        match mode {
            BodyMode::Strict => Self::decode(status, text, node_id),
            BodyMode::Legacy => {
                if !status.is_success() {
                    return Err(status_error(status, text, node_id));
                }
                Ok(serde_json::from_str(text).unwrap_or_else(|_| legacy_lease()))
            }
        }
    }

    /// Call `primary`, falling back to `legacy` when it answers 404.
    async fn lease_call<B: Serialize>(
        &self,
        node_id: &str,
        primary: (Method, String),
        legacy: (Method, String),
        body: &B,
    ) -> Result<LeaseResponse> {
        match self.send(primary.0, &primary.1, body).await? {
            Some((status, text)) => Self::decode_lease(status, &text, node_id, BodyMode::Strict),
            None => {
                debug!(node_id = %node_id, path = %legacy.1, "Lease endpoint missing, trying legacy path");
                match self.send(legacy.0, &legacy.1, body).await? {
                    Some((status, text)) => Self::decode_lease(status, &text, node_id, BodyMode::Legacy),
                    None => {
                        warn!(node_id = %node_id, "Neither lease nor legacy endpoint is available");
                        Err(ControlPlaneError::not_found("node", node_id))
                    }
                }
            }
        }
    }

    pub async fn register(&self, request: &RegisterNodeRequest) -> Result<LeaseResponse> {
        self.lease_call(
            &request.id,
            (Method::POST, "/nodes".to_string()),
            (Method::POST, "/nodes/register".to_string()),
            request,
        )
        .await
    }

    pub async fn renew(&self, node_id: &str, update: &NodeStatusUpdate) -> Result<LeaseResponse> {
        self.lease_call(
            node_id,
            (Method::PATCH, format!("/nodes/{}/status", node_id)),
            (Method::POST, format!("/nodes/{}/heartbeat", node_id)),
            update,
        )
        .await
    }

    pub async fn ack_action(&self, node_id: &str, action_id: &str) -> Result<LeaseResponse> {
        let body = ActionAckRequest {
            action_id: action_id.to_string(),
        };
        match self
            .send(Method::POST, &format!("/nodes/{}/actions/ack", node_id), &body)
            .await?
        {
            Some((status, text)) => Self::decode(status, &text, node_id),
            None => Err(ControlPlaneError::not_found("node", node_id)),
        }
    }

    pub async fn shutdown(&self, node_id: &str, reason: Option<String>) -> Result<NodeShutdownResponse> {
        let body = NodeShutdownRequest { reason };
        match self
            .send(Method::POST, &format!("/nodes/{}/shutdown", node_id), &body)
            .await?
        {
            Some((status, text)) => Self::decode(status, &text, node_id),
            None => Err(ControlPlaneError::not_found("node", node_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn lease_body(seconds: u64) -> serde_json::Value {
        json!({
            "lease_seconds": seconds,
            "next_lease_renewal": Utc::now().to_rfc3339(),
            "pending_actions": []
        })
    }

    fn register_request() -> RegisterNodeRequest {
        RegisterNodeRequest {
            id: "node-1".into(),
            base_url: "http://agent.test".into(),
            agent_version: None,
            reasoners: vec!["plan".into()],
            skills: vec![],
            process_id: None,
        }
    }

    #[tokio::test]
    async fn test_register_uses_lease_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/nodes"))
            .and(body_partial_json(json!({"id": "node-1"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(lease_body(30)))
            .expect(1)
            .mount(&server)
            .await;

        let client = LeaseClient::new(server.uri()).unwrap();
        let lease = client.register(&register_request()).await.unwrap();
        assert_eq!(lease.lease_seconds, 30);
    }

    #[tokio::test]
    async fn test_register_falls_back_to_legacy_path_on_404() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/nodes"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/nodes/register"))
            .respond_with(ResponseTemplate::new(200).set_body_json(lease_body(45)))
            .expect(1)
            .mount(&server)
            .await;

        let client = LeaseClient::new(server.uri()).unwrap();
        let lease = client.register(&register_request()).await.unwrap();
        assert_eq!(lease.lease_seconds, 45);
    }

    #[tokio::test]
    async fn test_legacy_heartbeat_with_empty_body_gets_default_lease() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/api/v1/nodes/node-1/status"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/nodes/node-1/heartbeat"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = LeaseClient::new(server.uri()).unwrap();
        let lease = client
            .renew("node-1", &NodeStatusUpdate::default())
            .await
            .unwrap();
        assert_eq!(lease.lease_seconds, LEGACY_LEASE_SECONDS);
        assert!(lease.next_lease_renewal > Utc::now());
    }

    #[tokio::test]
    async fn test_server_error_is_not_retried_on_legacy_path() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/api/v1/nodes/node-1/status"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/nodes/node-1/heartbeat"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = LeaseClient::new(server.uri()).unwrap();
        let err = client
            .renew("node-1", &NodeStatusUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ControlPlaneError::Delivery(_)));
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_unknown_node_on_both_paths_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = LeaseClient::new(server.uri()).unwrap();
        let err = client
            .renew("ghost", &NodeStatusUpdate::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
