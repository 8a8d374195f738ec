//! Outbound webhook HTTP transport.

use agentfield_core::{ControlPlaneError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use super::signer::{SIGNATURE_HEADER, sign};

pub const USER_AGENT: &str = "AgentField-Observability/1.0";

/// A fully serialized webhook call.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub url: String,
    pub body: Bytes,
    pub secret: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl WebhookRequest {
    pub fn json<T: serde::Serialize>(
        url: impl Into<String>,
        payload: &T,
        secret: Option<String>,
        headers: BTreeMap<String, String>,
    ) -> Result<Self> {
        Ok(Self {
            url: url.into(),
            body: Bytes::from(serde_json::to_vec(payload)?),
            secret,
            headers,
        })
    }

    /// Signature header value, when a secret is configured.
    pub fn signature(&self) -> Option<String> {
        self.secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|s| sign(s, &self.body))
    }
}

/// Sends one webhook call. Non-2xx responses and transport failures are errors.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn send(&self, request: &WebhookRequest, timeout: Duration) -> Result<()>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    response_body_limit: usize,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, response_body_limit: usize) -> Self {
        Self {
            client,
            response_body_limit,
        }
    }

    /// Read at most `response_body_limit` bytes of the body, for error context.
    async fn read_limited(&self, mut response: reqwest::Response) -> String {
        let mut buf = Vec::new();
        while buf.len() < self.response_body_limit {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let room = self.response_body_limit - buf.len();
                    buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
                }
                _ => break,
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn send(&self, request: &WebhookRequest, timeout: Duration) -> Result<()> {
        let mut builder = self
            .client
            .post(&request.url)
            .timeout(timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .body(request.body.clone());

        if let Some(signature) = request.signature() {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ControlPlaneError::timeout(format!("webhook call to {} timed out", request.url))
            } else {
                ControlPlaneError::delivery(format!("webhook call to {} failed: {}", request.url, e))
            }
        })?;

        let status = response.status();
        let body = self.read_limited(response).await;
        if status.is_success() {
            debug!(url = %request.url, status = status.as_u16(), "Webhook delivered");
            return Ok(());
        }

        let snippet: String = body.chars().take(256).collect();
        Err(ControlPlaneError::delivery(format!(
            "webhook {} returned {}: {}",
            request.url,
            status.as_u16(),
            snippet
        )))
    }
}
