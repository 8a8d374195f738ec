//! Calls into agent nodes.

use agentfield_core::{ControlPlaneError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub const EXECUTION_ID_HEADER: &str = "X-Execution-ID";
pub const RUN_ID_HEADER: &str = "X-Run-ID";
pub const PARENT_EXECUTION_ID_HEADER: &str = "X-Parent-Execution-ID";

/// One reasoner invocation on an agent node.
#[derive(Debug, Clone)]
pub struct AgentCall {
    pub base_url: String,
    pub reasoner_id: String,
    pub execution_id: String,
    pub run_id: Option<String>,
    pub parent_execution_id: Option<String>,
    pub input: Value,
}

impl AgentCall {
    pub fn url(&self) -> String {
        format!(
            "{}/reasoners/{}",
            self.base_url.trim_end_matches('/'),
            self.reasoner_id
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentReply {
    /// The node answered with the result.
    Completed(Value),
    /// The node accepted the work and will report status later.
    Accepted,
}

#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// Errors are `Timeout` when the deadline passed and `Delivery` otherwise.
    async fn invoke(&self, call: &AgentCall, timeout: Duration) -> Result<AgentReply>;
}

pub struct HttpAgentInvoker {
    client: reqwest::Client,
}

impl HttpAgentInvoker {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AgentInvoker for HttpAgentInvoker {
    async fn invoke(&self, call: &AgentCall, timeout: Duration) -> Result<AgentReply> {
        let url = call.url();
        let mut request = self
            .client
            .post(&url)
            .timeout(timeout)
            .header(EXECUTION_ID_HEADER, &call.execution_id)
            .json(&call.input);
        if let Some(run_id) = &call.run_id {
            request = request.header(RUN_ID_HEADER, run_id);
        }
        if let Some(parent) = &call.parent_execution_id {
            request = request.header(PARENT_EXECUTION_ID_HEADER, parent);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ControlPlaneError::timeout(format!("agent call to {} timed out", url))
            } else {
                ControlPlaneError::delivery(format!("agent call to {} failed: {}", url, e))
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::ACCEPTED {
            debug!(execution_id = %call.execution_id, "Agent accepted execution asynchronously");
            return Ok(AgentReply::Accepted);
        }

        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                ControlPlaneError::timeout(format!("agent call to {} timed out", url))
            } else {
                ControlPlaneError::delivery(format!("failed to read agent response: {}", e))
            }
        })?;

        if !status.is_success() {
            let text = String::from_utf8_lossy(&body);
            return Err(ControlPlaneError::delivery(format!(
                "agent error ({}): {}",
                status.as_u16(),
                text.chars().take(512).collect::<String>()
            )));
        }

        // Non-JSON bodies are kept as a string result.
        let result = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()))
        };
        Ok(AgentReply::Completed(result))
    }
}
