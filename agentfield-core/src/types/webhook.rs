//! Observability webhook configuration, event envelopes and per-execution
//! callback registrations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{ControlPlaneError, Result};

/// Row id of the singleton observability webhook configuration.
pub const GLOBAL_WEBHOOK_ID: &str = "global";

/// Accept only absolute http(s) URLs with a host.
pub fn validate_webhook_url(raw: &str) -> Result<url::Url> {
    let parsed = url::Url::parse(raw.trim())
        .map_err(|e| ControlPlaneError::validation(format!("invalid webhook url: {}", e)))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(ControlPlaneError::validation(format!(
                "webhook url must use http or https, got '{}'",
                other
            )));
        }
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(ControlPlaneError::validation("webhook url must include a host"));
    }
    Ok(parsed)
}

/// Stored observability webhook configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservabilityWebhookConfig {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl ObservabilityWebhookConfig {
    /// Apply an update request on top of `existing`.
    ///
    /// An empty or absent secret keeps the previous secret; `enabled`
    /// defaults to true.
    pub fn apply(
        existing: Option<&ObservabilityWebhookConfig>,
        request: WebhookConfigRequest,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        validate_webhook_url(&request.url)?;

        let secret = match request.secret.filter(|s| !s.is_empty()) {
            Some(s) => Some(s),
            None => existing.and_then(|e| e.secret.clone()),
        };

        Ok(Self {
            id: GLOBAL_WEBHOOK_ID.to_string(),
            url: request.url.trim().to_string(),
            secret,
            headers: request.headers.unwrap_or_default(),
            enabled: request.enabled.unwrap_or(true),
            created_at: existing.map(|e| e.created_at).unwrap_or(now),
            updated_at: now,
            version: existing.map(|e| e.version).unwrap_or(0),
        })
    }

    pub fn view(&self) -> WebhookConfigView {
        WebhookConfigView {
            url: self.url.clone(),
            has_secret: self.secret.as_deref().is_some_and(|s| !s.is_empty()),
            headers: self.headers.clone(),
            enabled: self.enabled,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Body of `POST /api/v1/observability/webhook`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebhookConfigRequest {
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// Webhook configuration as returned by the API; the secret never leaves the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookConfigView {
    pub url: String,
    pub has_secret: bool,
    pub headers: BTreeMap<String, String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Normalised envelope for an execution, workflow or node state change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservabilityEvent {
    pub event_type: String,
    pub event_source: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservabilityEventBatch {
    pub batch_id: String,
    pub event_count: usize,
    pub events: Vec<ObservabilityEvent>,
    pub timestamp: DateTime<Utc>,
}

impl ObservabilityEventBatch {
    pub fn new(events: Vec<ObservabilityEvent>, now: DateTime<Utc>) -> Self {
        Self {
            batch_id: uuid::Uuid::new_v4().to_string(),
            event_count: events.len(),
            events,
            timestamp: now,
        }
    }
}

/// Snapshot returned by `GET /api/v1/observability/status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ForwarderStatus {
    pub enabled: bool,
    #[serde(default)]
    pub webhook_url: Option<String>,
    pub queue_depth: usize,
    pub events_forwarded: u64,
    pub events_dropped: u64,
    pub dead_letter_count: u64,
    #[serde(default)]
    pub last_forwarded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionWebhookStatus {
    Pending,
    InFlight,
    Retrying,
    Delivered,
    Exhausted,
}

impl ExecutionWebhookStatus {
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Delivered | Self::Exhausted)
    }
}

/// Callback registration supplied with an async execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionWebhookRequest {
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Stored callback registration for one execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionWebhook {
    pub execution_id: String,
    pub url: String,
    #[serde(default, skip_serializing)]
    pub secret: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub status: ExecutionWebhookStatus,
    pub attempt_count: u32,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl ExecutionWebhook {
    pub fn register(
        execution_id: impl Into<String>,
        request: ExecutionWebhookRequest,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        validate_webhook_url(&request.url)?;
        Ok(Self {
            execution_id: execution_id.into(),
            url: request.url.trim().to_string(),
            secret: request.secret.filter(|s| !s.is_empty()),
            headers: request.headers,
            status: ExecutionWebhookStatus::Pending,
            attempt_count: 0,
            last_attempt_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            version: 0,
        })
    }
}

/// Body posted to an execution's callback URL when it reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionWebhookPayload {
    pub event: String,
    pub execution_id: String,
    #[serde(default)]
    pub run_id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionWebhookPayload {
    pub fn from_record(record: &super::execution::ExecutionRecord, now: DateTime<Utc>) -> Self {
        Self {
            event: format!("execution.{}", record.status.as_str()),
            execution_id: record.execution_id.clone(),
            run_id: record.run_id.clone(),
            status: record.status.as_str().to_string(),
            result: record.output.clone(),
            error_message: record.error_message.clone(),
            duration_ms: record.duration_ms(),
            timestamp: now,
        }
    }
}
