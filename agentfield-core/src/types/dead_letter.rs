//! Dead-letter entries and redrive requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ControlPlaneError, Result};

/// Where a dead-lettered payload was headed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeadLetterDestination {
    /// The global observability webhook
    Observability,
    /// A per-execution callback
    ExecutionWebhook { execution_id: String },
}

/// A delivery that exhausted its retry budget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterEntry {
    /// Assigned by the store; increasing in insertion order.
    pub id: i64,
    pub destination: DeadLetterDestination,
    pub event_type: String,
    pub event_source: String,
    pub event_timestamp: DateTime<Utc>,
    pub payload: Value,
    pub error_message: String,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    /// Entry awaiting an id from the store.
    pub fn new(
        destination: DeadLetterDestination,
        event_type: impl Into<String>,
        event_source: impl Into<String>,
        event_timestamp: DateTime<Utc>,
        payload: Value,
        error_message: impl Into<String>,
        retry_count: u32,
    ) -> Self {
        Self {
            id: 0,
            destination,
            event_type: event_type.into(),
            event_source: event_source.into(),
            event_timestamp,
            payload,
            error_message: error_message.into(),
            retry_count,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeadLetterQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

impl DeadLetterQuery {
    pub const DEFAULT_LIMIT: usize = 100;
    pub const MAX_LIMIT: usize = 1000;

    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterListResponse {
    pub entries: Vec<DeadLetterEntry>,
    pub total_count: usize,
}

/// Body of `POST /api/v1/observability/dead-letter/redrive`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RedriveRequest {
    #[serde(default)]
    pub ids: Option<Vec<i64>>,
    #[serde(default)]
    pub all: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedriveTarget {
    All,
    Ids(Vec<i64>),
}

impl TryFrom<RedriveRequest> for RedriveTarget {
    type Error = ControlPlaneError;

    fn try_from(req: RedriveRequest) -> Result<Self> {
        match (req.all, req.ids) {
            (true, None) => Ok(Self::All),
            (true, Some(ids)) if ids.is_empty() => Ok(Self::All),
            (true, Some(_)) => Err(ControlPlaneError::validation(
                "specify either 'all' or 'ids', not both",
            )),
            (false, Some(ids)) if !ids.is_empty() => Ok(Self::Ids(ids)),
            _ => Err(ControlPlaneError::validation(
                "redrive requires 'all: true' or a non-empty 'ids' list",
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RedriveResponse {
    pub success: bool,
    pub message: String,
    pub processed: usize,
    pub failed: usize,
}

impl RedriveResponse {
    pub fn new(processed: usize, failed: usize) -> Self {
        let mut message = format!("redrove {} events", processed);
        if failed > 0 {
            message.push_str(&format!(", {} failed", failed));
        }
        Self {
            success: failed == 0,
            message,
            processed,
            failed,
        }
    }
}
