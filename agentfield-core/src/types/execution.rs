//! Execution records and their state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::{ControlPlaneError, Result};

/// Status of an execution.
///
/// Ordered `queued < running < terminal`; transitions only move forward and a
/// terminal status is final.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    pub const ALL: [ExecutionStatus; 6] = [
        Self::Queued,
        Self::Running,
        Self::Succeeded,
        Self::Failed,
        Self::Timeout,
        Self::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Running => 1,
            _ => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = ControlPlaneError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" | "pending" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" | "completed" | "success" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(ControlPlaneError::validation(format!(
                "unknown execution status '{}'",
                other
            ))),
        }
    }
}

/// BLAKE3 digest of a JSON payload, hex encoded.
pub fn payload_digest(payload: &Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

/// One invocation of a reasoner on an agent node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    pub execution_id: String,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub parent_execution_id: Option<String>,
    pub agent_node_id: String,
    pub reasoner_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Option<Value>,
    pub input_hash: String,
    #[serde(default)]
    pub output_hash: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub workflow_depth: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl ExecutionRecord {
    /// New queued execution.
    pub fn new(
        execution_id: impl Into<String>,
        agent_node_id: impl Into<String>,
        reasoner_id: impl Into<String>,
        input: Value,
        now: DateTime<Utc>,
    ) -> Self {
        let input_hash = payload_digest(&input);
        Self {
            execution_id: execution_id.into(),
            run_id: None,
            parent_execution_id: None,
            agent_node_id: agent_node_id.into(),
            reasoner_id: reasoner_id.into(),
            status: ExecutionStatus::Queued,
            input,
            output: None,
            input_hash,
            output_hash: None,
            error_message: None,
            workflow_depth: 0,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`.
    ///
    /// Returns `Ok(false)` when already in `next` (replayed update), and a
    /// `Conflict` for a backward move or a second, different terminal state.
    pub fn transition_to(&mut self, next: ExecutionStatus, now: DateTime<Utc>) -> Result<bool> {
        let current = self.status;
        if current == next {
            return Ok(false);
        }
        if current.is_terminal() {
            return Err(ControlPlaneError::conflict(format!(
                "execution {} is already {}; cannot transition to {}",
                self.execution_id, current, next
            )));
        }
        if next.rank() < current.rank() {
            return Err(ControlPlaneError::conflict(format!(
                "execution {} cannot move from {} back to {}",
                self.execution_id, current, next
            )));
        }

        self.status = next;
        self.updated_at = now;
        if next == ExecutionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(true)
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) -> Result<bool> {
        self.transition_to(ExecutionStatus::Running, now)
    }

    pub fn mark_succeeded(&mut self, output: Value, now: DateTime<Utc>) -> Result<bool> {
        let changed = self.transition_to(ExecutionStatus::Succeeded, now)?;
        if changed {
            self.output_hash = Some(payload_digest(&output));
            self.output = Some(output);
        }
        Ok(changed)
    }

    /// Terminal failure (`Failed`, `Timeout` or `Cancelled`) with a message.
    pub fn mark_terminal_error(
        &mut self,
        status: ExecutionStatus,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self.transition_to(status, now)?;
        if changed {
            self.error_message = Some(message.into());
        }
        Ok(changed)
    }

    /// Milliseconds from start (or creation) to completion.
    pub fn duration_ms(&self) -> Option<i64> {
        let end = self.completed_at?;
        let start = self.started_at.unwrap_or(self.created_at);
        Some((end - start).num_milliseconds().max(0))
    }
}

/// Query filter over execution records. Empty fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionFilter {
    #[serde(default)]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub status: Option<ExecutionStatus>,
    #[serde(default)]
    pub agent_node_id: Option<String>,
    #[serde(default)]
    pub reasoner_id: Option<String>,
    #[serde(default)]
    pub started_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

impl ExecutionFilter {
    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        if let Some(id) = &self.execution_id {
            if &record.execution_id != id {
                return false;
            }
        }
        if let Some(run_id) = &self.run_id {
            if record.run_id.as_ref() != Some(run_id) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if let Some(node) = &self.agent_node_id {
            if &record.agent_node_id != node {
                return false;
            }
        }
        if let Some(reasoner) = &self.reasoner_id {
            if &record.reasoner_id != reasoner {
                return false;
            }
        }
        // Time bounds use the start time, falling back to creation for queued records.
        let started = record.started_at.unwrap_or(record.created_at);
        if let Some(after) = self.started_after {
            if started < after {
                return false;
            }
        }
        if let Some(before) = self.started_before {
            if started > before {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReasonerEventKind {
    Started,
    Completed,
    Failed,
}

/// A reasoner call starting or finishing on an agent node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReasonerEvent {
    pub kind: ReasonerEventKind,
    pub reasoner_id: String,
    pub node_id: String,
    pub execution_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ReasonerEvent {
    /// Event for `record` as it stands after a transition. `None` unless the
    /// call has started.
    pub fn for_record(record: &ExecutionRecord, timestamp: DateTime<Utc>) -> Option<Self> {
        record.started_at?;
        let kind = match record.status {
            ExecutionStatus::Running => ReasonerEventKind::Started,
            ExecutionStatus::Succeeded => ReasonerEventKind::Completed,
            ExecutionStatus::Queued => return None,
            _ => ReasonerEventKind::Failed,
        };
        Some(Self {
            kind,
            reasoner_id: record.reasoner_id.clone(),
            node_id: record.agent_node_id.clone(),
            execution_id: record.execution_id.clone(),
            status: record.status,
            duration_ms: record.duration_ms(),
            error_message: record.error_message.clone(),
            timestamp,
        })
    }

    pub fn event_type(&self) -> &'static str {
        match self.kind {
            ReasonerEventKind::Started => "reasoner.started",
            ReasonerEventKind::Completed => "reasoner.completed",
            ReasonerEventKind::Failed => "reasoner.failed",
        }
    }
}

/// Execution state change published on the execution bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionEvent {
    pub record: ExecutionRecord,
    /// `None` when the record was just created.
    pub previous_status: Option<ExecutionStatus>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionEvent {
    pub fn event_type(&self) -> &'static str {
        if self.previous_status.is_none() {
            return "execution.created";
        }
        match self.record.status {
            ExecutionStatus::Queued => "execution.queued",
            ExecutionStatus::Running => "execution.started",
            ExecutionStatus::Succeeded => "execution.completed",
            ExecutionStatus::Failed => "execution.failed",
            ExecutionStatus::Timeout => "execution.timeout",
            ExecutionStatus::Cancelled => "execution.cancelled",
        }
    }
}

/// Body of `POST /execute/{agent}.{reasoner}` and its async variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub input: Value,
    /// Run to join; a new run is started when absent and there is no parent.
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub parent_execution_id: Option<String>,
    /// Callback for async executions.
    #[serde(default)]
    pub webhook: Option<super::webhook::ExecutionWebhookRequest>,
}

/// Target of an execute call, written `agent.reasoner`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionTarget {
    pub agent_node_id: String,
    pub reasoner_id: String,
}

impl FromStr for ExecutionTarget {
    type Err = ControlPlaneError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((agent, reasoner)) if !agent.is_empty() && !reasoner.is_empty() => Ok(Self {
                agent_node_id: agent.to_string(),
                reasoner_id: reasoner.to_string(),
            }),
            _ => Err(ControlPlaneError::validation(format!(
                "target '{}' must be of the form agent.reasoner",
                s
            ))),
        }
    }
}

/// Result of a synchronous execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecuteResponse {
    pub execution_id: String,
    #[serde(default)]
    pub run_id: Option<String>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
}

impl From<&ExecutionRecord> for ExecuteResponse {
    fn from(record: &ExecutionRecord) -> Self {
        Self {
            execution_id: record.execution_id.clone(),
            run_id: record.run_id.clone(),
            status: record.status,
            result: record.output.clone(),
            error_message: record.error_message.clone(),
            duration_ms: record.duration_ms(),
        }
    }
}

/// Acknowledgement of an accepted async execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AsyncExecuteResponse {
    pub execution_id: String,
    #[serde(default)]
    pub run_id: Option<String>,
    pub status: ExecutionStatus,
    pub webhook_registered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_error: Option<String>,
}

/// Status report posted by an agent node for an execution it accepted
/// asynchronously.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatusReport {
    pub status: ExecutionStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}
