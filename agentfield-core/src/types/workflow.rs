//! Workflow runs and steps.
//!
//! A run is the root of one externally triggered call chain. Steps form a
//! tree: every step has at most one parent, and the step id is the id of the
//! execution it wraps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::execution::{ExecutionRecord, ExecutionStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Aggregate status of a run, or `None` while any step is still in flight.
    pub fn aggregate<I>(statuses: I) -> Option<RunStatus>
    where
        I: IntoIterator<Item = ExecutionStatus>,
    {
        let mut any = false;
        let mut failed = false;
        let mut cancelled = false;
        for status in statuses {
            any = true;
            match status {
                ExecutionStatus::Queued | ExecutionStatus::Running => return None,
                ExecutionStatus::Failed | ExecutionStatus::Timeout => failed = true,
                ExecutionStatus::Cancelled => cancelled = true,
                ExecutionStatus::Succeeded => {}
            }
        }
        if !any {
            return None;
        }
        Some(if failed {
            RunStatus::Failed
        } else if cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Succeeded
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowRun {
    pub run_id: String,
    pub root_execution_id: String,
    pub status: RunStatus,
    pub step_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: u64,
}

impl WorkflowRun {
    pub fn new(run_id: impl Into<String>, root_execution_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.into(),
            root_execution_id: root_execution_id.into(),
            status: RunStatus::Running,
            step_count: 1,
            created_at: now,
            updated_at: now,
            completed_at: None,
            version: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStep {
    pub step_id: String,
    pub run_id: String,
    pub execution_id: String,
    #[serde(default)]
    pub parent_step_id: Option<String>,
    pub depth: u32,
    pub agent_node_id: String,
    pub reasoner_id: String,
    pub created_at: DateTime<Utc>,
}

impl WorkflowStep {
    /// Step wrapping `record`; the step id is the execution id.
    pub fn for_execution(
        record: &ExecutionRecord,
        run_id: impl Into<String>,
        parent_step_id: Option<String>,
        depth: u32,
    ) -> Self {
        Self {
            step_id: record.execution_id.clone(),
            run_id: run_id.into(),
            execution_id: record.execution_id.clone(),
            parent_step_id,
            depth,
            agent_node_id: record.agent_node_id.clone(),
            reasoner_id: record.reasoner_id.clone(),
            created_at: record.created_at,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_step_id.is_none()
    }
}

/// Workflow mutation applied in the same atomic write as an execution insert.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowWrite {
    None,
    StartRun { run: WorkflowRun, root: WorkflowStep },
    AppendStep { step: WorkflowStep },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowFilter {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

impl WorkflowFilter {
    pub fn matches(&self, run: &WorkflowRun) -> bool {
        self.run_id.as_ref().is_none_or(|id| &run.run_id == id)
            && self.status.is_none_or(|s| run.status == s)
    }
}

/// A step's execution changed state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowExecutionEvent {
    pub run_id: String,
    pub step_id: String,
    pub execution_id: String,
    pub parent_step_id: Option<String>,
    pub depth: u32,
    pub status: ExecutionStatus,
    pub timestamp: DateTime<Utc>,
}

/// A run started or reached its aggregate terminal status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowRunEvent {
    pub run: WorkflowRun,
    pub timestamp: DateTime<Utc>,
}

impl WorkflowRunEvent {
    pub fn event_type(&self) -> &'static str {
        match self.run.status {
            RunStatus::Running => "workflow_run.started",
            RunStatus::Succeeded => "workflow_run.completed",
            RunStatus::Failed => "workflow_run.failed",
            RunStatus::Cancelled => "workflow_run.cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExecutionStatus::*;

    #[test]
    fn test_aggregate_waits_for_all_steps() {
        assert_eq!(RunStatus::aggregate([Succeeded, Running]), None);
        assert_eq!(RunStatus::aggregate(Vec::<ExecutionStatus>::new()), None);
    }

    #[test]
    fn test_aggregate_precedence() {
        assert_eq!(RunStatus::aggregate([Succeeded, Succeeded]), Some(RunStatus::Succeeded));
        assert_eq!(RunStatus::aggregate([Succeeded, Cancelled]), Some(RunStatus::Cancelled));
        assert_eq!(RunStatus::aggregate([Cancelled, Timeout]), Some(RunStatus::Failed));
        assert_eq!(RunStatus::aggregate([Failed, Succeeded]), Some(RunStatus::Failed));
    }
}
