//! Persistence contract.
//!
//! Every mutable row carries a `version`. Writes are compare-and-swap against
//! an expected version; `None` means insert-if-absent. A lost race is reported
//! as [`ControlPlaneError::Conflict`] and a duplicate insert as
//! [`ControlPlaneError::AlreadyExists`]. Stored rows are returned with their
//! new version.
//!
//! [`ControlPlaneError::Conflict`]: agentfield_core::ControlPlaneError::Conflict
//! [`ControlPlaneError::AlreadyExists`]: agentfield_core::ControlPlaneError::AlreadyExists

pub mod memory;

pub use memory::MemoryStorage;

use agentfield_core::Result;
use agentfield_core::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Read-modify-write attempts before a lost compare-and-swap race is surfaced.
pub const MAX_UPDATE_ATTEMPTS: usize = 5;

#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn get_node(&self, id: &str) -> Result<Option<AgentNode>>;

    async fn list_nodes(&self) -> Result<Vec<AgentNode>>;

    async fn put_node(&self, node: AgentNode, expected_version: Option<u64>) -> Result<AgentNode>;

    async fn delete_node(&self, id: &str) -> Result<bool>;
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn get_execution(&self, id: &str) -> Result<Option<ExecutionRecord>>;

    /// Insert a new record together with its workflow write in one atomic step.
    ///
    /// Parent-step existence is checked inside the same critical section, so a
    /// reader never observes a step without its execution or a child without
    /// its parent.
    async fn insert_execution(
        &self,
        record: ExecutionRecord,
        workflow: WorkflowWrite,
    ) -> Result<ExecutionRecord>;

    async fn update_execution(
        &self,
        record: ExecutionRecord,
        expected_version: u64,
    ) -> Result<ExecutionRecord>;

    /// Matching records, newest first, honouring `limit`/`offset`.
    async fn query_executions(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>>;

    /// Number of matching records, ignoring `limit`/`offset`.
    async fn count_executions(&self, filter: &ExecutionFilter) -> Result<usize>;

    /// Non-terminal records not updated since `updated_before`, oldest first.
    async fn list_stale_executions(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>>;

    /// Ids of terminal records completed before `completed_before`, oldest first.
    async fn list_expired_executions(
        &self,
        completed_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>>;

    /// Delete the given records if they are still terminal and completed before
    /// the cutoff. A record with a child that is not deleted in the same call
    /// is kept, so no surviving step loses its parent. Cascades to workflow
    /// steps and to execution webhooks that have no dead letters left; runs
    /// left without steps are removed. Returns the number deleted.
    async fn delete_executions(
        &self,
        ids: &[String],
        completed_before: DateTime<Utc>,
    ) -> Result<usize>;
}

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>>;

    async fn put_run(&self, run: WorkflowRun, expected_version: u64) -> Result<WorkflowRun>;

    async fn get_step(&self, step_id: &str) -> Result<Option<WorkflowStep>>;

    /// Steps of a run ordered by depth, then creation time.
    async fn list_steps(&self, run_id: &str) -> Result<Vec<WorkflowStep>>;

    /// Matching runs, newest first, honouring `limit`/`offset`.
    async fn query_runs(&self, filter: &WorkflowFilter) -> Result<Vec<WorkflowRun>>;

    async fn count_runs(&self, filter: &WorkflowFilter) -> Result<usize>;
}

#[async_trait]
pub trait WebhookStore: Send + Sync {
    async fn get_observability_webhook(&self) -> Result<Option<ObservabilityWebhookConfig>>;

    async fn put_observability_webhook(
        &self,
        config: ObservabilityWebhookConfig,
        expected_version: Option<u64>,
    ) -> Result<ObservabilityWebhookConfig>;

    async fn delete_observability_webhook(&self) -> Result<bool>;

    async fn get_execution_webhook(&self, execution_id: &str) -> Result<Option<ExecutionWebhook>>;

    async fn put_execution_webhook(
        &self,
        webhook: ExecutionWebhook,
        expected_version: Option<u64>,
    ) -> Result<ExecutionWebhook>;
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Persist an entry and return its assigned id.
    async fn insert_dead_letter(&self, entry: DeadLetterEntry) -> Result<i64>;

    /// Entries oldest first.
    async fn list_dead_letters(&self, limit: usize, offset: usize) -> Result<Vec<DeadLetterEntry>>;

    async fn get_dead_letter(&self, id: i64) -> Result<Option<DeadLetterEntry>>;

    async fn count_dead_letters(&self) -> Result<usize>;

    async fn delete_dead_letter(&self, id: i64) -> Result<bool>;

    /// Bump `retry_count` by one and record the latest error.
    async fn record_redrive_failure(&self, id: i64, error_message: &str) -> Result<Option<DeadLetterEntry>>;

    async fn clear_dead_letters(&self) -> Result<usize>;
}

/// Everything the control plane persists.
pub trait StorageProvider:
    NodeStore + ExecutionStore + WorkflowStore + WebhookStore + DeadLetterStore
{
}

impl<T> StorageProvider for T where
    T: NodeStore + ExecutionStore + WorkflowStore + WebhookStore + DeadLetterStore
{
}
