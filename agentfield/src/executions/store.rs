//! Execution record store.
//!
//! All mutation goes through [`ExecutionRecordStore::update`], a
//! fetch-apply-persist cycle guarded by the row version. The transform may run
//! several times and must be pure. Every successful write is published on the
//! execution bus after it is durable, so a subscriber that re-reads the record
//! always sees at least the published state.

use agentfield_core::types::*;
use agentfield_core::{ControlPlaneError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::events::ExecutionBus;
use crate::storage::{MAX_UPDATE_ATTEMPTS, StorageProvider};
use crate::workflow::WorkflowTracker;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPage {
    pub executions: Vec<ExecutionRecord>,
    pub total_count: usize,
}

pub struct ExecutionRecordStore {
    storage: Arc<dyn StorageProvider>,
    bus: ExecutionBus,
    workflows: Arc<WorkflowTracker>,
}

impl ExecutionRecordStore {
    pub fn new(storage: Arc<dyn StorageProvider>, bus: ExecutionBus, workflows: Arc<WorkflowTracker>) -> Self {
        Self {
            storage,
            bus,
            workflows,
        }
    }

    pub fn workflows(&self) -> &Arc<WorkflowTracker> {
        &self.workflows
    }

    /// Insert a new record together with its workflow write.
    ///
    /// Fails with `AlreadyExists` on a duplicate execution id.
    pub async fn create(&self, record: ExecutionRecord, workflow: WorkflowWrite) -> Result<ExecutionRecord> {
        let started_run = match &workflow {
            WorkflowWrite::StartRun { run, .. } => Some(run.run_id.clone()),
            _ => None,
        };

        let stored = self.storage.insert_execution(record, workflow).await?;
        let now = Utc::now();
        debug!(
            execution_id = %stored.execution_id,
            run_id = ?stored.run_id,
            depth = stored.workflow_depth,
            "Execution created"
        );

        if let Some(run_id) = started_run {
            if let Some(run) = self.storage.get_run(&run_id).await? {
                self.workflows.on_run_started(&run, now);
            }
        }
        self.publish(&stored, None).await;
        Ok(stored)
    }

    /// Apply `transform` atomically.
    ///
    /// A transform that returns the record unchanged is a no-op: nothing is
    /// written or published. Lost races are retried up to
    /// [`MAX_UPDATE_ATTEMPTS`] times before surfacing `Conflict`.
    pub async fn update<F>(&self, execution_id: &str, mut transform: F) -> Result<ExecutionRecord>
    where
        F: FnMut(&ExecutionRecord) -> Result<ExecutionRecord> + Send,
    {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let current = self.get(execution_id).await?;
            let mut next = transform(&current)?;
            if next == current {
                return Ok(current);
            }
            next.execution_id = current.execution_id.clone();

            match self.storage.update_execution(next, current.version).await {
                Ok(stored) => {
                    self.publish(&stored, Some(current.status)).await;
                    return Ok(stored);
                }
                Err(e) if e.is_retryable() => {
                    debug!(execution_id = %execution_id, attempt, "Execution update lost a race, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(ControlPlaneError::conflict(format!(
            "execution {} update did not converge after {} attempts",
            execution_id, MAX_UPDATE_ATTEMPTS
        )))
    }

    /// Convenience wrapper for a plain status transition.
    pub async fn transition(&self, execution_id: &str, status: ExecutionStatus) -> Result<ExecutionRecord> {
        self.update(execution_id, |current| {
            let mut next = current.clone();
            next.transition_to(status, Utc::now())?;
            Ok(next)
        })
        .await
    }

    async fn publish(&self, record: &ExecutionRecord, previous_status: Option<ExecutionStatus>) {
        let now = Utc::now();
        self.bus.publish(ExecutionEvent {
            record: record.clone(),
            previous_status,
            timestamp: now,
        });
        if let Err(e) = self.workflows.on_execution_changed(record, now).await {
            warn!(execution_id = %record.execution_id, error = %e, "Failed to update workflow for execution");
        }
    }

    pub async fn get(&self, execution_id: &str) -> Result<ExecutionRecord> {
        self.storage
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| ControlPlaneError::not_found("execution", execution_id))
    }

    pub async fn query(&self, filter: &ExecutionFilter) -> Result<ExecutionPage> {
        let executions = self.storage.query_executions(filter).await?;
        let total_count = self.storage.count_executions(filter).await?;
        Ok(ExecutionPage {
            executions,
            total_count,
        })
    }

    pub async fn count(&self, filter: &ExecutionFilter) -> Result<usize> {
        self.storage.count_executions(filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::storage::{ExecutionStore, MemoryStorage};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store_over(storage: Arc<dyn StorageProvider>) -> (ExecutionRecordStore, ExecutionBus) {
        let bus: ExecutionBus = EventBus::new("executions", 100);
        let tracker = Arc::new(WorkflowTracker::new(
            storage.clone(),
            EventBus::new("workflow_executions", 100),
            EventBus::new("workflow_runs", 100),
            10,
        ));
        (ExecutionRecordStore::new(storage, bus.clone(), tracker), bus)
    }

    fn record(id: &str) -> ExecutionRecord {
        ExecutionRecord::new(id, "node-1", "plan", json!({"q": 1}), Utc::now())
    }

    #[tokio::test]
    async fn test_create_publishes_after_write() {
        let (store, bus) = store_over(Arc::new(MemoryStorage::new()));
        let mut events = bus.subscribe();

        store.create(record("e1"), WorkflowWrite::None).await.unwrap();

        let event = events.try_recv().unwrap();
        assert_eq!(event.event_type(), "execution.created");
        // State is readable by the time the event is observed.
        assert_eq!(store.get(&event.record.execution_id).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_duplicate_create_fails() {
        let (store, _) = store_over(Arc::new(MemoryStorage::new()));
        store.create(record("e1"), WorkflowWrite::None).await.unwrap();
        let err = store.create(record("e1"), WorkflowWrite::None).await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_terminal_state_is_sticky() {
        let (store, bus) = store_over(Arc::new(MemoryStorage::new()));
        store.create(record("e1"), WorkflowWrite::None).await.unwrap();
        store.transition("e1", ExecutionStatus::Running).await.unwrap();
        store.transition("e1", ExecutionStatus::Succeeded).await.unwrap();

        let mut events = bus.subscribe();
        // Replaying the same terminal state is a silent no-op.
        store.transition("e1", ExecutionStatus::Succeeded).await.unwrap();
        assert!(events.try_recv().is_none());

        let err = store.transition("e1", ExecutionStatus::Failed).await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::Conflict(_)));
        assert_eq!(store.get("e1").await.unwrap().status, ExecutionStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_unknown_execution_is_not_found() {
        let (store, _) = store_over(Arc::new(MemoryStorage::new()));
        let err = store
            .transition("missing", ExecutionStatus::Running)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    /// Storage whose first `racing` updates lose to a concurrent writer.
    struct RacingStorage {
        inner: MemoryStorage,
        racing: AtomicUsize,
    }

    #[async_trait]
    impl ExecutionStore for RacingStorage {
        async fn get_execution(&self, id: &str) -> Result<Option<ExecutionRecord>> {
            self.inner.get_execution(id).await
        }

        async fn insert_execution(&self, r: ExecutionRecord, w: WorkflowWrite) -> Result<ExecutionRecord> {
            self.inner.insert_execution(r, w).await
        }

        async fn update_execution(&self, r: ExecutionRecord, v: u64) -> Result<ExecutionRecord> {
            if self.racing.load(Ordering::SeqCst) > 0 {
                self.racing.fetch_sub(1, Ordering::SeqCst);
                // Someone else bumps the row first.
                let current = self.inner.get_execution(&r.execution_id).await?.unwrap();
                self.inner.update_execution(current, v).await?;
            }
            self.inner.update_execution(r, v).await
        }

        async fn query_executions(&self, f: &ExecutionFilter) -> Result<Vec<ExecutionRecord>> {
            self.inner.query_executions(f).await
        }

        async fn count_executions(&self, f: &ExecutionFilter) -> Result<usize> {
            self.inner.count_executions(f).await
        }

        async fn list_stale_executions(&self, b: DateTime<Utc>, l: usize) -> Result<Vec<ExecutionRecord>> {
            self.inner.list_stale_executions(b, l).await
        }

        async fn list_expired_executions(&self, b: DateTime<Utc>, l: usize) -> Result<Vec<String>> {
            self.inner.list_expired_executions(b, l).await
        }

        async fn delete_executions(&self, ids: &[String], b: DateTime<Utc>) -> Result<usize> {
            self.inner.delete_executions(ids, b).await
        }
    }

    crate::storage::memory::delegate_non_execution_stores!(RacingStorage);

    #[tokio::test]
    async fn test_lost_race_is_retried_then_surfaced() {
        let storage = Arc::new(RacingStorage {
            inner: MemoryStorage::new(),
            racing: AtomicUsize::new(2),
        });
        let (store, _) = store_over(storage.clone());
        store.create(record("e1"), WorkflowWrite::None).await.unwrap();

        let calls = AtomicUsize::new(0);
        let updated = store
            .update("e1", |current| {
                calls.fetch_add(1, Ordering::SeqCst);
                let mut next = current.clone();
                next.transition_to(ExecutionStatus::Running, Utc::now())?;
                Ok(next)
            })
            .await
            .unwrap();
        assert_eq!(updated.status, ExecutionStatus::Running);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        storage.racing.store(MAX_UPDATE_ATTEMPTS, Ordering::SeqCst);
        let err = store
            .transition("e1", ExecutionStatus::Succeeded)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
