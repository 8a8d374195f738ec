//! Workflow run and step tracking.
//!
//! Runs are trees of steps. The tracker builds validated workflow writes that
//! the execution store applies atomically with the execution insert, then
//! follows execution changes to publish step events and settle the run's
//! aggregate status once every step is terminal.

use agentfield_core::types::*;
use agentfield_core::{ControlPlaneError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::events::{WorkflowExecutionBus, WorkflowRunBus};
use crate::storage::{MAX_UPDATE_ATTEMPTS, StorageProvider};

/// A run with all of its steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunDetail {
    pub run: WorkflowRun,
    pub steps: Vec<WorkflowStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunPage {
    pub runs: Vec<WorkflowRun>,
    pub total_count: usize,
}

pub struct WorkflowTracker {
    storage: Arc<dyn StorageProvider>,
    step_bus: WorkflowExecutionBus,
    run_bus: WorkflowRunBus,
    max_depth: u32,
}

impl WorkflowTracker {
    pub fn new(
        storage: Arc<dyn StorageProvider>,
        step_bus: WorkflowExecutionBus,
        run_bus: WorkflowRunBus,
        max_depth: u32,
    ) -> Self {
        Self {
            storage,
            step_bus,
            run_bus,
            max_depth,
        }
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Root write for a new run whose first step is `root`.
    pub fn start_run(&self, run_id: &str, root: &mut ExecutionRecord) -> Result<WorkflowWrite> {
        if run_id.trim().is_empty() {
            return Err(ControlPlaneError::validation("run id must not be empty"));
        }
        if root.parent_execution_id.is_some() {
            return Err(ControlPlaneError::validation(
                "root workflow step must not have a parent",
            ));
        }
        root.run_id = Some(run_id.to_string());
        root.workflow_depth = 0;

        let run = WorkflowRun::new(run_id, &root.execution_id, root.created_at);
        let step = WorkflowStep::for_execution(root, run_id, None, 0);
        Ok(WorkflowWrite::StartRun { run, root: step })
    }

    /// Child write attaching `record` under `parent_step_id`.
    ///
    /// The parent must already be stored; the store re-checks this inside the
    /// write. Rejected with `DepthExceeded` past the configured maximum depth.
    pub async fn append_step(
        &self,
        run_id: Option<&str>,
        record: &mut ExecutionRecord,
        parent_step_id: &str,
    ) -> Result<WorkflowWrite> {
        let parent = self.storage.get_step(parent_step_id).await?.ok_or_else(|| {
            ControlPlaneError::validation(format!("parent step {} does not exist", parent_step_id))
        })?;

        if let Some(run_id) = run_id {
            if run_id != parent.run_id {
                return Err(ControlPlaneError::validation(format!(
                    "parent step {} belongs to run {}, not {}",
                    parent_step_id, parent.run_id, run_id
                )));
            }
        }

        let depth = parent.depth + 1;
        if depth > self.max_depth {
            warn!(
                run_id = %parent.run_id,
                parent_step_id = %parent_step_id,
                depth,
                max_depth = self.max_depth,
                "Rejecting execution past maximum workflow depth"
            );
            return Err(ControlPlaneError::DepthExceeded {
                depth,
                max: self.max_depth,
            });
        }

        record.run_id = Some(parent.run_id.clone());
        record.parent_execution_id = Some(parent.execution_id.clone());
        record.workflow_depth = depth;

        let step = WorkflowStep::for_execution(
            record,
            parent.run_id.clone(),
            Some(parent.step_id.clone()),
            depth,
        );
        Ok(WorkflowWrite::AppendStep { step })
    }

    /// Decide how a new execution joins the workflow graph.
    ///
    /// With a parent it becomes a child step; otherwise it roots a new run,
    /// under `run_id` when given or a generated id.
    pub async fn plan(
        &self,
        record: &mut ExecutionRecord,
        run_id: Option<String>,
        parent_execution_id: Option<String>,
    ) -> Result<WorkflowWrite> {
        match parent_execution_id {
            Some(parent) => self.append_step(run_id.as_deref(), record, &parent).await,
            None => {
                let run_id = run_id.unwrap_or_else(|| format!("run_{}", uuid::Uuid::new_v4().simple()));
                self.start_run(&run_id, record)
            }
        }
    }

    pub(crate) fn on_run_started(&self, run: &WorkflowRun, now: DateTime<Utc>) {
        info!(run_id = %run.run_id, root_execution_id = %run.root_execution_id, "Workflow run started");
        self.run_bus.publish(WorkflowRunEvent {
            run: run.clone(),
            timestamp: now,
        });
    }

    /// Publish the step event for `record` and settle its run when complete.
    pub(crate) async fn on_execution_changed(&self, record: &ExecutionRecord, now: DateTime<Utc>) -> Result<()> {
        let Some(run_id) = record.run_id.as_deref() else {
            return Ok(());
        };
        let Some(step) = self.storage.get_step(&record.execution_id).await? else {
            return Ok(());
        };

        self.step_bus.publish(WorkflowExecutionEvent {
            run_id: run_id.to_string(),
            step_id: step.step_id.clone(),
            execution_id: record.execution_id.clone(),
            parent_step_id: step.parent_step_id.clone(),
            depth: step.depth,
            status: record.status,
            timestamp: now,
        });

        if record.is_terminal() {
            self.settle_run(run_id, now).await?;
        }
        Ok(())
    }

    /// Recompute a run's aggregate status from its steps.
    async fn settle_run(&self, run_id: &str, now: DateTime<Utc>) -> Result<()> {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let Some(run) = self.storage.get_run(run_id).await? else {
                return Ok(());
            };

            let mut statuses = Vec::new();
            for step in self.storage.list_steps(run_id).await? {
                if let Some(exec) = self.storage.get_execution(&step.execution_id).await? {
                    statuses.push(exec.status);
                }
            }

            let Some(status) = RunStatus::aggregate(statuses) else {
                return Ok(());
            };
            if run.status == status {
                return Ok(());
            }

            let mut next = run.clone();
            next.status = status;
            next.updated_at = now;
            next.completed_at = Some(now);

            match self.storage.put_run(next, run.version).await {
                Ok(stored) => {
                    info!(run_id = %run_id, status = stored.status.as_str(), steps = stored.step_count, "Workflow run finished");
                    self.run_bus.publish(WorkflowRunEvent {
                        run: stored,
                        timestamp: now,
                    });
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    debug!(run_id = %run_id, attempt, "Run status update raced, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(ControlPlaneError::conflict(format!(
            "run {} status update did not converge",
            run_id
        )))
    }

    pub async fn get_run(&self, run_id: &str) -> Result<WorkflowRunDetail> {
        let run = self
            .storage
            .get_run(run_id)
            .await?
            .ok_or_else(|| ControlPlaneError::not_found("workflow run", run_id))?;
        let steps = self.storage.list_steps(run_id).await?;
        Ok(WorkflowRunDetail { run, steps })
    }

    pub async fn query(&self, filter: &WorkflowFilter) -> Result<WorkflowRunPage> {
        let runs = self.storage.query_runs(filter).await?;
        let total_count = self.storage.count_runs(filter).await?;
        Ok(WorkflowRunPage { runs, total_count })
    }

    pub async fn count(&self, filter: &WorkflowFilter) -> Result<usize> {
        self.storage.count_runs(filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn tracker(max_depth: u32) -> (WorkflowTracker, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let tracker = WorkflowTracker::new(
            storage.clone(),
            EventBus::new("workflow_executions", 100),
            EventBus::new("workflow_runs", 100),
            max_depth,
        );
        (tracker, storage)
    }

    fn record(id: &str) -> ExecutionRecord {
        ExecutionRecord::new(id, "node-1", "plan", json!({}), Utc::now())
    }

    async fn insert(
        tracker: &WorkflowTracker,
        storage: &MemoryStorage,
        id: &str,
        parent: Option<&str>,
    ) -> Result<ExecutionRecord> {
        use crate::storage::ExecutionStore;
        let mut r = record(id);
        let write = tracker
            .plan(&mut r, None, parent.map(str::to_string))
            .await?;
        storage.insert_execution(r, write).await
    }

    #[tokio::test]
    async fn test_root_with_parent_is_rejected() {
        let (tracker, _) = tracker(3);
        let mut r = record("e1");
        r.parent_execution_id = Some("someone".into());
        assert!(tracker.start_run("run-1", &mut r).is_err());
    }

    #[tokio::test]
    async fn test_missing_parent_is_rejected() {
        let (tracker, _) = tracker(3);
        let mut r = record("child");
        let err = tracker
            .append_step(None, &mut r, "does-not-exist")
            .await
            .unwrap_err();
        assert!(matches!(err, ControlPlaneError::Validation(_)));
    }

    #[tokio::test]
    async fn test_child_inherits_run_and_depth() {
        let (tracker, storage) = tracker(3);
        let root = insert(&tracker, &storage, "root", None).await.unwrap();
        let child = insert(&tracker, &storage, "child", Some("root")).await.unwrap();

        assert_eq!(child.run_id, root.run_id);
        assert_eq!(child.workflow_depth, 1);
        assert_eq!(child.parent_execution_id.as_deref(), Some("root"));

        let detail = tracker.get_run(root.run_id.as_deref().unwrap()).await.unwrap();
        assert_eq!(detail.steps.len(), 2);
        assert!(detail.steps[0].is_root());
    }

    #[tokio::test]
    async fn test_depth_limit() {
        let (tracker, storage) = tracker(2);
        insert(&tracker, &storage, "d0", None).await.unwrap();
        insert(&tracker, &storage, "d1", Some("d0")).await.unwrap();
        insert(&tracker, &storage, "d2", Some("d1")).await.unwrap();

        let err = insert(&tracker, &storage, "d3", Some("d2")).await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::DepthExceeded { depth: 3, max: 2 }));
        use crate::storage::ExecutionStore;
        assert!(storage.get_execution("d3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_settles_when_all_steps_terminal() {
        use crate::storage::ExecutionStore;
        let (tracker, storage) = tracker(3);
        let mut runs = tracker.run_bus.subscribe();

        let root = insert(&tracker, &storage, "root", None).await.unwrap();
        let child = insert(&tracker, &storage, "child", Some("root")).await.unwrap();
        let run_id = root.run_id.clone().unwrap();

        let mut done = root.clone();
        done.mark_succeeded(json!(1), Utc::now()).unwrap();
        let done = storage.update_execution(done, root.version).await.unwrap();
        tracker.on_execution_changed(&done, Utc::now()).await.unwrap();
        assert_eq!(tracker.get_run(&run_id).await.unwrap().run.status, RunStatus::Running);

        let mut failed = child.clone();
        failed
            .mark_terminal_error(ExecutionStatus::Timeout, "slow", Utc::now())
            .unwrap();
        let failed = storage.update_execution(failed, child.version).await.unwrap();
        tracker.on_execution_changed(&failed, Utc::now()).await.unwrap();

        let run = tracker.get_run(&run_id).await.unwrap().run;
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.completed_at.is_some());

        let event = runs.try_recv().unwrap();
        assert_eq!(event.event_type(), "workflow_run.failed");
    }

    #[tokio::test]
    async fn test_query_and_count_agree() {
        let (tracker, storage) = tracker(3);
        for i in 0..5 {
            insert(&tracker, &storage, &format!("e{}", i), None).await.unwrap();
        }
        let page = tracker
            .query(&WorkflowFilter {
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.runs.len(), 2);
        assert_eq!(page.total_count, 5);
        assert_eq!(tracker.count(&WorkflowFilter::default()).await.unwrap(), 5);
    }
}
