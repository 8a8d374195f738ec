//! In-memory storage backend.
//!
//! All state sits behind one lock and every write completes inside a single
//! critical section, which gives the same atomicity a transactional backend
//! provides. No lock is held across an await point.

use agentfield_core::types::*;
use agentfield_core::{ControlPlaneError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};

use super::{DeadLetterStore, ExecutionStore, NodeStore, WebhookStore, WorkflowStore};

fn has_webhook_dead_letters(state: &MemoryState, execution_id: &str) -> bool {
    state.dead_letters.values().any(|entry| {
        matches!(
            &entry.destination,
            DeadLetterDestination::ExecutionWebhook { execution_id: id } if id == execution_id
        )
    })
}

/// Drop the webhook row of a collected execution once its last dead letter is gone.
fn release_orphaned_webhook(state: &mut MemoryState, execution_id: &str) {
    if !state.executions.contains_key(execution_id) && !has_webhook_dead_letters(state, execution_id) {
        state.execution_webhooks.remove(execution_id);
    }
}

#[derive(Default)]
struct MemoryState {
    nodes: HashMap<String, AgentNode>,
    executions: HashMap<String, ExecutionRecord>,
    runs: HashMap<String, WorkflowRun>,
    steps: HashMap<String, WorkflowStep>,
    observability_webhook: Option<ObservabilityWebhookConfig>,
    execution_webhooks: HashMap<String, ExecutionWebhook>,
    dead_letters: BTreeMap<i64, DeadLetterEntry>,
    next_dead_letter_id: i64,
}

#[derive(Default)]
pub struct MemoryStorage {
    state: RwLock<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Shared compare-and-swap check for versioned rows.
fn check_version(
    resource: &str,
    id: &str,
    current: Option<u64>,
    expected: Option<u64>,
) -> Result<u64> {
    match (current, expected) {
        (None, None) => Ok(1),
        (Some(_), None) => Err(ControlPlaneError::already_exists(resource, id)),
        (None, Some(_)) => Err(ControlPlaneError::not_found(resource, id)),
        (Some(cur), Some(exp)) if cur == exp => Ok(cur + 1),
        (Some(cur), Some(exp)) => Err(ControlPlaneError::conflict(format!(
            "{} {} was modified concurrently (expected version {}, found {})",
            resource, id, exp, cur
        ))),
    }
}

fn paginate<T>(items: Vec<T>, limit: Option<usize>, offset: Option<usize>) -> Vec<T> {
    let offset = offset.unwrap_or(0);
    match limit {
        Some(limit) => items.into_iter().skip(offset).take(limit).collect(),
        None => items.into_iter().skip(offset).collect(),
    }
}

#[async_trait]
impl NodeStore for MemoryStorage {
    async fn get_node(&self, id: &str) -> Result<Option<AgentNode>> {
        Ok(self.state.read().nodes.get(id).cloned())
    }

    async fn list_nodes(&self) -> Result<Vec<AgentNode>> {
        let mut nodes: Vec<_> = self.state.read().nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }

    async fn put_node(&self, mut node: AgentNode, expected_version: Option<u64>) -> Result<AgentNode> {
        let mut state = self.state.write();
        let current = state.nodes.get(&node.id).map(|n| n.version);
        node.version = check_version("node", &node.id, current, expected_version)?;
        state.nodes.insert(node.id.clone(), node.clone());
        Ok(node)
    }

    async fn delete_node(&self, id: &str) -> Result<bool> {
        Ok(self.state.write().nodes.remove(id).is_some())
    }
}

#[async_trait]
impl ExecutionStore for MemoryStorage {
    async fn get_execution(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        Ok(self.state.read().executions.get(id).cloned())
    }

    async fn insert_execution(
        &self,
        mut record: ExecutionRecord,
        workflow: WorkflowWrite,
    ) -> Result<ExecutionRecord> {
        let mut state = self.state.write();

        if state.executions.contains_key(&record.execution_id) {
            return Err(ControlPlaneError::already_exists("execution", &record.execution_id));
        }

        // Validate the workflow half before touching anything.
        match &workflow {
            WorkflowWrite::None => {}
            WorkflowWrite::StartRun { run, root } => {
                if state.runs.contains_key(&run.run_id) {
                    return Err(ControlPlaneError::already_exists("workflow run", &run.run_id));
                }
                if root.parent_step_id.is_some() {
                    return Err(ControlPlaneError::validation(
                        "root workflow step must not have a parent",
                    ));
                }
                if root.execution_id != record.execution_id || root.run_id != run.run_id {
                    return Err(ControlPlaneError::validation(
                        "root workflow step must reference the new execution and run",
                    ));
                }
            }
            WorkflowWrite::AppendStep { step } => {
                if !state.runs.contains_key(&step.run_id) {
                    return Err(ControlPlaneError::not_found("workflow run", &step.run_id));
                }
                let parent_id = step.parent_step_id.as_deref().ok_or_else(|| {
                    ControlPlaneError::validation("non-root workflow step requires a parent step")
                })?;
                match state.steps.get(parent_id) {
                    Some(parent) if parent.run_id == step.run_id => {}
                    _ => {
                        return Err(ControlPlaneError::validation(format!(
                            "parent step {} does not exist in run {}",
                            parent_id, step.run_id
                        )));
                    }
                }
                if state.steps.contains_key(&step.step_id) {
                    return Err(ControlPlaneError::already_exists("workflow step", &step.step_id));
                }
                if step.execution_id != record.execution_id {
                    return Err(ControlPlaneError::validation(
                        "workflow step must reference the new execution",
                    ));
                }
            }
        }

        record.version = 1;
        state
            .executions
            .insert(record.execution_id.clone(), record.clone());

        match workflow {
            WorkflowWrite::None => {}
            WorkflowWrite::StartRun { mut run, root } => {
                run.version = 1;
                run.step_count = 1;
                state.runs.insert(run.run_id.clone(), run);
                state.steps.insert(root.step_id.clone(), root);
            }
            WorkflowWrite::AppendStep { step } => {
                if let Some(run) = state.runs.get_mut(&step.run_id) {
                    run.step_count += 1;
                    run.version += 1;
                    run.updated_at = record.created_at;
                    if run.status.is_terminal() {
                        run.status = RunStatus::Running;
                        run.completed_at = None;
                    }
                }
                state.steps.insert(step.step_id.clone(), step);
            }
        }

        Ok(record)
    }

    async fn update_execution(
        &self,
        mut record: ExecutionRecord,
        expected_version: u64,
    ) -> Result<ExecutionRecord> {
        let mut state = self.state.write();
        let current = state.executions.get(&record.execution_id).map(|r| r.version);
        record.version = check_version(
            "execution",
            &record.execution_id,
            current,
            Some(expected_version),
        )?;
        state
            .executions
            .insert(record.execution_id.clone(), record.clone());
        Ok(record)
    }

    async fn query_executions(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>> {
        let state = self.state.read();
        let mut matched: Vec<_> = state
            .executions
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.execution_id.cmp(&b.execution_id))
        });
        Ok(paginate(matched, filter.limit, filter.offset))
    }

    async fn count_executions(&self, filter: &ExecutionFilter) -> Result<usize> {
        Ok(self
            .state
            .read()
            .executions
            .values()
            .filter(|r| filter.matches(r))
            .count())
    }

    async fn list_stale_executions(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        let state = self.state.read();
        let mut stale: Vec<_> = state
            .executions
            .values()
            .filter(|r| !r.is_terminal() && r.updated_at < updated_before)
            .cloned()
            .collect();
        stale.sort_by_key(|r| r.updated_at);
        stale.truncate(limit);
        Ok(stale)
    }

    async fn list_expired_executions(
        &self,
        completed_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let state = self.state.read();
        let mut expired: Vec<_> = state
            .executions
            .values()
            .filter_map(|r| match r.completed_at {
                Some(done) if r.is_terminal() && done < completed_before => {
                    Some((done, r.execution_id.clone()))
                }
                _ => None,
            })
            .collect();
        expired.sort();
        Ok(expired.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn delete_executions(
        &self,
        ids: &[String],
        completed_before: DateTime<Utc>,
    ) -> Result<usize> {
        let mut state = self.state.write();
        let mut touched_runs = HashSet::new();

        let mut doomed: HashSet<&String> = ids
            .iter()
            .filter(|id| {
                state.executions.get(*id).is_some_and(|r| {
                    r.is_terminal() && r.completed_at.is_some_and(|done| done < completed_before)
                })
            })
            .collect();
        // Spare parents of surviving children until nothing changes.
        loop {
            let spared: Vec<&String> = state
                .executions
                .values()
                .filter(|child| !doomed.contains(&child.execution_id))
                .filter_map(|child| child.parent_execution_id.as_ref())
                .filter(|parent| doomed.contains(parent))
                .collect();
            if spared.is_empty() {
                break;
            }
            for parent in spared {
                doomed.remove(parent);
            }
        }
        let doomed: Vec<String> = doomed.into_iter().cloned().collect();

        for id in &doomed {
            state.executions.remove(id);
            if !has_webhook_dead_letters(&state, id) {
                state.execution_webhooks.remove(id);
            }
            if let Some(step) = state.steps.remove(id) {
                touched_runs.insert(step.run_id);
            }
        }
        let deleted = doomed.len();

        for run_id in touched_runs {
            let remaining = state.steps.values().filter(|s| s.run_id == run_id).count();
            if remaining == 0 {
                state.runs.remove(&run_id);
            } else if let Some(run) = state.runs.get_mut(&run_id) {
                run.step_count = remaining;
                run.version += 1;
            }
        }

        Ok(deleted)
    }
}

#[async_trait]
impl WorkflowStore for MemoryStorage {
    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        Ok(self.state.read().runs.get(run_id).cloned())
    }

    async fn put_run(&self, mut run: WorkflowRun, expected_version: u64) -> Result<WorkflowRun> {
        let mut state = self.state.write();
        let current = state.runs.get(&run.run_id).map(|r| r.version);
        run.version = check_version("workflow run", &run.run_id, current, Some(expected_version))?;
        state.runs.insert(run.run_id.clone(), run.clone());
        Ok(run)
    }

    async fn get_step(&self, step_id: &str) -> Result<Option<WorkflowStep>> {
        Ok(self.state.read().steps.get(step_id).cloned())
    }

    async fn list_steps(&self, run_id: &str) -> Result<Vec<WorkflowStep>> {
        let state = self.state.read();
        let mut steps: Vec<_> = state
            .steps
            .values()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect();
        steps.sort_by(|a, b| {
            a.depth
                .cmp(&b.depth)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.step_id.cmp(&b.step_id))
        });
        Ok(steps)
    }

    async fn query_runs(&self, filter: &WorkflowFilter) -> Result<Vec<WorkflowRun>> {
        let state = self.state.read();
        let mut runs: Vec<_> = state
            .runs
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        runs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(paginate(runs, filter.limit, filter.offset))
    }

    async fn count_runs(&self, filter: &WorkflowFilter) -> Result<usize> {
        Ok(self
            .state
            .read()
            .runs
            .values()
            .filter(|r| filter.matches(r))
            .count())
    }
}

#[async_trait]
impl WebhookStore for MemoryStorage {
    async fn get_observability_webhook(&self) -> Result<Option<ObservabilityWebhookConfig>> {
        Ok(self.state.read().observability_webhook.clone())
    }

    async fn put_observability_webhook(
        &self,
        mut config: ObservabilityWebhookConfig,
        expected_version: Option<u64>,
    ) -> Result<ObservabilityWebhookConfig> {
        let mut state = self.state.write();
        let current = state.observability_webhook.as_ref().map(|c| c.version);
        config.version = check_version("webhook config", &config.id, current, expected_version)?;
        state.observability_webhook = Some(config.clone());
        Ok(config)
    }

    async fn delete_observability_webhook(&self) -> Result<bool> {
        Ok(self.state.write().observability_webhook.take().is_some())
    }

    async fn get_execution_webhook(&self, execution_id: &str) -> Result<Option<ExecutionWebhook>> {
        Ok(self.state.read().execution_webhooks.get(execution_id).cloned())
    }

    async fn put_execution_webhook(
        &self,
        mut webhook: ExecutionWebhook,
        expected_version: Option<u64>,
    ) -> Result<ExecutionWebhook> {
        let mut state = self.state.write();
        let current = state
            .execution_webhooks
            .get(&webhook.execution_id)
            .map(|w| w.version);
        webhook.version = check_version(
            "execution webhook",
            &webhook.execution_id,
            current,
            expected_version,
        )?;
        state
            .execution_webhooks
            .insert(webhook.execution_id.clone(), webhook.clone());
        Ok(webhook)
    }
}

#[async_trait]
impl DeadLetterStore for MemoryStorage {
    async fn insert_dead_letter(&self, mut entry: DeadLetterEntry) -> Result<i64> {
        let mut state = self.state.write();
        state.next_dead_letter_id += 1;
        entry.id = state.next_dead_letter_id;
        state.dead_letters.insert(entry.id, entry.clone());
        Ok(entry.id)
    }

    async fn list_dead_letters(&self, limit: usize, offset: usize) -> Result<Vec<DeadLetterEntry>> {
        let state = self.state.read();
        let mut entries: Vec<_> = state.dead_letters.values().cloned().collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(entries.into_iter().skip(offset).take(limit).collect())
    }

    async fn get_dead_letter(&self, id: i64) -> Result<Option<DeadLetterEntry>> {
        Ok(self.state.read().dead_letters.get(&id).cloned())
    }

    async fn count_dead_letters(&self) -> Result<usize> {
        Ok(self.state.read().dead_letters.len())
    }

    async fn delete_dead_letter(&self, id: i64) -> Result<bool> {
        let mut state = self.state.write();
        let Some(entry) = state.dead_letters.remove(&id) else {
            return Ok(false);
        };
        if let DeadLetterDestination::ExecutionWebhook { execution_id } = &entry.destination {
            release_orphaned_webhook(&mut state, execution_id);
        }
        Ok(true)
    }

    async fn record_redrive_failure(
        &self,
        id: i64,
        error_message: &str,
    ) -> Result<Option<DeadLetterEntry>> {
        let mut state = self.state.write();
        Ok(state.dead_letters.get_mut(&id).map(|entry| {
            entry.retry_count += 1;
            entry.error_message = error_message.to_string();
            entry.clone()
        }))
    }

    async fn clear_dead_letters(&self) -> Result<usize> {
        let mut state = self.state.write();
        let count = state.dead_letters.len();
        state.dead_letters.clear();
        let orphaned: Vec<String> = state
            .execution_webhooks
            .keys()
            .filter(|id| !state.executions.contains_key(*id))
            .cloned()
            .collect();
        for id in orphaned {
            state.execution_webhooks.remove(&id);
        }
        Ok(count)
    }
}

/// Forwards every store except `ExecutionStore` to `self.inner`, for test
/// doubles that only need to intercept execution writes.
#[cfg(test)]
macro_rules! delegate_non_execution_stores {
    ($ty:ty) => {
        const _: () = {
        use $crate::storage::{DeadLetterStore, NodeStore, WebhookStore, WorkflowStore};

        #[async_trait::async_trait]
        impl $crate::storage::NodeStore for $ty {
            async fn get_node(&self, id: &str) -> agentfield_core::Result<Option<agentfield_core::types::AgentNode>> {
                self.inner.get_node(id).await
            }
            async fn list_nodes(&self) -> agentfield_core::Result<Vec<agentfield_core::types::AgentNode>> {
                self.inner.list_nodes().await
            }
            async fn put_node(
                &self,
                node: agentfield_core::types::AgentNode,
                expected: Option<u64>,
            ) -> agentfield_core::Result<agentfield_core::types::AgentNode> {
                self.inner.put_node(node, expected).await
            }
            async fn delete_node(&self, id: &str) -> agentfield_core::Result<bool> {
                self.inner.delete_node(id).await
            }
        }

        #[async_trait::async_trait]
        impl $crate::storage::WorkflowStore for $ty {
            async fn get_run(&self, id: &str) -> agentfield_core::Result<Option<agentfield_core::types::WorkflowRun>> {
                self.inner.get_run(id).await
            }
            async fn put_run(
                &self,
                run: agentfield_core::types::WorkflowRun,
                expected: u64,
            ) -> agentfield_core::Result<agentfield_core::types::WorkflowRun> {
                self.inner.put_run(run, expected).await
            }
            async fn get_step(&self, id: &str) -> agentfield_core::Result<Option<agentfield_core::types::WorkflowStep>> {
                self.inner.get_step(id).await
            }
            async fn list_steps(&self, run_id: &str) -> agentfield_core::Result<Vec<agentfield_core::types::WorkflowStep>> {
                self.inner.list_steps(run_id).await
            }
            async fn query_runs(
                &self,
                filter: &agentfield_core::types::WorkflowFilter,
            ) -> agentfield_core::Result<Vec<agentfield_core::types::WorkflowRun>> {
                self.inner.query_runs(filter).await
            }
            async fn count_runs(&self, filter: &agentfield_core::types::WorkflowFilter) -> agentfield_core::Result<usize> {
                self.inner.count_runs(filter).await
            }
        }

        #[async_trait::async_trait]
        impl $crate::storage::WebhookStore for $ty {
            async fn get_observability_webhook(
                &self,
            ) -> agentfield_core::Result<Option<agentfield_core::types::ObservabilityWebhookConfig>> {
                self.inner.get_observability_webhook().await
            }
            async fn put_observability_webhook(
                &self,
                config: agentfield_core::types::ObservabilityWebhookConfig,
                expected: Option<u64>,
            ) -> agentfield_core::Result<agentfield_core::types::ObservabilityWebhookConfig> {
                self.inner.put_observability_webhook(config, expected).await
            }
            async fn delete_observability_webhook(&self) -> agentfield_core::Result<bool> {
                self.inner.delete_observability_webhook().await
            }
            async fn get_execution_webhook(
                &self,
                id: &str,
            ) -> agentfield_core::Result<Option<agentfield_core::types::ExecutionWebhook>> {
                self.inner.get_execution_webhook(id).await
            }
            async fn put_execution_webhook(
                &self,
                webhook: agentfield_core::types::ExecutionWebhook,
                expected: Option<u64>,
            ) -> agentfield_core::Result<agentfield_core::types::ExecutionWebhook> {
                self.inner.put_execution_webhook(webhook, expected).await
            }
        }

        #[async_trait::async_trait]
        impl $crate::storage::DeadLetterStore for $ty {
            async fn insert_dead_letter(&self, entry: agentfield_core::types::DeadLetterEntry) -> agentfield_core::Result<i64> {
                self.inner.insert_dead_letter(entry).await
            }
            async fn list_dead_letters(
                &self,
                limit: usize,
                offset: usize,
            ) -> agentfield_core::Result<Vec<agentfield_core::types::DeadLetterEntry>> {
                self.inner.list_dead_letters(limit, offset).await
            }
            async fn get_dead_letter(&self, id: i64) -> agentfield_core::Result<Option<agentfield_core::types::DeadLetterEntry>> {
                self.inner.get_dead_letter(id).await
            }
            async fn count_dead_letters(&self) -> agentfield_core::Result<usize> {
                self.inner.count_dead_letters().await
            }
            async fn delete_dead_letter(&self, id: i64) -> agentfield_core::Result<bool> {
                self.inner.delete_dead_letter(id).await
            }
            async fn record_redrive_failure(
                &self,
                id: i64,
                error_message: &str,
            ) -> agentfield_core::Result<Option<agentfield_core::types::DeadLetterEntry>> {
                self.inner.record_redrive_failure(id, error_message).await
            }
            async fn clear_dead_letters(&self) -> agentfield_core::Result<usize> {
                self.inner.clear_dead_letters().await
            }
        }
        };
    };
}

#[cfg(test)]
pub(crate) use delegate_non_execution_stores;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn record(id: &str, now: DateTime<Utc>) -> ExecutionRecord {
        ExecutionRecord::new(id, "node-1", "plan", json!({}), now)
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_rejected() {
        let store = MemoryStorage::new();
        let now = Utc::now();
        store.insert_execution(record("e1", now), WorkflowWrite::None).await.unwrap();
        let err = store
            .insert_execution(record("e1", now), WorkflowWrite::None)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlPlaneError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_stale_version_is_a_conflict() {
        let store = MemoryStorage::new();
        let stored = store
            .insert_execution(record("e1", Utc::now()), WorkflowWrite::None)
            .await
            .unwrap();
        assert_eq!(stored.version, 1);

        let updated = store.update_execution(stored.clone(), 1).await.unwrap();
        assert_eq!(updated.version, 2);

        let err = store.update_execution(stored, 1).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_append_step_requires_existing_parent() {
        let store = MemoryStorage::new();
        let now = Utc::now();
        let root = record("root", now);
        let run = WorkflowRun::new("run-1", "root", now);
        let root_step = WorkflowStep::for_execution(&root, "run-1", None, 0);
        store
            .insert_execution(root, WorkflowWrite::StartRun { run, root: root_step })
            .await
            .unwrap();

        let orphan = record("orphan", now);
        let step = WorkflowStep::for_execution(&orphan, "run-1", Some("missing".into()), 1);
        let err = store
            .insert_execution(orphan, WorkflowWrite::AppendStep { step })
            .await
            .unwrap_err();
        assert!(matches!(err, ControlPlaneError::Validation(_)));
        // Neither half of the failed write is visible.
        assert!(store.get_execution("orphan").await.unwrap().is_none());
        assert!(store.get_step("orphan").await.unwrap().is_none());

        let child = record("child", now);
        let step = WorkflowStep::for_execution(&child, "run-1", Some("root".into()), 1);
        store
            .insert_execution(child, WorkflowWrite::AppendStep { step })
            .await
            .unwrap();
        assert_eq!(store.get_run("run-1").await.unwrap().unwrap().step_count, 2);
    }

    #[tokio::test]
    async fn test_delete_is_conditional_and_cascades() {
        let store = MemoryStorage::new();
        let old = Utc::now() - Duration::days(3);

        let mut done = record("done", old);
        done.mark_succeeded(json!(1), old).unwrap();
        let run = WorkflowRun::new("run-1", "done", old);
        let step = WorkflowStep::for_execution(&done, "run-1", None, 0);
        store
            .insert_execution(done, WorkflowWrite::StartRun { run, root: step })
            .await
            .unwrap();
        store.insert_execution(record("live", old), WorkflowWrite::None).await.unwrap();

        let cutoff = Utc::now() - Duration::days(1);
        let deleted = store
            .delete_executions(&["done".into(), "live".into()], cutoff)
            .await
            .unwrap();

        assert_eq!(deleted, 1);
        assert!(store.get_execution("live").await.unwrap().is_some());
        assert!(store.get_run("run-1").await.unwrap().is_none());
        assert!(store.get_step("done").await.unwrap().is_none());
    }

    fn finished(id: &str, parent: Option<&str>, at: DateTime<Utc>) -> ExecutionRecord {
        let mut r = record(id, at);
        r.parent_execution_id = parent.map(String::from);
        r.mark_succeeded(json!(1), at).unwrap();
        r
    }

    #[tokio::test]
    async fn test_delete_spares_ancestors_of_surviving_children() {
        let store = MemoryStorage::new();
        let old = Utc::now() - Duration::days(3);
        let cutoff = Utc::now() - Duration::days(1);

        store.insert_execution(finished("grandparent", None, old), WorkflowWrite::None).await.unwrap();
        store
            .insert_execution(finished("parent", Some("grandparent"), old), WorkflowWrite::None)
            .await
            .unwrap();
        let mut child = record("child", old);
        child.parent_execution_id = Some("parent".into());
        store.insert_execution(child, WorkflowWrite::None).await.unwrap();

        let all: Vec<String> = vec!["grandparent".into(), "parent".into(), "child".into()];
        assert_eq!(store.delete_executions(&all, cutoff).await.unwrap(), 0);
        assert!(store.get_execution("grandparent").await.unwrap().is_some());
        assert!(store.get_execution("parent").await.unwrap().is_some());

        // Once the child is done too the whole chain goes in one call.
        let stored = store.get_execution("child").await.unwrap().unwrap();
        let mut done = stored.clone();
        done.mark_succeeded(json!(2), old).unwrap();
        store.update_execution(done, stored.version).await.unwrap();
        assert_eq!(store.delete_executions(&all, cutoff).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_webhook_row_outlives_execution_while_dead_lettered() {
        let store = MemoryStorage::new();
        let old = Utc::now() - Duration::days(3);
        store.insert_execution(finished("e1", None, old), WorkflowWrite::None).await.unwrap();
        store.insert_execution(finished("e2", None, old), WorkflowWrite::None).await.unwrap();
        for id in ["e1", "e2"] {
            let hook = ExecutionWebhook::register(
                id,
                ExecutionWebhookRequest {
                    url: "http://hooks.test/done".into(),
                    secret: None,
                    headers: Default::default(),
                },
                old,
            )
            .unwrap();
            store.put_execution_webhook(hook, None).await.unwrap();
        }
        let dead_letter = store
            .insert_dead_letter(DeadLetterEntry::new(
                DeadLetterDestination::ExecutionWebhook {
                    execution_id: "e1".into(),
                },
                "execution.succeeded",
                "execution",
                old,
                json!({}),
                "503",
                3,
            ))
            .await
            .unwrap();

        let deleted = store
            .delete_executions(&["e1".into(), "e2".into()], Utc::now() - Duration::days(1))
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert!(store.get_execution_webhook("e1").await.unwrap().is_some());
        assert!(store.get_execution_webhook("e2").await.unwrap().is_none());

        // The row goes with its last dead letter.
        assert!(store.delete_dead_letter(dead_letter).await.unwrap());
        assert!(store.get_execution_webhook("e1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dead_letters_list_oldest_first() {
        let store = MemoryStorage::new();
        for i in 0..3 {
            let mut entry = DeadLetterEntry::new(
                DeadLetterDestination::Observability,
                "execution.completed",
                "execution",
                Utc::now(),
                json!({ "n": i }),
                "503",
                3,
            );
            entry.created_at = Utc::now() - Duration::minutes(10 - i);
            store.insert_dead_letter(entry).await.unwrap();
        }

        let listed = store.list_dead_letters(10, 0).await.unwrap();
        let order: Vec<_> = listed.iter().map(|e| e.payload["n"].as_i64().unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2]);

        let page = store.list_dead_letters(1, 1).await.unwrap();
        assert_eq!(page[0].payload["n"], 1);
    }
}
