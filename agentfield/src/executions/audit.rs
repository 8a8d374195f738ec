//! Audit hooks for finished executions.
//!
//! Hooks receive content digests of each terminal execution's input and
//! output. Identity or credential work belongs to whatever sits behind a hook.

use agentfield_core::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::events::ExecutionBus;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionAudit {
    pub execution_id: String,
    pub run_id: Option<String>,
    pub agent_node_id: String,
    pub reasoner_id: String,
    pub status: ExecutionStatus,
    /// BLAKE3 of the serialized input.
    pub input_hash: String,
    /// BLAKE3 of the serialized output, when there is one.
    pub output_hash: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&ExecutionRecord> for ExecutionAudit {
    fn from(record: &ExecutionRecord) -> Self {
        Self {
            execution_id: record.execution_id.clone(),
            run_id: record.run_id.clone(),
            agent_node_id: record.agent_node_id.clone(),
            reasoner_id: record.reasoner_id.clone(),
            status: record.status,
            input_hash: record.input_hash.clone(),
            output_hash: record.output_hash.clone(),
            completed_at: record.completed_at,
        }
    }
}

#[async_trait]
pub trait ExecutionAuditHook: Send + Sync {
    async fn record(&self, audit: &ExecutionAudit);
}

/// Writes audit entries to the log.
pub struct LogAuditHook;

#[async_trait]
impl ExecutionAuditHook for LogAuditHook {
    async fn record(&self, audit: &ExecutionAudit) {
        info!(
            target: "agentfield::audit",
            execution_id = %audit.execution_id,
            run_id = ?audit.run_id,
            status = %audit.status,
            input_hash = %audit.input_hash,
            output_hash = ?audit.output_hash,
            "Execution finished"
        );
    }
}

/// Feeds terminal executions from the bus to the registered hooks.
pub struct AuditTrail {
    hooks: Vec<Arc<dyn ExecutionAuditHook>>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl AuditTrail {
    pub fn new(hooks: Vec<Arc<dyn ExecutionAuditHook>>) -> Self {
        Self {
            hooks,
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn start(&self, bus: &ExecutionBus) {
        if self.hooks.is_empty() {
            return;
        }
        let mut subscription = bus.subscribe_lossless();
        let hooks = self.hooks.clone();
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = subscription.recv() => match next {
                        Some(event) => event,
                        None => break,
                    },
                };
                if !event.record.status.is_terminal() {
                    continue;
                }
                let audit = ExecutionAudit::from(&event.record);
                for hook in &hooks {
                    hook.record(&audit).await;
                }
            }
        });
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct Collect(Mutex<Vec<ExecutionAudit>>);

    #[async_trait]
    impl ExecutionAuditHook for Collect {
        async fn record(&self, audit: &ExecutionAudit) {
            self.0.lock().push(audit.clone());
        }
    }

    #[tokio::test]
    async fn test_only_terminal_executions_are_audited() {
        let bus: ExecutionBus = EventBus::new("executions", 10);
        let hook = Arc::new(Collect::default());
        let trail = AuditTrail::new(vec![hook.clone()]);
        trail.start(&bus);

        let mut record = ExecutionRecord::new("e1", "n1", "plan", json!({"q": 1}), Utc::now());
        bus.publish(ExecutionEvent {
            record: record.clone(),
            previous_status: None,
            timestamp: Utc::now(),
        });
        record.mark_running(Utc::now()).unwrap();
        record.mark_succeeded(json!({"a": 2}), Utc::now()).unwrap();
        bus.publish(ExecutionEvent {
            record: record.clone(),
            previous_status: Some(ExecutionStatus::Running),
            timestamp: Utc::now(),
        });

        for _ in 0..50 {
            if !hook.0.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        trail.shutdown().await;

        let audits = hook.0.lock();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].input_hash, payload_digest(&json!({"q": 1})));
        assert_eq!(audits[0].output_hash, Some(payload_digest(&json!({"a": 2}))));
    }
}
