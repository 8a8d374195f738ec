//! Event distribution for execution, reasoner, workflow and node state changes.

pub mod bus;

pub use bus::{EventBus, QueuePolicy, Subscription};

use agentfield_core::types::{
    ExecutionEvent, NodeEvent, ReasonerEvent, WorkflowExecutionEvent, WorkflowRunEvent,
};

pub type ExecutionBus = EventBus<ExecutionEvent>;
pub type ReasonerBus = EventBus<ReasonerEvent>;
pub type WorkflowExecutionBus = EventBus<WorkflowExecutionEvent>;
pub type WorkflowRunBus = EventBus<WorkflowRunEvent>;
pub type NodeBus = EventBus<NodeEvent>;

/// The independent bus instances shared by every service.
#[derive(Clone)]
pub struct EventBuses {
    pub executions: ExecutionBus,
    pub reasoners: ReasonerBus,
    pub workflow_executions: WorkflowExecutionBus,
    pub workflow_runs: WorkflowRunBus,
    pub nodes: NodeBus,
}

impl EventBuses {
    pub fn new(subscriber_capacity: usize) -> Self {
        Self {
            executions: EventBus::new("executions", subscriber_capacity),
            reasoners: EventBus::new("reasoners", subscriber_capacity),
            workflow_executions: EventBus::new("workflow_executions", subscriber_capacity),
            workflow_runs: EventBus::new("workflow_runs", subscriber_capacity),
            nodes: EventBus::new("nodes", subscriber_capacity),
        }
    }
}
