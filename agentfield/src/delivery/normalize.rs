//! Conversion of bus events into observability envelopes.

use agentfield_core::types::*;
use serde_json::json;

pub const SOURCE_EXECUTION: &str = "execution";
pub const SOURCE_WORKFLOW: &str = "workflow";
pub const SOURCE_NODE: &str = "node";
pub const SOURCE_REASONER: &str = "reasoner";

pub fn execution_event(event: &ExecutionEvent) -> ObservabilityEvent {
    let r = &event.record;
    ObservabilityEvent {
        event_type: event.event_type().to_string(),
        event_source: SOURCE_EXECUTION.to_string(),
        timestamp: event.timestamp,
        data: json!({
            "execution_id": r.execution_id,
            "run_id": r.run_id,
            "parent_execution_id": r.parent_execution_id,
            "agent_node_id": r.agent_node_id,
            "reasoner_id": r.reasoner_id,
            "status": r.status,
            "previous_status": event.previous_status,
            "workflow_depth": r.workflow_depth,
            "input_hash": r.input_hash,
            "output_hash": r.output_hash,
            "error_message": r.error_message,
            "started_at": r.started_at,
            "completed_at": r.completed_at,
            "duration_ms": r.duration_ms(),
        }),
    }
}

pub fn reasoner_event(event: &ReasonerEvent) -> ObservabilityEvent {
    ObservabilityEvent {
        event_type: event.event_type().to_string(),
        event_source: SOURCE_REASONER.to_string(),
        timestamp: event.timestamp,
        data: json!({
            "reasoner_id": event.reasoner_id,
            "node_id": event.node_id,
            "status": event.status,
            "payload": {
                "execution_id": event.execution_id,
                "duration_ms": event.duration_ms,
                "error_message": event.error_message,
            },
        }),
    }
}

pub fn workflow_run_event(event: &WorkflowRunEvent) -> ObservabilityEvent {
    ObservabilityEvent {
        event_type: event.event_type().to_string(),
        event_source: SOURCE_WORKFLOW.to_string(),
        timestamp: event.timestamp,
        data: serde_json::to_value(&event.run).unwrap_or_default(),
    }
}

/// `None` for heartbeats, which are too chatty to forward.
pub fn node_event(event: &NodeEvent) -> Option<ObservabilityEvent> {
    if event.kind == NodeEventKind::Heartbeat {
        return None;
    }
    Some(ObservabilityEvent {
        event_type: event.event_type().to_string(),
        event_source: SOURCE_NODE.to_string(),
        timestamp: event.timestamp,
        data: json!({
            "node_id": event.node_id,
            "phase": event.phase,
            "health_score": event.health_score,
        }),
    })
}
