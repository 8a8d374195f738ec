//! API routes

use agentfield_core::types::*;
use agentfield_core::ControlPlaneError;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, patch, post},
};
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use super::error::ApiError;
use crate::app::ControlPlane;
use crate::executions::ExecutionPage;
use crate::workflow::{WorkflowRunDetail, WorkflowRunPage};

/// Application state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub plane: Arc<ControlPlane>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(plane: Arc<ControlPlane>) -> Self {
        Self {
            plane,
            started_at: Instant::now(),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub online_nodes: usize,
    pub observability_enabled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookConfigResponse {
    pub configured: bool,
    #[serde(default)]
    pub config: Option<WebhookConfigView>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookUpdateResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<WebhookConfigView>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearDeadLetterResponse {
    pub success: bool,
    pub message: String,
    pub deleted: usize,
}

/// An execution together with its callback registration, if any.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExecutionDetail {
    #[serde(flatten)]
    pub execution: ExecutionRecord,
    #[serde(default)]
    pub webhook: Option<ExecutionWebhook>,
}

/// Create all API routes
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))

        // Node leases
        .route("/nodes", get(list_nodes).post(register_node))
        .route("/nodes/register", post(register_node))
        .route("/nodes/{id}", get(get_node))
        .route("/nodes/{id}/status", patch(renew_lease))
        .route("/nodes/{id}/heartbeat", post(legacy_heartbeat))
        .route("/nodes/{id}/actions/ack", post(ack_action))
        .route("/nodes/{id}/shutdown", post(shutdown_node))

        // Executions
        .route("/execute/{target}", post(execute_sync))
        .route("/execute/async/{target}", post(execute_async))
        .route("/executions", get(list_executions))
        .route("/executions/events", get(execution_events))
        .route("/reasoners/events", get(reasoner_events))
        .route("/executions/{id}", get(get_execution))
        .route("/executions/{id}/cancel", post(cancel_execution))
        .route("/executions/{id}/status", post(report_execution_status))
        .route("/executions/{id}/webhook/retry", post(retry_execution_webhook))

        // Workflow runs
        .route("/workflows/runs", get(list_runs))
        .route("/workflows/runs/{run_id}", get(get_run))
        .route("/workflows/events", get(workflow_events))

        // Observability webhook and dead letters
        .route(
            "/observability/webhook",
            get(get_webhook_config)
                .post(set_webhook_config)
                .delete(delete_webhook_config),
        )
        .route("/observability/status", get(forwarder_status))
        .route(
            "/observability/dead-letter",
            get(list_dead_letters).delete(clear_dead_letters),
        )
        .route("/observability/dead-letter/redrive", post(redrive_dead_letters))

        .with_state(state)
}

/// Parse an optional JSON body; an empty body means the default.
fn optional_json<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ControlPlaneError::validation(format!("invalid request body: {}", e)).into())
}

/// Health check endpoint
async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let now = Utc::now();
    let nodes = state.plane.nodes.list_nodes().await?;
    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        version: crate::VERSION.to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        online_nodes: nodes.iter().filter(|n| n.is_online(now)).count(),
        observability_enabled: state.plane.forwarder.is_enabled(),
    }))
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

async fn register_node(
    State(state): State<AppState>,
    Json(req): Json<RegisterNodeRequest>,
) -> Result<(StatusCode, Json<LeaseResponse>), ApiError> {
    let lease = state.plane.nodes.register(req).await?;
    Ok((StatusCode::CREATED, Json(lease)))
}

async fn list_nodes(State(state): State<AppState>) -> Result<Json<Vec<AgentNode>>, ApiError> {
    Ok(Json(state.plane.nodes.list_nodes().await?))
}

async fn get_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AgentNode>, ApiError> {
    Ok(Json(state.plane.nodes.get_node(&id).await?))
}

async fn renew_lease(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<NodeStatusUpdate>,
) -> Result<Json<LeaseResponse>, ApiError> {
    Ok(Json(state.plane.nodes.renew(&id, update).await?))
}

/// Older SDKs post an empty body here.
async fn legacy_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<LeaseResponse>, ApiError> {
    let update: NodeStatusUpdate = optional_json(&body)?;
    Ok(Json(state.plane.nodes.renew(&id, update).await?))
}

async fn ack_action(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ActionAckRequest>,
) -> Result<Json<LeaseResponse>, ApiError> {
    Ok(Json(state.plane.nodes.ack_action(&id, &req.action_id).await?))
}

async fn shutdown_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<NodeShutdownResponse>, ApiError> {
    let req: NodeShutdownRequest = optional_json(&body)?;
    Ok(Json(state.plane.nodes.shutdown(&id, req.reason).await?))
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

async fn execute_sync(
    State(state): State<AppState>,
    Path(target): Path<String>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let record = state.plane.executions.execute_sync(&target, req).await?;
    Ok(Json(ExecuteResponse::from(&record)))
}

async fn execute_async(
    State(state): State<AppState>,
    Path(target): Path<String>,
    Json(req): Json<ExecuteRequest>,
) -> Result<(StatusCode, Json<AsyncExecuteResponse>), ApiError> {
    let accepted = state.plane.executions.execute_async(&target, req).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn list_executions(
    State(state): State<AppState>,
    Query(filter): Query<ExecutionFilter>,
) -> Result<Json<ExecutionPage>, ApiError> {
    Ok(Json(state.plane.records.query(&filter).await?))
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionDetail>, ApiError> {
    let execution = state.plane.records.get(&id).await?;
    let webhook = state.plane.webhooks.get(&id).await?;
    Ok(Json(ExecutionDetail { execution, webhook }))
}

async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let record = state.plane.executions.cancel(&id).await?;
    Ok(Json(ExecuteResponse::from(&record)))
}

async fn report_execution_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(report): Json<ExecutionStatusReport>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let record = state.plane.executions.report_status(&id, report).await?;
    Ok(Json(ExecuteResponse::from(&record)))
}

async fn retry_execution_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<ExecutionWebhook>), ApiError> {
    let hook = state.plane.webhooks.retry(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(hook)))
}

/// Live execution state changes. Slow clients lose the oldest events.
async fn execution_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("New SSE connection established (executions)");

    let stream = state
        .plane
        .buses
        .executions
        .subscribe()
        .into_stream()
        .filter_map(|event| async move {
            let sse = Event::default()
                .event(event.event_type())
                .json_data(&event)
                .ok()?;
            Some(Ok(sse))
        });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn reasoner_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("New SSE connection established (reasoners)");

    let stream = state
        .plane
        .buses
        .reasoners
        .subscribe()
        .into_stream()
        .filter_map(|event| async move {
            let sse = Event::default()
                .event(event.event_type())
                .json_data(&event)
                .ok()?;
            Some(Ok(sse))
        });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

async fn list_runs(
    State(state): State<AppState>,
    Query(filter): Query<WorkflowFilter>,
) -> Result<Json<WorkflowRunPage>, ApiError> {
    Ok(Json(state.plane.workflows.query(&filter).await?))
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<WorkflowRunDetail>, ApiError> {
    Ok(Json(state.plane.workflows.get_run(&run_id).await?))
}

/// Step and run events interleaved on one stream.
async fn workflow_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("New SSE connection established (workflows)");

    let steps = state
        .plane
        .buses
        .workflow_executions
        .subscribe()
        .into_stream()
        .filter_map(|event| async move {
            let sse = Event::default()
                .event(format!("workflow_execution.{}", event.status))
                .json_data(&event)
                .ok()?;
            Some(Ok(sse))
        });
    let runs = state
        .plane
        .buses
        .workflow_runs
        .subscribe()
        .into_stream()
        .filter_map(|event| async move {
            let sse = Event::default()
                .event(event.event_type())
                .json_data(&event)
                .ok()?;
            Some(Ok(sse))
        });

    Sse::new(futures::stream::select(steps, runs)).keep_alive(KeepAlive::default())
}

// ---------------------------------------------------------------------------
// Observability
// ---------------------------------------------------------------------------

async fn get_webhook_config(
    State(state): State<AppState>,
) -> Result<Json<WebhookConfigResponse>, ApiError> {
    let config = state.plane.forwarder.config_view().await?;
    Ok(Json(WebhookConfigResponse {
        configured: config.is_some(),
        config,
    }))
}

async fn set_webhook_config(
    State(state): State<AppState>,
    Json(req): Json<WebhookConfigRequest>,
) -> Result<Json<WebhookUpdateResponse>, ApiError> {
    let stored = state.plane.forwarder.configure(req).await?;
    Ok(Json(WebhookUpdateResponse {
        success: true,
        message: "observability webhook configured".to_string(),
        config: Some(stored.view()),
    }))
}

async fn delete_webhook_config(
    State(state): State<AppState>,
) -> Result<Json<WebhookUpdateResponse>, ApiError> {
    let removed = state.plane.forwarder.remove().await?;
    let message = if removed {
        "observability webhook configuration removed"
    } else {
        "no observability webhook was configured"
    };
    Ok(Json(WebhookUpdateResponse {
        success: true,
        message: message.to_string(),
        config: None,
    }))
}

async fn forwarder_status(State(state): State<AppState>) -> Json<ForwarderStatus> {
    Json(state.plane.forwarder.status().await)
}

async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<DeadLetterListResponse>, ApiError> {
    Ok(Json(state.plane.dead_letters.list(&query).await?))
}

async fn clear_dead_letters(
    State(state): State<AppState>,
) -> Result<Json<ClearDeadLetterResponse>, ApiError> {
    let deleted = state.plane.dead_letters.clear().await?;
    Ok(Json(ClearDeadLetterResponse {
        success: true,
        message: "dead letter queue cleared".to_string(),
        deleted,
    }))
}

/// Partial failures still answer 200; the body carries the counts.
async fn redrive_dead_letters(
    State(state): State<AppState>,
    Json(req): Json<RedriveRequest>,
) -> Result<Json<RedriveResponse>, ApiError> {
    let target = RedriveTarget::try_from(req)?;
    Ok(Json(state.plane.dead_letters.redrive(target).await?))
}
