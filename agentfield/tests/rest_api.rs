//! REST API tests
//!
//! Drives the full router with `oneshot` against an in-memory control plane.
//! Agent nodes and webhook destinations are wiremock servers.

use agentfield::api::{ErrorResponse, build_router};
use agentfield::delivery::{SIGNATURE_HEADER, verify};
use agentfield::{ControlPlane, ControlPlaneConfig};
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt; // For oneshot
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ============================================================================
// Helper Functions
// ============================================================================

fn test_config() -> ControlPlaneConfig {
    let mut config = ControlPlaneConfig::default();
    config.execution_queue.agent_call_timeout_secs = 5;
    config.execution_queue.webhook_timeout_secs = 2;
    config.execution_queue.webhook_max_attempts = 2;
    config.execution_queue.webhook_retry_backoff_ms = 10;
    config.execution_queue.webhook_max_retry_backoff_ms = 20;
    config.execution_cleanup.enabled = false;
    config.observability.batch_timeout_ms = 20;
    config.observability.http_timeout_secs = 2;
    config.observability.max_attempts = 1;
    config.observability.retry_backoff_ms = 10;
    config.observability.max_retry_backoff_ms = 20;
    config
}

/// Started control plane and its router
async fn create_test_app() -> (Arc<ControlPlane>, axum::Router) {
    let plane = Arc::new(ControlPlane::in_memory(test_config()).unwrap());
    plane.start().await.unwrap();
    let app = build_router(Arc::clone(&plane));
    (plane, app)
}

/// Helper to send a request and get response
async fn send_request(
    app: axum::Router,
    method: &str,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, String) {
    let request_builder = Request::builder().method(method).uri(path);

    let request = if let Some(body_json) = body {
        request_builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body_json).unwrap()))
            .unwrap()
    } else {
        request_builder.body(Body::empty()).unwrap()
    };

    let response = app.oneshot(request).await.expect("Failed to send request");

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read response body");
    let body_str = String::from_utf8(body.to_vec()).expect("Invalid UTF-8");

    (status, body_str)
}

async fn send_json(app: &axum::Router, method: &str, path: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, body) = send_request(app.clone(), method, path, body).await;
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&body).unwrap_or(Value::String(body))
    };
    (status, value)
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..150 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn register_node(app: &axum::Router, id: &str, base_url: &str) {
    let (status, _) = send_json(
        app,
        "POST",
        "/api/v1/nodes",
        Some(json!({
            "id": id,
            "base_url": base_url,
            "reasoners": ["plan"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

async fn agent_replying(template: ResponseTemplate) -> MockServer {
    let agent = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/reasoners/plan"))
        .respond_with(template)
        .mount(&agent)
        .await;
    agent
}

// ============================================================================
// Health and Routing
// ============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let (_plane, app) = create_test_app().await;
    let (status, body) = send_json(&app, "GET", "/api/v1/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["version"], agentfield::VERSION);
    assert_eq!(body["online_nodes"], 0);
    assert_eq!(body["observability_enabled"], false);
}

#[tokio::test]
async fn test_unknown_path_is_404() {
    let (_plane, app) = create_test_app().await;
    let (status, _) = send_request(app, "GET", "/api/v2/nothing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// Node Lease Endpoints
// ============================================================================

#[tokio::test]
async fn test_register_renew_and_inspect_node() {
    let (_plane, app) = create_test_app().await;
    register_node(&app, "node-1", "http://agent.test").await;

    let (status, lease) = send_json(
        &app,
        "PATCH",
        "/api/v1/nodes/node-1/status",
        Some(json!({"phase": "ready", "health_score": 90.0})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(lease["lease_seconds"], 30);

    let (status, node) = send_json(&app, "GET", "/api/v1/nodes/node-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(node["phase"], "ready");
    assert_eq!(node["health_score"], 90.0);

    let (status, nodes) = send_json(&app, "GET", "/api/v1/nodes", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(nodes.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_legacy_paths_are_served() {
    let (_plane, app) = create_test_app().await;
    let (status, _) = send_json(
        &app,
        "POST",
        "/api/v1/nodes/register",
        Some(json!({"id": "old-node", "base_url": "http://agent.test"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    // Legacy SDKs send no body at all.
    let (status, lease) = send_request(app.clone(), "POST", "/api/v1/nodes/old-node/heartbeat", None).await;
    assert_eq!(status, StatusCode::OK);
    let lease: Value = serde_json::from_str(&lease).unwrap();
    assert!(lease["next_lease_renewal"].is_string());
}

#[tokio::test]
async fn test_unknown_node_returns_error_body() {
    let (_plane, app) = create_test_app().await;
    let (status, body) = send_request(
        app,
        "PATCH",
        "/api/v1/nodes/ghost/status",
        Some(json!({"phase": "ready"})),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    let error: ErrorResponse = serde_json::from_str(&body).unwrap();
    assert_eq!(error.error, "NotFoundError");
    assert!(error.message.contains("ghost"));
}

#[tokio::test]
async fn test_invalid_base_url_is_rejected() {
    let (_plane, app) = create_test_app().await;
    let (status, body) = send_json(
        &app,
        "POST",
        "/api/v1/nodes",
        Some(json!({"id": "n", "base_url": "ftp://agent.test"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "ValidationError");
}

#[tokio::test]
async fn test_shutdown_queues_action_until_acknowledged() {
    let node_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/shutdown"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&node_server)
        .await;

    let (_plane, app) = create_test_app().await;
    register_node(&app, "node-1", &node_server.uri()).await;

    let (status, body) = send_json(
        &app,
        "POST",
        "/api/v1/nodes/node-1/shutdown",
        Some(json!({"reason": "maintenance"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["acknowledged"], true);
    let actions = body["pending_actions"].as_array().unwrap();
    assert_eq!(actions.len(), 1);
    let action_id = actions[0]["action_id"].as_str().unwrap().to_string();

    let (status, lease) = send_json(
        &app,
        "POST",
        "/api/v1/nodes/node-1/actions/ack",
        Some(json!({"action_id": action_id})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(lease["pending_actions"].as_array().unwrap().is_empty());
}

// ============================================================================
// Execution Endpoints
// ============================================================================

#[tokio::test]
async fn test_sync_execution_records_run_and_step() {
    let agent = agent_replying(ResponseTemplate::new(200).set_body_json(json!({"answer": 42}))).await;
    let (_plane, app) = create_test_app().await;
    register_node(&app, "node-1", &agent.uri()).await;

    let (status, body) = send_json(
        &app,
        "POST",
        "/api/v1/execute/node-1.plan",
        Some(json!({"input": {"question": "life"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "succeeded");
    assert_eq!(body["result"]["answer"], 42);
    let execution_id = body["execution_id"].as_str().unwrap().to_string();
    let run_id = body["run_id"].as_str().unwrap().to_string();

    let requests = agent.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].headers.get("X-Execution-ID").unwrap().to_str().unwrap(),
        execution_id
    );

    let (status, detail) = send_json(&app, "GET", &format!("/api/v1/executions/{}", execution_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["input"]["question"], "life");
    assert!(detail["webhook"].is_null());

    let (status, page) = send_json(&app, "GET", &format!("/api/v1/executions?run_id={}", run_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total_count"], 1);

    let (status, run) = send_json(&app, "GET", &format!("/api/v1/workflows/runs/{}", run_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["run"]["status"], "succeeded");
    assert_eq!(run["steps"].as_array().unwrap().len(), 1);
    assert_eq!(run["steps"][0]["execution_id"], execution_id.as_str());

    let (status, runs) = send_json(&app, "GET", "/api/v1/workflows/runs?status=succeeded", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(runs["total_count"], 1);
}

#[tokio::test]
async fn test_child_execution_joins_parent_run() {
    let agent = agent_replying(ResponseTemplate::new(200).set_body_json(json!("ok"))).await;
    let (_plane, app) = create_test_app().await;
    register_node(&app, "node-1", &agent.uri()).await;

    let (_, root) = send_json(&app, "POST", "/api/v1/execute/node-1.plan", Some(json!({"input": 1}))).await;
    let root_id = root["execution_id"].as_str().unwrap();
    let (status, child) = send_json(
        &app,
        "POST",
        "/api/v1/execute/node-1.plan",
        Some(json!({"input": 2, "parent_execution_id": root_id})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(child["run_id"], root["run_id"]);

    let (_, run) = send_json(
        &app,
        "GET",
        &format!("/api/v1/workflows/runs/{}", root["run_id"].as_str().unwrap()),
        None,
    )
    .await;
    let steps = run["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 2);
    let child_step = steps.iter().find(|s| s["depth"] == 1).unwrap();
    assert_eq!(child_step["parent_step_id"], root_id);
}

#[tokio::test]
async fn test_agent_error_fails_execution() {
    let agent = agent_replying(ResponseTemplate::new(500).set_body_string("model exploded")).await;
    let (_plane, app) = create_test_app().await;
    register_node(&app, "node-1", &agent.uri()).await;

    let (status, body) = send_json(&app, "POST", "/api/v1/execute/node-1.plan", Some(json!({"input": {}}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "failed");
    assert!(body["error_message"].as_str().unwrap().contains("agent error (500)"));
}

#[tokio::test]
async fn test_bad_targets() {
    let (_plane, app) = create_test_app().await;
    register_node(&app, "node-1", "http://agent.test").await;

    let (status, _) = send_json(&app, "POST", "/api/v1/execute/no-dot", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send_json(&app, "POST", "/api/v1/execute/node-1.unknown", Some(json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NotFoundError");

    let (status, _) = send_json(&app, "POST", "/api/v1/execute/ghost.plan", Some(json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_async_execution_delivers_signed_webhook() {
    let agent = agent_replying(ResponseTemplate::new(200).set_body_json(json!({"done": true}))).await;
    let hook = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header_exists(SIGNATURE_HEADER))
        .respond_with(ResponseTemplate::new(200))
        .mount(&hook)
        .await;

    let (_plane, app) = create_test_app().await;
    register_node(&app, "node-1", &agent.uri()).await;

    let (status, accepted) = send_json(
        &app,
        "POST",
        "/api/v1/execute/async/node-1.plan",
        Some(json!({
            "input": {"x": 1},
            "webhook": {"url": format!("{}/hook", hook.uri()), "secret": "s3cret"}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(accepted["webhook_registered"], true);
    let execution_id = accepted["execution_id"].as_str().unwrap().to_string();

    let hook_server = &hook;
    eventually("webhook delivery", move || async move {
        !hook_server.received_requests().await.unwrap().is_empty()
    })
    .await;

    let requests = hook.received_requests().await.unwrap();
    let delivered = &requests[0];
    let signature = delivered.headers.get(SIGNATURE_HEADER).unwrap().to_str().unwrap();
    assert!(verify("s3cret", &delivered.body, signature));
    let payload: Value = serde_json::from_slice(&delivered.body).unwrap();
    assert_eq!(payload["event"], "execution.succeeded");
    assert_eq!(payload["execution_id"], execution_id.as_str());
    assert_eq!(payload["result"]["done"], true);

    let detail_path = format!("/api/v1/executions/{}", execution_id);
    eventually("webhook marked delivered", || {
        let app = app.clone();
        let detail_path = detail_path.clone();
        async move {
            let (_, detail) = send_json(&app, "GET", &detail_path, None).await;
            detail["webhook"]["status"] == "delivered"
        }
    })
    .await;

    // The secret never leaves the control plane.
    let (_, detail) = send_json(&app, "GET", &detail_path, None).await;
    assert!(detail["webhook"].get("secret").is_none());
}

#[tokio::test]
async fn test_invalid_webhook_still_accepts_execution() {
    let agent = agent_replying(ResponseTemplate::new(200).set_body_json(json!(1))).await;
    let (_plane, app) = create_test_app().await;
    register_node(&app, "node-1", &agent.uri()).await;

    let (status, accepted) = send_json(
        &app,
        "POST",
        "/api/v1/execute/async/node-1.plan",
        Some(json!({"input": {}, "webhook": {"url": "not a url"}})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(accepted["webhook_registered"], false);
    assert!(accepted["webhook_error"].is_string());
}

#[tokio::test]
async fn test_deferred_completion_through_status_report() {
    let agent = agent_replying(ResponseTemplate::new(202)).await;
    let (_plane, app) = create_test_app().await;
    register_node(&app, "node-1", &agent.uri()).await;

    let (_, accepted) = send_json(
        &app,
        "POST",
        "/api/v1/execute/async/node-1.plan",
        Some(json!({"input": {}})),
    )
    .await;
    let execution_id = accepted["execution_id"].as_str().unwrap().to_string();
    let detail_path = format!("/api/v1/executions/{}", execution_id);

    eventually("agent accepted the call", || {
        let app = app.clone();
        let detail_path = detail_path.clone();
        async move {
            let (_, detail) = send_json(&app, "GET", &detail_path, None).await;
            detail["status"] == "running"
        }
    })
    .await;

    let (status, body) = send_json(
        &app,
        "POST",
        &format!("/api/v1/executions/{}/status", execution_id),
        Some(json!({"status": "succeeded", "result": {"late": true}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "succeeded");
    assert_eq!(body["result"]["late"], true);

    // A second terminal report loses against the first.
    let (status, _) = send_json(
        &app,
        "POST",
        &format!("/api/v1/executions/{}/status", execution_id),
        Some(json!({"status": "failed", "error": "too late"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_cancel_execution() {
    let agent = agent_replying(
        ResponseTemplate::new(200)
            .set_body_json(json!("slow"))
            .set_delay(Duration::from_secs(3)),
    )
    .await;
    let (_plane, app) = create_test_app().await;
    register_node(&app, "node-1", &agent.uri()).await;

    let (_, accepted) = send_json(
        &app,
        "POST",
        "/api/v1/execute/async/node-1.plan",
        Some(json!({"input": {}})),
    )
    .await;
    let execution_id = accepted["execution_id"].as_str().unwrap();

    let (status, body) = send_json(
        &app,
        "POST",
        &format!("/api/v1/executions/{}/cancel", execution_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");
    assert_eq!(body["error_message"], "cancelled by request");
}

#[tokio::test]
async fn test_execution_events_stream_is_sse() {
    for uri in ["/api/v1/executions/events", "/api/v1/reasoners/events"] {
        let (_plane, app) = create_test_app().await;
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK, "{}", uri);
        let content_type = response.headers().get("content-type").unwrap().to_str().unwrap();
        assert!(content_type.starts_with("text/event-stream"));
    }
}

// ============================================================================
// Observability Endpoints
// ============================================================================

#[tokio::test]
async fn test_webhook_config_crud() {
    let (_plane, app) = create_test_app().await;

    let (status, body) = send_json(&app, "GET", "/api/v1/observability/webhook", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["configured"], false);

    let (status, _) = send_json(
        &app,
        "POST",
        "/api/v1/observability/webhook",
        Some(json!({"url": "ftp://nope"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send_json(
        &app,
        "POST",
        "/api/v1/observability/webhook",
        Some(json!({"url": "https://collector.test/events", "secret": "abc", "headers": {"X-Team": "infra"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["config"]["has_secret"], true);
    assert_eq!(body["config"]["enabled"], true);
    assert!(body["config"].get("secret").is_none());

    let (_, status_body) = send_json(&app, "GET", "/api/v1/observability/status", None).await;
    assert_eq!(status_body["enabled"], true);
    assert_eq!(status_body["webhook_url"], "https://collector.test/events");

    let (status, body) = send_json(&app, "DELETE", "/api/v1/observability/webhook", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "observability webhook configuration removed");

    let (_, body) = send_json(&app, "GET", "/api/v1/observability/webhook", None).await;
    assert_eq!(body["configured"], false);
}

#[tokio::test]
async fn test_failed_forwarding_dead_letters_then_redrives() {
    let collector = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&collector)
        .await;

    let (_plane, app) = create_test_app().await;
    let (status, _) = send_json(
        &app,
        "POST",
        "/api/v1/observability/webhook",
        Some(json!({"url": format!("{}/events", collector.uri())})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Registration emits one node event.
    register_node(&app, "node-1", "http://agent.test").await;

    eventually("dead-lettered event", || {
        let app = app.clone();
        async move {
            let (_, list) = send_json(&app, "GET", "/api/v1/observability/dead-letter", None).await;
            list["total_count"].as_u64().unwrap_or(0) >= 1
        }
    })
    .await;

    let (_, list) = send_json(&app, "GET", "/api/v1/observability/dead-letter?limit=10", None).await;
    let entry = &list["entries"][0];
    assert_eq!(entry["event_type"], "node.registered");
    assert_eq!(entry["destination"]["kind"], "observability");

    let (_, status_body) = send_json(&app, "GET", "/api/v1/observability/status", None).await;
    assert!(status_body["dead_letter_count"].as_u64().unwrap() >= 1);
    assert!(status_body["last_error"].is_string());

    collector.reset().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&collector)
        .await;

    let (status, redrive) = send_json(
        &app,
        "POST",
        "/api/v1/observability/dead-letter/redrive",
        Some(json!({"all": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(redrive["success"], true);
    assert!(redrive["processed"].as_u64().unwrap() >= 1);
    assert_eq!(redrive["failed"], 0);

    let (_, status_body) = send_json(&app, "GET", "/api/v1/observability/status", None).await;
    assert_eq!(status_body["dead_letter_count"], 0);
}

#[tokio::test]
async fn test_redrive_request_validation_and_clear() {
    let (_plane, app) = create_test_app().await;

    let (status, body) = send_json(&app, "POST", "/api/v1/observability/dead-letter/redrive", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "ValidationError");

    let (status, _) = send_json(
        &app,
        "POST",
        "/api/v1/observability/dead-letter/redrive",
        Some(json!({"ids": [999]})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send_json(&app, "DELETE", "/api/v1/observability/dead-letter", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "dead letter queue cleared");
    assert_eq!(body["deleted"], 0);
}
