//! REST API server

use anyhow::{Context, Result};
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, info};

use super::routes::{self, AppState};
use crate::app::ControlPlane;

/// Full application router: API routes under `/api/v1` with tracing and CORS.
pub fn build_router(plane: Arc<ControlPlane>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .max_age(Duration::from_secs(3600));

    let api_routes = routes::create_routes(AppState::new(plane))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors);

    Router::new()
        .nest("/api/v1", api_routes)
        .fallback(|| async { (axum::http::StatusCode::NOT_FOUND, "Not found") })
}

/// Serve the control plane until `shutdown` resolves, then stop its services.
pub async fn start_server<F>(plane: Arc<ControlPlane>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = format!("{}:{}", plane.config.server.host, plane.config.server.port)
        .parse()
        .context("Invalid server address")?;

    plane.start().await.context("Failed to start control plane services")?;

    let app = build_router(Arc::clone(&plane));

    info!("AgentField control plane starting...");
    info!("  Listening: http://{}", addr);
    info!("  API:       http://{}/api/v1/", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e));

    plane.shutdown().await;
    served
}
