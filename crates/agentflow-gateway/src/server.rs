use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use agentflow_core::config::GatewayConfig;
use agentflow_engine::LifecycleManager;

use crate::routes;
use crate::state::AppState;
use crate::stream::SubscriberRegistry;

/// Routes of the execution API.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // WebSocket log stream
        .route("/ws/executions/{id}", get(routes::ws_handler))
        // REST API
        .route("/api/health", get(routes::health))
        .route(
            "/api/executions",
            get(routes::list_executions).post(routes::submit_execution),
        )
        .route(
            "/api/executions/{id}",
            get(routes::get_execution).delete(routes::delete_execution),
        )
        .route("/api/executions/{id}/cancel", post(routes::cancel_execution))
        .route("/api/executions/{id}/logs", get(routes::execution_logs))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// HTTP + WebSocket gateway server built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    lifecycle: Arc<LifecycleManager>,
    registry: Arc<SubscriberRegistry>,
}

impl GatewayServer {
    pub fn new(
        config: GatewayConfig,
        lifecycle: Arc<LifecycleManager>,
        registry: Arc<SubscriberRegistry>,
    ) -> Self {
        Self {
            config,
            lifecycle,
            registry,
        }
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let state = Arc::new(AppState {
            lifecycle: self.lifecycle.clone(),
            registry: self.registry.clone(),
        });
        let app = router(state);

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
