use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::{debug, error};

use agentflow_core::error::AgentflowError;
use agentflow_core::traits::ExecutionStore;
use agentflow_core::types::{ExecutionFilter, ExecutionId, ExecutionTarget};

use crate::connection;
use crate::state::AppState;

/// An engine error rendered as `{"error": "..."}` with a matching status.
pub struct ApiError(AgentflowError);

impl From<AgentflowError> for ApiError {
    fn from(e: AgentflowError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AgentflowError::NotFound(_) => StatusCode::NOT_FOUND,
            AgentflowError::Config(_) => StatusCode::BAD_REQUEST,
            AgentflowError::AlreadyRunning(_) | AgentflowError::AlreadyTerminal { .. } => {
                StatusCode::CONFLICT
            }
            AgentflowError::Dispatch(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "Request failed");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_id(id: &str) -> ApiResult<ExecutionId> {
    Ok(id.parse::<ExecutionId>()?)
}

// GET /api/health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Deserialize)]
pub struct SubmitBody {
    #[serde(flatten)]
    pub target: ExecutionTarget,
    #[serde(default)]
    pub input_data: serde_json::Value,
    #[serde(default = "default_requester")]
    pub requester: String,
}

fn default_requester() -> String {
    "api".to_string()
}

// POST /api/executions
pub async fn submit_execution(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubmitBody>,
) -> ApiResult<Response> {
    let execution = state
        .lifecycle
        .submit(body.target, body.input_data, &body.requester)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(execution)).into_response())
}

// GET /api/executions?status=&agent_id=&workflow_id=&page=&page_size=
pub async fn list_executions(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<ExecutionFilter>,
) -> ApiResult<Response> {
    let page = state.lifecycle.list(&filter).await?;
    Ok(Json(page).into_response())
}

// GET /api/executions/{id}
pub async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let detail = state.lifecycle.get(&parse_id(&id)?).await?;
    Ok(Json(detail).into_response())
}

// DELETE /api/executions/{id}
pub async fn delete_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.lifecycle.delete(&parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

// POST /api/executions/{id}/cancel
pub async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let execution = state.lifecycle.cancel(&parse_id(&id)?).await?;
    Ok(Json(execution).into_response())
}

#[derive(Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub after: i64,
}

// GET /api/executions/{id}/logs?after=<seq>
pub async fn execution_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<LogsQuery>,
) -> ApiResult<Response> {
    let id = parse_id(&id)?;
    // 404 for unknown executions rather than an empty list
    state.lifecycle.get(&id).await?;
    let logs = state.lifecycle.store().logs_since(&id, q.after).await?;
    Ok(Json(serde_json::json!({ "logs": logs })).into_response())
}

// GET /ws/executions/{id}
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    debug!(execution_id = %id, "WebSocket upgrade");
    let id = id.parse::<ExecutionId>().map_err(|e| e.to_string());
    let registry = state.registry.clone();
    ws.on_upgrade(move |socket: WebSocket| connection::handle_connection(socket, id, registry))
}
