use chrono::{DateTime, Utc};
use serde::Serialize;

use agentflow_core::types::{Execution, ExecutionId, ExecutionLog, ExecutionStatus};

/// A frame pushed to a stream subscriber. Serialized as
/// `{"type": "...", ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    ExecutionState { data: ExecutionSnapshot },
    Log { data: ExecutionLog },
    ExecutionComplete { data: CompletionSummary },
    Error { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSnapshot {
    pub id: ExecutionId,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionSummary {
    pub status: ExecutionStatus,
    pub output_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub total_tokens: u64,
    pub total_cost: f64,
}

impl StreamEvent {
    pub fn state(execution: &Execution) -> Self {
        Self::ExecutionState {
            data: ExecutionSnapshot {
                id: execution.id,
                status: execution.status,
                started_at: execution.started_at,
                completed_at: execution.completed_at,
                output_data: execution.output_data.clone(),
                error_message: execution.error_message.clone(),
            },
        }
    }

    pub fn complete(execution: &Execution) -> Self {
        Self::ExecutionComplete {
            data: CompletionSummary {
                status: execution.status,
                output_data: execution.output_data.clone(),
                error_message: execution.error_message.clone(),
                total_tokens: execution.total_tokens,
                total_cost: execution.total_cost,
            },
        }
    }

    /// Whether the stream ends after this event.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::ExecutionComplete { .. } | Self::Error { .. })
    }
}
