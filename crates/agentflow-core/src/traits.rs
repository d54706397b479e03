use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;
use crate::workflow::{AgentDefinition, Workflow};

/// Receives structured log events emitted while an agent runs.
///
/// Step numbers are assigned by the sink: `llm_start`, `tool_start` and
/// `info` events open a new step, the rest belong to the latest one.
pub trait LogSink: Send + Sync + 'static {
    /// Persist one log event.
    fn record(
        &self,
        log_type: LogType,
        log_data: serde_json::Value,
    ) -> BoxFuture<'_, Result<()>>;
}

/// Everything an agent invocation gets to see.
#[derive(Clone)]
pub struct AgentRequest {
    pub agent: AgentDefinition,
    pub tools: Vec<String>,
    pub input: serde_json::Value,
    pub execution_id: ExecutionId,
    pub log_sink: Arc<dyn LogSink>,
}

impl std::fmt::Debug for AgentRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRequest")
            .field("agent", &self.agent.id)
            .field("tools", &self.tools)
            .field("input", &self.input)
            .field("execution_id", &self.execution_id)
            .finish()
    }
}

/// Agent execution capability: runs one LLM-driven agent with its tools.
pub trait AgentExecutor: Send + Sync + 'static {
    /// Run an agent once. A failed run may be reported either as
    /// `Err` or as an outcome with `status = failed`.
    fn execute(&self, request: AgentRequest) -> BoxFuture<'_, Result<AgentOutcome>>;
}

/// Persistence for executions and their logs.
pub trait ExecutionStore: Send + Sync + 'static {
    fn insert_execution(&self, execution: &Execution) -> BoxFuture<'_, Result<()>>;

    fn get_execution(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Option<Execution>>>;

    fn list_executions(&self, filter: &ExecutionFilter) -> BoxFuture<'_, Result<ExecutionPage>>;

    /// Delete an execution and, by cascade, its logs.
    fn delete_execution(&self, id: &ExecutionId) -> BoxFuture<'_, Result<bool>>;

    /// Atomically move `pending -> running`, bumping the attempt counter.
    /// Returns the new attempt, or `None` if the execution was not pending.
    fn claim_execution(
        &self,
        id: &ExecutionId,
        started_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<u32>>>;

    /// Atomically write a terminal status, provided the execution is not
    /// terminal yet and its attempt still equals `attempt`.
    fn finish_execution(
        &self,
        id: &ExecutionId,
        attempt: u32,
        completion: &Completion,
    ) -> BoxFuture<'_, Result<bool>>;

    /// Append a log, stamping its sequence, step number and timestamp in
    /// one write so concurrent writers cannot interleave them.
    fn append_log(&self, log: NewLog) -> BoxFuture<'_, Result<ExecutionLog>>;

    /// Logs with `seq > after_seq`, ordered by `(timestamp, seq)`.
    fn logs_since(
        &self,
        id: &ExecutionId,
        after_seq: i64,
    ) -> BoxFuture<'_, Result<Vec<ExecutionLog>>>;

    /// Delete logs older than `cutoff`. Returns the number removed.
    fn purge_logs_before(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<usize>>;
}

/// Agent and workflow definitions.
pub trait Catalog: Send + Sync + 'static {
    fn get_agent(&self, id: &str) -> BoxFuture<'_, Result<Option<AgentDefinition>>>;

    fn get_workflow(&self, id: &str) -> BoxFuture<'_, Result<Option<Workflow>>>;

    fn upsert_agent(&self, agent: &AgentDefinition) -> BoxFuture<'_, Result<()>>;

    fn upsert_workflow(&self, workflow: &Workflow) -> BoxFuture<'_, Result<()>>;
}

/// Task queue contract: at-least-once delivery, one active attempt per
/// execution, no ordering across executions.
pub trait TaskDispatcher: Send + Sync + 'static {
    fn enqueue(&self, task: ExecutionTask) -> BoxFuture<'_, Result<()>>;
}

/// Write-path hook telling live observers an execution changed.
pub trait ExecutionNotifier: Send + Sync + 'static {
    fn notify(&self, execution_id: &ExecutionId);
}
