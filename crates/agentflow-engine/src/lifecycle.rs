use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use agentflow_core::error::{AgentflowError, Result};
use agentflow_core::traits::{Catalog, ExecutionNotifier, ExecutionStore, LogSink, TaskDispatcher};
use agentflow_core::types::*;
use agentflow_core::workflow::AgentDefinition;

use crate::graph::{build, ExecutableGraph};

/// An execution together with its logs.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionDetail {
    #[serde(flatten)]
    pub execution: Execution,
    pub logs: Vec<ExecutionLog>,
}

/// Owns every status transition of an [`Execution`].
///
/// `pending -> running` happens exactly once, in [`accept`](Self::accept).
/// A terminal status is written exactly once, in [`complete`](Self::complete)
/// or [`cancel`](Self::cancel); later writes are no-ops.
pub struct LifecycleManager {
    store: Arc<dyn ExecutionStore>,
    catalog: Arc<dyn Catalog>,
    dispatcher: Arc<dyn TaskDispatcher>,
    notifier: Option<Arc<dyn ExecutionNotifier>>,
    running: Mutex<HashMap<ExecutionId, CancellationToken>>,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        catalog: Arc<dyn Catalog>,
        dispatcher: Arc<dyn TaskDispatcher>,
    ) -> Self {
        Self {
            store,
            catalog,
            dispatcher,
            notifier: None,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Tell `notifier` about every persisted log and transition.
    pub fn with_notifier(mut self, notifier: Arc<dyn ExecutionNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    fn notify(&self, id: &ExecutionId) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(id);
        }
    }

    /// Create a `pending` execution and hand it to the dispatch layer.
    ///
    /// Workflow targets are built first, so a malformed workflow is rejected
    /// here and never reaches a worker.
    pub async fn submit(
        &self,
        target: ExecutionTarget,
        input_data: serde_json::Value,
        requester: &str,
    ) -> Result<Execution> {
        match &target {
            ExecutionTarget::Agent(id) => {
                self.load_agent(id).await?;
            }
            ExecutionTarget::Workflow(id) => {
                self.load_graph(id).await?;
            }
        }

        let execution = Execution::pending(target, input_data, requester);
        self.store.insert_execution(&execution).await?;
        info!(
            execution_id = %execution.id,
            target = %execution.target.id(),
            requester,
            "Execution submitted"
        );

        let task = ExecutionTask {
            kind: execution.target.kind(),
            execution_id: execution.id,
        };
        if let Err(e) = self.dispatcher.enqueue(task).await {
            warn!(execution_id = %execution.id, error = %e, "Enqueue failed, failing execution");
            let completion = Completion {
                status: ExecutionStatus::Failed,
                output_data: None,
                error_message: Some(e.to_string()),
                usage: Usage::default(),
                completed_at: Utc::now(),
            };
            self.store
                .finish_execution(&execution.id, execution.attempt, &completion)
                .await?;
            self.notify(&execution.id);
            return Err(e);
        }

        Ok(execution)
    }

    /// Claim a `pending` execution for one worker.
    ///
    /// Fails with `AlreadyRunning` or `AlreadyTerminal` on a repeated or
    /// late delivery, and with `NotFound` for an unknown id.
    pub async fn accept(&self, id: &ExecutionId) -> Result<Execution> {
        // Register the token before claiming so a concurrent cancel finds it
        let registered = {
            let mut running = self.running.lock().await;
            if running.contains_key(id) {
                false
            } else {
                running.insert(*id, CancellationToken::new());
                true
            }
        };

        let claimed = self.store.claim_execution(id, Utc::now()).await;
        let attempt = match claimed {
            Ok(Some(attempt)) => attempt,
            other => {
                let err = match other {
                    Err(e) => e,
                    Ok(_) => self.rejection(id).await,
                };
                // The winner of a concurrent accept may be using our token
                if registered && !matches!(err, AgentflowError::AlreadyRunning(_)) {
                    self.running.lock().await.remove(id);
                }
                return Err(err);
            }
        };

        let execution = self
            .store
            .get_execution(id)
            .await?
            .ok_or_else(|| AgentflowError::NotFound(id.to_string()))?;
        info!(execution_id = %id, attempt, "Execution accepted");
        self.notify(id);
        Ok(execution)
    }

    async fn rejection(&self, id: &ExecutionId) -> AgentflowError {
        match self.store.get_execution(id).await {
            Ok(None) => AgentflowError::NotFound(id.to_string()),
            Ok(Some(execution)) if execution.status.is_terminal() => {
                AgentflowError::AlreadyTerminal {
                    id: id.to_string(),
                    status: execution.status.to_string(),
                }
            }
            Ok(Some(_)) => AgentflowError::AlreadyRunning(id.to_string()),
            Err(e) => e,
        }
    }

    /// Cancellation token of an accepted execution.
    pub async fn cancellation_token(&self, id: &ExecutionId) -> CancellationToken {
        self.running
            .lock()
            .await
            .entry(*id)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Trip the token of every execution accepted in this process.
    /// Returns how many were tripped.
    pub async fn cancel_in_flight(&self) -> usize {
        let running = self.running.lock().await;
        for (id, token) in running.iter() {
            warn!(execution_id = %id, "Cancelling in-flight execution");
            token.cancel();
        }
        running.len()
    }

    /// Append one log event. The store assigns its step number.
    pub async fn record_log(
        &self,
        id: &ExecutionId,
        log_type: LogType,
        log_data: serde_json::Value,
    ) -> Result<ExecutionLog> {
        let log = self
            .store
            .append_log(NewLog {
                execution_id: *id,
                log_type,
                log_data,
            })
            .await?;
        self.notify(id);
        Ok(log)
    }

    /// Write the terminal status of an attempt.
    ///
    /// Returns `false` (and only logs) when the execution is already
    /// terminal. A completion from a superseded attempt is `StaleAttempt`.
    pub async fn complete(
        &self,
        id: &ExecutionId,
        attempt: u32,
        completion: Completion,
    ) -> Result<bool> {
        let written = self.store.finish_execution(id, attempt, &completion).await?;
        if written {
            self.running.lock().await.remove(id);
            info!(
                execution_id = %id,
                status = %completion.status,
                tokens = completion.usage.tokens,
                "Execution completed"
            );
            self.notify(id);
            return Ok(true);
        }

        match self.store.get_execution(id).await? {
            None => Err(AgentflowError::NotFound(id.to_string())),
            Some(current) if current.status.is_terminal() => {
                warn!(
                    execution_id = %id,
                    status = %current.status,
                    attempted = %completion.status,
                    "Execution already terminal, ignoring completion"
                );
                Ok(false)
            }
            Some(current) => Err(AgentflowError::StaleAttempt {
                id: format!("{} (current attempt {})", id, current.attempt),
                attempt,
            }),
        }
    }

    /// Fail a `running` execution whose worker died without completing it.
    pub async fn fail_running(&self, id: &ExecutionId, error: &str) -> Result<bool> {
        let Some(execution) = self.store.get_execution(id).await? else {
            return Ok(false);
        };
        if execution.status != ExecutionStatus::Running {
            return Ok(false);
        }
        let completion = Completion {
            status: ExecutionStatus::Failed,
            output_data: None,
            error_message: Some(error.to_string()),
            usage: Usage::default(),
            completed_at: Utc::now(),
        };
        self.complete(id, execution.attempt, completion).await
    }

    /// Cancel an execution.
    ///
    /// A `pending` execution becomes `cancelled` immediately. A `running`
    /// one has its token tripped; its worker then completes it as
    /// `cancelled` with partial output. With no live worker in this process
    /// the execution is marked `cancelled` directly.
    pub async fn cancel(&self, id: &ExecutionId) -> Result<Execution> {
        let execution = self
            .store
            .get_execution(id)
            .await?
            .ok_or_else(|| AgentflowError::NotFound(id.to_string()))?;

        if execution.status.is_terminal() {
            return Err(AgentflowError::AlreadyTerminal {
                id: id.to_string(),
                status: execution.status.to_string(),
            });
        }

        let cancelled = Completion {
            status: ExecutionStatus::Cancelled,
            output_data: None,
            error_message: Some(AgentflowError::Cancelled.to_string()),
            usage: Usage::default(),
            completed_at: Utc::now(),
        };

        if execution.status == ExecutionStatus::Pending
            && self
                .store
                .finish_execution(id, execution.attempt, &cancelled)
                .await?
        {
            info!(execution_id = %id, "Pending execution cancelled");
            self.notify(id);
            return self.reload(id).await;
        }

        let token = self.running.lock().await.get(id).cloned();
        match token {
            Some(token) => {
                info!(execution_id = %id, "Cancelling running execution");
                token.cancel();
            }
            None => {
                // Re-read: the pending write above may have lost a race with accept
                let current = self.reload(id).await?;
                if !current.status.is_terminal() {
                    warn!(execution_id = %id, "No live worker, marking cancelled");
                    self.complete(id, current.attempt, cancelled).await?;
                }
            }
        }
        self.reload(id).await
    }

    async fn reload(&self, id: &ExecutionId) -> Result<Execution> {
        self.store
            .get_execution(id)
            .await?
            .ok_or_else(|| AgentflowError::NotFound(id.to_string()))
    }

    pub async fn get(&self, id: &ExecutionId) -> Result<ExecutionDetail> {
        let execution = self.reload(id).await?;
        let logs = self.store.logs_since(id, 0).await?;
        Ok(ExecutionDetail { execution, logs })
    }

    pub async fn list(&self, filter: &ExecutionFilter) -> Result<ExecutionPage> {
        self.store.list_executions(filter).await
    }

    /// Delete an execution and its logs. Running executions are refused.
    pub async fn delete(&self, id: &ExecutionId) -> Result<()> {
        let execution = self.reload(id).await?;
        if execution.status == ExecutionStatus::Running {
            return Err(AgentflowError::AlreadyRunning(id.to_string()));
        }
        self.store.delete_execution(id).await?;
        debug!(execution_id = %id, "Execution deleted");
        Ok(())
    }

    pub async fn load_agent(&self, id: &str) -> Result<AgentDefinition> {
        self.catalog
            .get_agent(id)
            .await?
            .ok_or_else(|| AgentflowError::NotFound(format!("agent {}", id)))
    }

    /// Load a workflow and every agent it references, then build its graph.
    pub async fn load_graph(&self, workflow_id: &str) -> Result<ExecutableGraph> {
        let workflow = self
            .catalog
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| AgentflowError::NotFound(format!("workflow {}", workflow_id)))?;

        let mut agents = HashMap::new();
        for agent_id in workflow.agent_ids() {
            if let Some(agent) = self.catalog.get_agent(&agent_id).await? {
                agents.insert(agent_id, agent);
            }
        }
        build(&workflow, &agents)
    }
}

/// Log sink that persists through the lifecycle manager.
pub struct ExecutionLogSink {
    lifecycle: Arc<LifecycleManager>,
    execution_id: ExecutionId,
}

impl ExecutionLogSink {
    pub fn new(lifecycle: Arc<LifecycleManager>, execution_id: ExecutionId) -> Self {
        Self {
            lifecycle,
            execution_id,
        }
    }
}

impl LogSink for ExecutionLogSink {
    fn record(
        &self,
        log_type: LogType,
        log_data: serde_json::Value,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.lifecycle
                .record_log(&self.execution_id, log_type, log_data)
                .await?;
            Ok(())
        })
    }
}
