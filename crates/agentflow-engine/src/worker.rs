use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use agentflow_core::error::{AgentflowError, Result};
use agentflow_core::traits::AgentExecutor;
use agentflow_core::types::*;

use crate::graph::{Interpreter, WorkflowState};
use crate::lifecycle::{ExecutionLogSink, LifecycleManager};

/// Runs one execution end-to-end: accept, interpret, complete.
pub struct Worker {
    lifecycle: Arc<LifecycleManager>,
    executor: Arc<dyn AgentExecutor>,
}

impl Worker {
    pub fn new(lifecycle: Arc<LifecycleManager>, executor: Arc<dyn AgentExecutor>) -> Self {
        Self {
            lifecycle,
            executor,
        }
    }

    /// Handle one delivered task.
    ///
    /// Duplicate or late deliveries are dropped without running anything.
    pub async fn handle(&self, task: ExecutionTask) -> Result<()> {
        let id = task.execution_id;
        let execution = match self.lifecycle.accept(&id).await {
            Ok(execution) => execution,
            Err(
                e @ (AgentflowError::AlreadyRunning(_) | AgentflowError::AlreadyTerminal { .. }),
            ) => {
                warn!(execution_id = %id, error = %e, "Dropping duplicate delivery");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if execution.target.kind() != task.kind {
            warn!(
                execution_id = %id,
                task_kind = ?task.kind,
                "Task kind does not match execution target, using target"
            );
        }

        let cancel = self.lifecycle.cancellation_token(&id).await;
        let sink = Arc::new(ExecutionLogSink::new(self.lifecycle.clone(), id));
        let interpreter = Interpreter::new(self.executor.clone(), sink, id, cancel);

        let completion = match &execution.target {
            ExecutionTarget::Agent(agent_id) => {
                self.run_agent(&interpreter, agent_id, execution.input_data.clone())
                    .await
            }
            ExecutionTarget::Workflow(workflow_id) => {
                self.run_workflow(&interpreter, workflow_id, execution.input_data.clone())
                    .await
            }
        };

        if let Some(error) = &completion.error_message {
            if completion.status == ExecutionStatus::Failed {
                error!(execution_id = %id, error = %error, "Execution failed");
            }
        }
        self.lifecycle
            .complete(&id, execution.attempt, completion)
            .await?;
        Ok(())
    }

    async fn run_agent(
        &self,
        interpreter: &Interpreter,
        agent_id: &str,
        input: serde_json::Value,
    ) -> Completion {
        let result = match self.lifecycle.load_agent(agent_id).await {
            Ok(agent) => interpreter.run_agent(&agent, input).await,
            Err(e) => Err(e),
        };
        let usage = interpreter.usage();

        match result {
            Ok(outcome) => finished(
                ExecutionStatus::Success,
                Some(json!({"output": outcome.output})),
                None,
                usage,
            ),
            Err(AgentflowError::Cancelled) => finished(
                ExecutionStatus::Cancelled,
                None,
                Some(AgentflowError::Cancelled.to_string()),
                usage,
            ),
            Err(e) => finished(ExecutionStatus::Failed, None, Some(e.to_string()), usage),
        }
    }

    async fn run_workflow(
        &self,
        interpreter: &Interpreter,
        workflow_id: &str,
        input: serde_json::Value,
    ) -> Completion {
        // The graph is rebuilt from the catalog snapshot taken now
        let graph = match self.lifecycle.load_graph(workflow_id).await {
            Ok(graph) => graph,
            Err(e) => {
                let error = Some(e.to_string());
                return finished(ExecutionStatus::Failed, None, error, Usage::default());
            }
        };

        let run = interpreter.run(&graph, WorkflowState::seeded(input)).await;
        let output = Some(run.state.output_data());
        let status = if run.cancelled {
            ExecutionStatus::Cancelled
        } else if run.state.error.is_some() {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Success
        };
        finished(status, output, run.state.error, run.usage)
    }
}

fn finished(
    status: ExecutionStatus,
    output_data: Option<serde_json::Value>,
    error_message: Option<String>,
    usage: Usage,
) -> Completion {
    Completion {
        status,
        output_data,
        error_message,
        usage,
        completed_at: Utc::now(),
    }
}

const DEFAULT_GRACE: Duration = Duration::from_secs(30);

/// Pulls tasks off the queue and runs up to `concurrency` at once.
pub struct WorkerPool {
    worker: Arc<Worker>,
    concurrency: usize,
    grace: Duration,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(worker: Arc<Worker>, concurrency: usize, cancel: CancellationToken) -> Self {
        Self {
            worker,
            concurrency: concurrency.max(1),
            grace: DEFAULT_GRACE,
            cancel,
        }
    }

    /// How long a stopping pool waits before cancelling in-flight executions.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Run until cancelled or the queue closes, then wait for in-flight
    /// executions. Those still running after the grace period are
    /// cancelled and complete as `cancelled`.
    pub async fn run(self, mut rx: mpsc::Receiver<ExecutionTask>) {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight = JoinSet::new();
        info!(workers = self.concurrency, "Worker pool started");

        loop {
            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.cancel.cancelled() => break,
            };

            let task = tokio::select! {
                task = rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
                _ = self.cancel.cancelled() => break,
            };

            let worker = self.worker.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                let id = task.execution_id;
                let handled = tokio::spawn({
                    let worker = worker.clone();
                    async move { worker.handle(task).await }
                })
                .await;

                match handled {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(execution_id = %id, error = %e, "Task failed"),
                    Err(join_err) => {
                        error!(execution_id = %id, error = %join_err, "Worker crashed");
                        let reason = format!("worker crashed: {}", join_err);
                        if let Err(e) = worker.lifecycle.fail_running(&id, &reason).await {
                            error!(
                                execution_id = %id,
                                error = %e,
                                "Could not fail crashed execution"
                            );
                        }
                    }
                }
            });

            // Reap finished handlers
            while in_flight.try_join_next().is_some() {}
        }

        info!(in_flight = in_flight.len(), "Worker pool draining");
        let drained = tokio::time::timeout(self.grace, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            let cancelled = self.worker.lifecycle.cancel_in_flight().await;
            warn!(
                cancelled,
                grace_ms = self.grace.as_millis() as u64,
                "Grace period over, cancelled in-flight executions"
            );
            while in_flight.join_next().await.is_some() {}
        }
        info!("Worker pool stopped");
    }
}
