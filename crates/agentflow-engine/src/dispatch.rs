use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use agentflow_core::error::{AgentflowError, Result};
use agentflow_core::traits::TaskDispatcher;
use agentflow_core::types::ExecutionTask;

/// In-process task queue feeding the worker pool.
///
/// Each task is delivered once to exactly one worker; the lifecycle
/// manager's attempt fencing covers redeliveries from other dispatchers.
#[derive(Clone)]
pub struct LocalDispatcher {
    tx: mpsc::Sender<ExecutionTask>,
}

impl LocalDispatcher {
    /// Create a new queue and return (dispatcher, receiver).
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ExecutionTask>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueue, waiting for queue space.
    pub async fn send(&self, task: ExecutionTask) -> Result<()> {
        self.tx
            .send(task)
            .await
            .map_err(|e| AgentflowError::Dispatch(format!("task queue closed: {}", e)))
    }
}

impl TaskDispatcher for LocalDispatcher {
    /// Never waits: a full queue is a dispatch error.
    fn enqueue(&self, task: ExecutionTask) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.tx.try_send(task).map_err(|e| match e {
                TrySendError::Full(task) => AgentflowError::Dispatch(format!(
                    "task queue full, execution {} not queued",
                    task.execution_id
                )),
                TrySendError::Closed(_) => AgentflowError::Dispatch("task queue closed".into()),
            })
        })
    }
}
