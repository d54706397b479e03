use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use agentflow_core::config::EngineConfig;
use agentflow_core::error::Result;
use agentflow_core::traits::{AgentExecutor, Catalog, ExecutionNotifier, ExecutionStore};
use agentflow_core::types::{Execution, ExecutionFilter, ExecutionStatus, ExecutionTask};

use crate::dispatch::LocalDispatcher;
use crate::lifecycle::LifecycleManager;
use crate::worker::{Worker, WorkerPool};

/// A lifecycle manager wired to an in-process worker pool.
pub struct Engine {
    lifecycle: Arc<LifecycleManager>,
    dispatcher: LocalDispatcher,
    pool: JoinHandle<()>,
    cancel: CancellationToken,
}

impl Engine {
    /// Spawn the worker pool and return the running engine.
    pub fn start(
        config: &EngineConfig,
        store: Arc<dyn ExecutionStore>,
        catalog: Arc<dyn Catalog>,
        executor: Arc<dyn AgentExecutor>,
        notifier: Option<Arc<dyn ExecutionNotifier>>,
        cancel: CancellationToken,
    ) -> Self {
        let (dispatcher, rx) = LocalDispatcher::new(config.queue_capacity);
        let mut lifecycle = LifecycleManager::new(store, catalog, Arc::new(dispatcher.clone()));
        if let Some(notifier) = notifier {
            lifecycle = lifecycle.with_notifier(notifier);
        }
        let lifecycle = Arc::new(lifecycle);

        let worker = Arc::new(Worker::new(lifecycle.clone(), executor));
        let pool = WorkerPool::new(worker, config.workers, cancel.clone())
            .with_grace(Duration::from_secs(config.shutdown_grace_secs));
        let pool = tokio::spawn(pool.run(rx));

        info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            shutdown_grace_secs = config.shutdown_grace_secs,
            parallel_join = ?config.parallel_join,
            "Engine started"
        );
        Self {
            lifecycle,
            dispatcher,
            pool,
            cancel,
        }
    }

    pub fn lifecycle(&self) -> Arc<LifecycleManager> {
        self.lifecycle.clone()
    }

    /// Fail `running` executions and re-enqueue `pending` ones left over
    /// from a previous process. Returns (requeued, failed).
    ///
    /// Unlike `submit`, requeueing waits for queue space.
    pub async fn recover(&self) -> Result<(usize, usize)> {
        let orphaned = self.collect(ExecutionStatus::Running).await?;
        let queued = self.collect(ExecutionStatus::Pending).await?;

        let mut failed = 0;
        for execution in &orphaned {
            if self
                .lifecycle
                .fail_running(&execution.id, "interrupted by restart")
                .await?
            {
                warn!(execution_id = %execution.id, "Execution interrupted by restart");
                failed += 1;
            }
        }

        for execution in &queued {
            self.dispatcher
                .send(ExecutionTask {
                    kind: execution.target.kind(),
                    execution_id: execution.id,
                })
                .await?;
            debug!(execution_id = %execution.id, "Requeued pending execution");
        }

        if failed + queued.len() > 0 {
            info!(requeued = queued.len(), failed, "Recovered executions from previous run");
        }
        Ok((queued.len(), failed))
    }

    async fn collect(&self, status: ExecutionStatus) -> Result<Vec<Execution>> {
        let store = self.lifecycle.store();
        let mut found = Vec::new();
        let mut page = 1;
        loop {
            let filter = ExecutionFilter {
                status: Some(status),
                page,
                page_size: 100,
                ..Default::default()
            };
            let batch = store.list_executions(&filter).await?;
            let done = batch.executions.is_empty()
                || u64::from(page) * u64::from(batch.page_size) >= batch.total;
            found.extend(batch.executions);
            if done {
                return Ok(found);
            }
            page += 1;
        }
    }

    /// Stop taking tasks and wait for in-flight executions to finish,
    /// cancelling those that outlast the shutdown grace period.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.pool.await {
            warn!(error = %e, "Worker pool task ended abnormally");
        }
    }
}
