use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use agentflow_core::config::StreamConfig;
use agentflow_core::error::{AgentflowError, Result};
use agentflow_core::traits::{ExecutionNotifier, ExecutionStore};
use agentflow_core::types::{Execution, ExecutionId};

use crate::protocol::StreamEvent;

const SUBSCRIBER_BUFFER: usize = 256;

struct Watch {
    wake: watch::Sender<u64>,
    subscribers: usize,
}

/// Live subscriptions to execution progress.
///
/// Every subscriber gets its own poller reading persisted state, so
/// subscribers never share a cursor and a slow or dead one cannot hold up
/// the others. [`ExecutionNotifier::notify`] wakes every poller of that
/// execution early; the poll interval still bounds latency for writes made
/// by other processes.
pub struct SubscriberRegistry {
    store: Arc<dyn ExecutionStore>,
    poll_interval: Duration,
    watches: Mutex<HashMap<ExecutionId, Watch>>,
}

impl SubscriberRegistry {
    pub fn new(config: &StreamConfig, store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            store,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            watches: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to one execution.
    ///
    /// The channel yields the current state, every recorded log in order,
    /// then deltas until one final `execution_complete` (or `error`) event,
    /// after which it closes.
    pub fn subscribe(self: &Arc<Self>, id: ExecutionId) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let wake = self.attach(id);
        let registry = self.clone();
        tokio::spawn(async move {
            registry.pump(id, tx, wake).await;
            registry.detach(&id);
        });
        rx
    }

    /// Number of live subscribers of one execution.
    pub fn subscriber_count(&self, id: &ExecutionId) -> usize {
        match self.watches.lock() {
            Ok(watches) => watches.get(id).map(|w| w.subscribers).unwrap_or(0),
            Err(_) => 0,
        }
    }

    fn attach(&self, id: ExecutionId) -> watch::Receiver<u64> {
        let mut watches = match self.watches.lock() {
            Ok(watches) => watches,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = watches.entry(id).or_insert_with(|| Watch {
            wake: watch::channel(0).0,
            subscribers: 0,
        });
        entry.subscribers += 1;
        entry.wake.subscribe()
    }

    fn detach(&self, id: &ExecutionId) {
        let mut watches = match self.watches.lock() {
            Ok(watches) => watches,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(entry) = watches.get_mut(id) {
            entry.subscribers = entry.subscribers.saturating_sub(1);
            if entry.subscribers == 0 {
                watches.remove(id);
            }
        }
    }

    async fn pump(
        &self,
        id: ExecutionId,
        tx: mpsc::Sender<StreamEvent>,
        mut wake: watch::Receiver<u64>,
    ) {
        info!(execution_id = %id, "Stream subscriber attached");
        match self.follow(id, &tx, &mut wake).await {
            Ok(Flow::Finished) => debug!(execution_id = %id, "Stream finished"),
            Ok(Flow::Gone) => debug!(execution_id = %id, "Stream subscriber gone"),
            Err(e) => {
                warn!(execution_id = %id, error = %e, "Stream failed");
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
        }
    }

    async fn follow(
        &self,
        id: ExecutionId,
        tx: &mpsc::Sender<StreamEvent>,
        wake: &mut watch::Receiver<u64>,
    ) -> Result<Flow> {
        let Some(mut execution) = self.store.get_execution(&id).await? else {
            let _ = tx
                .send(StreamEvent::Error {
                    message: "Execution not found".to_string(),
                })
                .await;
            return Ok(Flow::Finished);
        };
        if tx.send(StreamEvent::state(&execution)).await.is_err() {
            return Ok(Flow::Gone);
        }

        let mut cursor = 0;
        loop {
            // Logs are read after the execution row, so a terminal row
            // means every log of the run is already visible here.
            for log in self.store.logs_since(&id, cursor).await? {
                cursor = cursor.max(log.seq);
                if tx.send(StreamEvent::Log { data: log }).await.is_err() {
                    return Ok(Flow::Gone);
                }
            }

            if execution.status.is_terminal() {
                let _ = tx.send(StreamEvent::complete(&execution)).await;
                return Ok(Flow::Finished);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = wake.changed() => {
                    if changed.is_err() {
                        // Registry entry dropped; fall back to plain polling
                        tokio::time::sleep(self.poll_interval).await;
                    }
                }
                _ = tx.closed() => return Ok(Flow::Gone),
            }

            let current = self.reload(&id).await?;
            if changed_state(&execution, &current)
                && tx.send(StreamEvent::state(&current)).await.is_err()
            {
                return Ok(Flow::Gone);
            }
            execution = current;
        }
    }

    async fn reload(&self, id: &ExecutionId) -> Result<Execution> {
        self.store
            .get_execution(id)
            .await?
            .ok_or_else(|| AgentflowError::NotFound(id.to_string()))
    }
}

enum Flow {
    Finished,
    Gone,
}

fn changed_state(before: &Execution, after: &Execution) -> bool {
    before.status != after.status || before.completed_at != after.completed_at
}

impl ExecutionNotifier for SubscriberRegistry {
    fn notify(&self, id: &ExecutionId) {
        if let Ok(watches) = self.watches.lock() {
            if let Some(entry) = watches.get(id) {
                entry.wake.send_modify(|n| *n = n.wrapping_add(1));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::types::{
        Completion, ExecutionStatus, ExecutionTarget, LogType, NewLog, Usage,
    };
    use agentflow_store::SqliteStore;
    use chrono::Utc;
    use serde_json::json;

    fn registry(store: Arc<SqliteStore>, poll_interval_ms: u64) -> Arc<SubscriberRegistry> {
        Arc::new(SubscriberRegistry::new(
            &StreamConfig { poll_interval_ms },
            store,
        ))
    }

    async fn running(store: &SqliteStore) -> Execution {
        let exec = Execution::pending(ExecutionTarget::Workflow("wf".into()), json!({}), "alice");
        store.insert_execution(&exec).await.unwrap();
        store.claim_execution(&exec.id, Utc::now()).await.unwrap();
        store.get_execution(&exec.id).await.unwrap().unwrap()
    }

    async fn log(store: &SqliteStore, exec: &Execution, step: u32) {
        store
            .append_log(NewLog {
                execution_id: exec.id,
                log_type: LogType::Info,
                log_data: json!({"step": step}),
            })
            .await
            .unwrap();
    }

    async fn finish(store: &SqliteStore, exec: &Execution, status: ExecutionStatus) {
        let completion = Completion {
            status,
            output_data: Some(json!({"output": "done"})),
            error_message: None,
            usage: Usage { tokens: 42, cost: 0.1 },
            completed_at: Utc::now(),
        };
        assert!(store
            .finish_execution(&exec.id, exec.attempt, &completion)
            .await
            .unwrap());
    }

    async fn next(rx: &mut mpsc::Receiver<StreamEvent>) -> Option<StreamEvent> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("stream stalled")
    }

    fn log_step(event: &StreamEvent) -> u32 {
        match event {
            StreamEvent::Log { data } => data.step_number,
            other => panic!("expected log, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_execution_sends_error() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let mut rx = registry(store, 10).subscribe(ExecutionId::new());

        match next(&mut rx).await {
            Some(StreamEvent::Error { message }) => assert_eq!(message, "Execution not found"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(next(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn test_replays_batches_in_order_then_completes() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let exec = running(&store).await;
        log(&store, &exec, 1).await;
        log(&store, &exec, 2).await;

        let registry = registry(store.clone(), 10);
        let mut rx = registry.subscribe(exec.id);

        match next(&mut rx).await {
            Some(StreamEvent::ExecutionState { data }) => {
                assert_eq!(data.status, ExecutionStatus::Running)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(log_step(&next(&mut rx).await.unwrap()), 1);
        assert_eq!(log_step(&next(&mut rx).await.unwrap()), 2);

        // Second batch
        log(&store, &exec, 3).await;
        assert_eq!(log_step(&next(&mut rx).await.unwrap()), 3);

        finish(&store, &exec, ExecutionStatus::Success).await;
        match next(&mut rx).await {
            Some(StreamEvent::ExecutionState { data }) => {
                assert_eq!(data.status, ExecutionStatus::Success)
            }
            other => panic!("unexpected {:?}", other),
        }
        match next(&mut rx).await {
            Some(StreamEvent::ExecutionComplete { data }) => {
                assert_eq!(data.status, ExecutionStatus::Success);
                assert_eq!(data.output_data, Some(json!({"output": "done"})));
                assert_eq!(data.total_tokens, 42);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(next(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn test_terminal_execution_completes_immediately() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let exec = running(&store).await;
        log(&store, &exec, 1).await;
        finish(&store, &exec, ExecutionStatus::Failed).await;

        let mut rx = registry(store, 10).subscribe(exec.id);
        assert!(matches!(next(&mut rx).await, Some(StreamEvent::ExecutionState { .. })));
        assert_eq!(log_step(&next(&mut rx).await.unwrap()), 1);
        match next(&mut rx).await {
            Some(StreamEvent::ExecutionComplete { data }) => {
                assert_eq!(data.status, ExecutionStatus::Failed)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(next(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn test_notify_wakes_before_poll_interval() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let exec = running(&store).await;
        // An interval long enough that only a wakeup can deliver in time
        let registry = registry(store.clone(), 60_000);
        let mut rx = registry.subscribe(exec.id);
        assert!(matches!(next(&mut rx).await, Some(StreamEvent::ExecutionState { .. })));

        log(&store, &exec, 1).await;
        registry.notify(&exec.id);
        assert_eq!(log_step(&next(&mut rx).await.unwrap()), 1);
    }

    #[tokio::test]
    async fn test_dead_subscriber_does_not_affect_others() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let exec = running(&store).await;
        let registry = registry(store.clone(), 10);

        let dead = registry.subscribe(exec.id);
        let mut live = registry.subscribe(exec.id);
        assert_eq!(registry.subscriber_count(&exec.id), 2);
        drop(dead);

        assert!(matches!(next(&mut live).await, Some(StreamEvent::ExecutionState { .. })));
        log(&store, &exec, 1).await;
        assert_eq!(log_step(&next(&mut live).await.unwrap()), 1);

        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.subscriber_count(&exec.id) != 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("dead subscriber was not dropped");

        finish(&store, &exec, ExecutionStatus::Success).await;
        while let Some(event) = next(&mut live).await {
            if event.is_final() {
                break;
            }
        }
        drop(live);
        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.subscriber_count(&exec.id) != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("registry entry was not cleaned up");
    }
}
