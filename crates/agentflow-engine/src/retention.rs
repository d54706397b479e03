use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use agentflow_core::config::RetentionConfig;
use agentflow_core::error::{AgentflowError, Result};
use agentflow_core::traits::ExecutionStore;

/// Deletes execution logs older than `max_age_days` on a cron schedule.
pub struct RetentionSweeper {
    schedule: Schedule,
    max_age: chrono::Duration,
    store: Arc<dyn ExecutionStore>,
    cancel: CancellationToken,
}

impl RetentionSweeper {
    pub fn new(
        config: &RetentionConfig,
        store: Arc<dyn ExecutionStore>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let schedule = Schedule::from_str(&config.schedule).map_err(|e| {
            AgentflowError::Config(format!(
                "invalid retention schedule '{}': {}",
                config.schedule, e
            ))
        })?;
        Ok(Self {
            schedule,
            max_age: chrono::Duration::days(i64::from(config.max_age_days)),
            store,
            cancel,
        })
    }

    /// Delete logs older than the configured age once.
    pub async fn sweep_once(&self) -> Result<usize> {
        let cutoff = Utc::now().checked_sub_signed(self.max_age).ok_or_else(|| {
            AgentflowError::Config(format!(
                "retention age of {} days is out of range",
                self.max_age.num_days()
            ))
        })?;
        let removed = self.store.purge_logs_before(cutoff).await?;
        info!(removed, cutoff = %cutoff, "Log retention sweep finished");
        Ok(removed)
    }

    /// Run the sweep loop. Blocks until cancelled.
    pub async fn run(&self) {
        info!(max_age_days = self.max_age.num_days(), "Log retention sweeper started");

        loop {
            let Some(fire_at) = self.schedule.upcoming(Utc).next() else {
                // Schedule has no future occurrences
                self.cancel.cancelled().await;
                break;
            };
            let delay = (fire_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::from_secs(1));

            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "Log retention sweep failed");
                    }
                }
                _ = self.cancel.cancelled() => {
                    info!("Log retention sweeper shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::traits::ExecutionStore;
    use agentflow_core::types::{Execution, ExecutionTarget, LogType, NewLog};
    use agentflow_store::SqliteStore;
    use serde_json::json;

    fn config(schedule: &str, max_age_days: u32) -> RetentionConfig {
        RetentionConfig {
            enabled: true,
            schedule: schedule.into(),
            max_age_days,
        }
    }

    fn sweeper(store: Arc<SqliteStore>, max_age_days: u32) -> RetentionSweeper {
        RetentionSweeper::new(
            &config("0 0 2 * * *", max_age_days),
            store,
            CancellationToken::new(),
        )
        .unwrap()
    }

    async fn store_with_logs(count: usize) -> (Arc<SqliteStore>, Execution) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let exec = Execution::pending(ExecutionTarget::Agent("a".into()), json!({}), "alice");
        store.insert_execution(&exec).await.unwrap();
        for i in 0..count {
            store
                .append_log(NewLog {
                    execution_id: exec.id,
                    log_type: LogType::Info,
                    log_data: json!({"i": i}),
                })
                .await
                .unwrap();
        }
        (store, exec)
    }

    #[test]
    fn test_invalid_schedule() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let result =
            RetentionSweeper::new(&config("not a cron", 90), store, CancellationToken::new());
        assert!(matches!(result, Err(AgentflowError::Config(_))));
    }

    #[tokio::test]
    async fn test_sweep_keeps_recent_logs() {
        let (store, exec) = store_with_logs(3).await;

        assert_eq!(sweeper(store.clone(), 90).sweep_once().await.unwrap(), 0);
        assert_eq!(store.logs_since(&exec.id, 0).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_sweep_removes_logs_past_cutoff() {
        let (store, exec) = store_with_logs(3).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(sweeper(store.clone(), 0).sweep_once().await.unwrap(), 3);
        assert!(store.logs_since(&exec.id, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_with_huge_age_is_config_error() {
        let (store, exec) = store_with_logs(1).await;

        let result = sweeper(store.clone(), u32::MAX).sweep_once().await;
        assert!(matches!(result, Err(AgentflowError::Config(_))), "{:?}", result);
        assert_eq!(store.logs_since(&exec.id, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let cancel = CancellationToken::new();
        let sweeper =
            RetentionSweeper::new(&config("0 0 2 * * *", 90), store, cancel.clone()).unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), sweeper.run())
            .await
            .expect("sweeper did not stop");
    }
}
