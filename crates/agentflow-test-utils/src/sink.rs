use std::sync::Mutex;

use futures::future::BoxFuture;
use serde_json::Value;

use agentflow_core::error::Result;
use agentflow_core::traits::LogSink;
use agentflow_core::types::LogType;

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedLog {
    pub step_number: u32,
    pub log_type: LogType,
    pub log_data: Value,
}

/// A log sink that keeps everything in memory, numbering steps the way
/// the store does.
#[derive(Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<RecordedLog>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<RecordedLog> {
        match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(_) => vec![],
        }
    }

    pub fn of_type(&self, log_type: LogType) -> Vec<RecordedLog> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.log_type == log_type)
            .collect()
    }
}

impl LogSink for MemoryLogSink {
    fn record(&self, log_type: LogType, log_data: Value) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if let Ok(mut entries) = self.entries.lock() {
                let latest = entries.last().map(|e| e.step_number).unwrap_or(0);
                let step_number = if log_type.opens_step() {
                    latest + 1
                } else {
                    latest.max(1)
                };
                entries.push(RecordedLog {
                    step_number,
                    log_type,
                    log_data,
                });
            }
            Ok(())
        })
    }
}
