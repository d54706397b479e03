use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use agentflow_core::error::{AgentflowError, Result};
use agentflow_core::traits::{AgentExecutor, AgentRequest};
use agentflow_core::types::{AgentOutcome, LogType, Usage};

#[derive(Debug, Clone, Default)]
struct Script {
    output: Option<Value>,
    delay: Duration,
    failure: Option<String>,
    error: Option<String>,
    hang: bool,
    logs: Option<Vec<(LogType, Value)>>,
    usage: Usage,
}

/// An agent capability that answers from a per-agent script.
///
/// Unscripted agents answer `"<agent_id>-result"`. Every call emits
/// `llm_start` before its delay and `llm_end` after it, unless the script
/// overrides the logs.
#[derive(Default)]
pub struct ScriptedAgent {
    scripts: HashMap<String, Script>,
    calls: Mutex<Vec<(String, Value)>>,
    finished: Mutex<Vec<String>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&mut self, agent_id: &str) -> &mut Script {
        self.scripts.entry(agent_id.to_string()).or_default()
    }

    /// Answer with `output`.
    pub fn respond(mut self, agent_id: &str, output: impl Into<Value>) -> Self {
        self.script(agent_id).output = Some(output.into());
        self
    }

    /// Answer with `output` after sleeping for `delay`.
    pub fn respond_after(
        mut self,
        agent_id: &str,
        output: impl Into<Value>,
        delay: Duration,
    ) -> Self {
        let script = self.script(agent_id);
        script.output = Some(output.into());
        script.delay = delay;
        self
    }

    /// Report a failed outcome.
    pub fn fail(mut self, agent_id: &str, error: &str) -> Self {
        self.script(agent_id).failure = Some(error.to_string());
        self
    }

    /// Fail after sleeping for `delay`.
    pub fn fail_after(mut self, agent_id: &str, error: &str, delay: Duration) -> Self {
        let script = self.script(agent_id);
        script.failure = Some(error.to_string());
        script.delay = delay;
        self
    }

    /// Return `Err` from the capability itself.
    pub fn error(mut self, agent_id: &str, error: &str) -> Self {
        self.script(agent_id).error = Some(error.to_string());
        self
    }

    /// Never finish.
    pub fn hang(mut self, agent_id: &str) -> Self {
        self.script(agent_id).hang = true;
        self
    }

    pub fn with_logs(mut self, agent_id: &str, logs: Vec<(LogType, Value)>) -> Self {
        self.script(agent_id).logs = Some(logs);
        self
    }

    pub fn with_usage(mut self, agent_id: &str, tokens: u64, cost: f64) -> Self {
        self.script(agent_id).usage = Usage { tokens, cost };
        self
    }

    /// Agent ids in the order they were invoked.
    pub fn calls(&self) -> Vec<String> {
        match self.calls.lock() {
            Ok(calls) => calls.iter().map(|(id, _)| id.clone()).collect(),
            Err(_) => vec![],
        }
    }

    /// Inputs received by one agent, in call order.
    pub fn inputs_for(&self, agent_id: &str) -> Vec<Value> {
        match self.calls.lock() {
            Ok(calls) => calls
                .iter()
                .filter(|(id, _)| id == agent_id)
                .map(|(_, input)| input.clone())
                .collect(),
            Err(_) => vec![],
        }
    }

    /// Agent ids whose invocation ran to completion, in completion order.
    pub fn finished(&self) -> Vec<String> {
        match self.finished.lock() {
            Ok(done) => done.clone(),
            Err(_) => vec![],
        }
    }
}

impl AgentExecutor for ScriptedAgent {
    fn execute(&self, request: AgentRequest) -> BoxFuture<'_, Result<AgentOutcome>> {
        Box::pin(async move {
            let agent_id = request.agent.id.clone();
            if let Ok(mut calls) = self.calls.lock() {
                calls.push((agent_id.clone(), request.input.clone()));
            }
            let script = self.scripts.get(&agent_id).cloned().unwrap_or_default();

            // Scripted logs are all emitted up front; the default pair
            // brackets the delay like a real call would
            let (before, after) = match script.logs.clone() {
                Some(logs) => (logs, vec![]),
                None => (
                    vec![(LogType::LlmStart, json!({"agent": agent_id, "input": request.input}))],
                    vec![(LogType::LlmEnd, json!({"agent": agent_id}))],
                ),
            };
            let sink = request.log_sink.clone();
            for (log_type, data) in before {
                sink.record(log_type, data).await?;
            }

            if script.hang {
                futures::future::pending::<()>().await;
            }
            if !script.delay.is_zero() {
                tokio::time::sleep(script.delay).await;
            }
            for (log_type, data) in after {
                sink.record(log_type, data).await?;
            }
            if let Ok(mut done) = self.finished.lock() {
                done.push(agent_id.clone());
            }

            if let Some(error) = script.error {
                return Err(AgentflowError::Llm(error));
            }
            if let Some(failure) = script.failure {
                return Ok(AgentOutcome::failed(failure).with_usage(script.usage));
            }
            let output = script
                .output
                .unwrap_or_else(|| Value::String(format!("{}-result", agent_id)));
            Ok(AgentOutcome::success(output).with_usage(script.usage))
        })
    }
}
