use std::sync::{Arc, Mutex};

use futures::future::try_join_all;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use agentflow_core::error::{AgentflowError, Result};
use agentflow_core::traits::{AgentExecutor, AgentRequest, LogSink};
use agentflow_core::types::{AgentOutcome, AgentStatus, ExecutionId, LogType, Usage};
use agentflow_core::workflow::{AgentDefinition, TERMINAL};

use super::builder::ExecutableGraph;
use super::edge::{evaluate_condition, text_of};
use super::node::{ConditionalStep, Node, ParallelStep, SingleAgentStep};
use super::state::WorkflowState;

/// Result of walking a graph to the end (or to the first failure).
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub state: WorkflowState,
    /// Tokens and cost summed over every agent invocation.
    pub usage: Usage,
    pub cancelled: bool,
}

/// Walks an [`ExecutableGraph`] for one execution.
///
/// Every agent invocation is raced against the cancellation token; when it
/// fires the in-flight invocations are dropped and the walk stops.
pub struct Interpreter {
    executor: Arc<dyn AgentExecutor>,
    log_sink: Arc<dyn LogSink>,
    execution_id: ExecutionId,
    cancel: CancellationToken,
    usage: Mutex<Usage>,
}

impl Interpreter {
    pub fn new(
        executor: Arc<dyn AgentExecutor>,
        log_sink: Arc<dyn LogSink>,
        execution_id: ExecutionId,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            executor,
            log_sink,
            execution_id,
            cancel,
            usage: Mutex::new(Usage::default()),
        }
    }

    /// Run the graph from its entry node until the terminal marker.
    ///
    /// Never fails: a step error stops the walk and is returned in
    /// `state.error` with all progress made so far.
    pub async fn run(&self, graph: &ExecutableGraph, mut state: WorkflowState) -> WorkflowRun {
        let mut current = graph.entry().to_string();
        let mut cancelled = false;

        while current != TERMINAL {
            let node = match graph.node(&current) {
                Some(node) => node,
                None => {
                    state.error = Some(format!("step '{}' not found in graph", current));
                    break;
                }
            };

            if self.cancel.is_cancelled() {
                cancelled = true;
                state.error = Some(AgentflowError::Cancelled.to_string());
                break;
            }

            debug!(
                execution_id = %self.execution_id,
                step = %node.name(),
                kind = ?node.kind(),
                "Entering workflow step"
            );
            self.log(
                LogType::Info,
                json!({
                    "event": "step_started",
                    "step": node.name(),
                    "type": node.kind(),
                }),
            )
            .await;

            let next = match node {
                Node::SingleAgent(step) => self.single_agent(graph, step, &mut state).await,
                Node::Parallel(step) => self.parallel(graph, step, &mut state).await,
                Node::Conditional(step) => Ok(self.conditional(step, &state)),
            };

            match next {
                Ok(next) => current = next,
                Err(AgentflowError::Cancelled) => {
                    info!(
                        execution_id = %self.execution_id,
                        step = %node.name(),
                        "Workflow cancelled"
                    );
                    cancelled = true;
                    state.error = Some(AgentflowError::Cancelled.to_string());
                    break;
                }
                Err(e) => {
                    warn!(
                        execution_id = %self.execution_id,
                        step = %node.name(),
                        error = %e,
                        "Workflow step failed"
                    );
                    self.log(
                        LogType::Error,
                        json!({
                            "step": node.name(),
                            "error": e.to_string(),
                        }),
                    )
                    .await;
                    state.error = Some(e.to_string());
                    break;
                }
            }
        }

        if state.error.is_none() {
            if let Some(key) = graph.output_key() {
                state.final_output = state.step_outputs.get(key).cloned();
            }
        }

        WorkflowRun {
            state,
            usage: self.usage(),
            cancelled,
        }
    }

    async fn single_agent(
        &self,
        graph: &ExecutableGraph,
        step: &SingleAgentStep,
        state: &mut WorkflowState,
    ) -> Result<String> {
        let input = state.resolve_inputs(&step.input_mapping);
        let outcome = self.invoke(&step.agent, input).await?;

        state.capture(&step.output_capture, &outcome.output);
        state
            .messages
            .push(format!("Step {}: {}", step.name, text_of(&outcome.output)));
        state.current_step += 1;

        Ok(self.fall_through(graph, &step.name))
    }

    async fn parallel(
        &self,
        graph: &ExecutableGraph,
        step: &ParallelStep,
        state: &mut WorkflowState,
    ) -> Result<String> {
        let snapshot = Value::Object(state.step_outputs.clone());

        // First failure drops the remaining branches
        let branches = step
            .agents
            .iter()
            .map(|agent| self.invoke(agent, snapshot.clone()));
        let outcomes = try_join_all(branches).await?;

        let results = outcomes.into_iter().map(|o| o.output).collect();
        state
            .step_outputs
            .insert("parallel_results".to_string(), Value::Array(results));
        state.current_step += 1;

        Ok(self.fall_through(graph, &step.name))
    }

    fn conditional(&self, step: &ConditionalStep, state: &WorkflowState) -> String {
        let taken = evaluate_condition(&step.condition, &state.step_outputs);
        debug!(
            execution_id = %self.execution_id,
            step = %step.name,
            field = %step.condition.field,
            taken,
            "Condition evaluated"
        );
        if taken {
            step.true_branch.clone()
        } else {
            step.false_branch.clone()
        }
    }

    fn fall_through(&self, graph: &ExecutableGraph, name: &str) -> String {
        graph.successor(name).unwrap_or(TERMINAL).to_string()
    }

    /// Invoke one agent. A failed outcome becomes an agent execution error.
    async fn invoke(&self, agent: &AgentDefinition, input: Value) -> Result<AgentOutcome> {
        let request = AgentRequest {
            agent: agent.clone(),
            tools: agent.tools.clone(),
            input,
            execution_id: self.execution_id,
            log_sink: self.log_sink.clone(),
        };

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(AgentflowError::Cancelled),
            outcome = self.executor.execute(request) => outcome,
        };

        let outcome = outcome.map_err(|e| match e {
            AgentflowError::AgentExecution { .. } | AgentflowError::Cancelled => e,
            other => AgentflowError::agent(&agent.id, other.to_string()),
        })?;

        if let Ok(mut usage) = self.usage.lock() {
            usage.add(outcome.usage);
        }

        match outcome.status {
            AgentStatus::Success => Ok(outcome),
            AgentStatus::Failed => Err(AgentflowError::agent(
                &agent.id,
                outcome
                    .error
                    .unwrap_or_else(|| "agent reported failure".to_string()),
            )),
        }
    }

    /// Run a single agent outside any workflow.
    pub async fn run_agent(&self, agent: &AgentDefinition, input: Value) -> Result<AgentOutcome> {
        self.invoke(agent, input).await
    }

    pub fn usage(&self) -> Usage {
        self.usage.lock().map(|u| *u).unwrap_or_default()
    }

    async fn log(&self, log_type: LogType, data: Value) {
        if let Err(e) = self.log_sink.record(log_type, data).await {
            warn!(execution_id = %self.execution_id, error = %e, "Failed to record log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use agentflow_core::workflow::{Condition, ConditionOperator, StepConfig, Workflow};
    use agentflow_test_utils::{fixtures, MemoryLogSink, ScriptedAgent};

    use crate::graph::build;

    fn interpreter(agent: Arc<ScriptedAgent>, sink: Arc<MemoryLogSink>) -> Interpreter {
        Interpreter::new(agent, sink, ExecutionId::new(), CancellationToken::new())
    }

    /// `check` jumps to `approve` (last step) or `reject`, which falls
    /// through into `approve`.
    fn branching_workflow() -> Workflow {
        Workflow::new(
            "wf",
            "Branching",
            vec![
                StepConfig::conditional(
                    "check",
                    Condition {
                        field: "x".into(),
                        operator: ConditionOperator::Equals,
                        value: json!("yes"),
                    },
                    "approve",
                    "reject",
                ),
                StepConfig::single_agent("reject", "rejecter")
                    .with_capture(vec!["verdict".into()]),
                StepConfig::single_agent("approve", "approver")
                    .with_capture(vec!["verdict".into()]),
            ],
        )
    }

    #[tokio::test]
    async fn test_linear_pipeline() {
        let agent = Arc::new(ScriptedAgent::new());
        let sink = Arc::new(MemoryLogSink::new());
        let graph = build(
            &fixtures::research_pipeline(),
            &fixtures::agents(&fixtures::PIPELINE_AGENTS),
        )
        .unwrap();

        let run = interpreter(agent.clone(), sink.clone())
            .run(&graph, WorkflowState::seeded(json!({"query": "test"})))
            .await;

        let state = run.state;
        assert!(state.error.is_none());
        assert_eq!(state.current_step, 3);
        assert_eq!(
            state.messages,
            vec![
                "Step research: research-result",
                "Step analyze: analyze-result",
                "Step summarize: summarize-result",
            ]
        );
        assert_eq!(state.step_outputs["research_results"], "research-result");
        assert_eq!(state.step_outputs["analysis"], "analyze-result");
        assert_eq!(state.step_outputs["final_summary"], "summarize-result");
        assert_eq!(agent.calls(), vec!["research", "analyze", "summarize"]);

        // Input mapping fed each step from the previous one
        assert_eq!(agent.inputs_for("research"), vec![json!({"query": "test"})]);
        assert_eq!(agent.inputs_for("analyze"), vec![json!({"data": "research-result"})]);
    }

    #[tokio::test]
    async fn test_step_numbers_increase() {
        let agent = Arc::new(ScriptedAgent::new());
        let sink = Arc::new(MemoryLogSink::new());
        let graph = build(
            &fixtures::research_pipeline(),
            &fixtures::agents(&fixtures::PIPELINE_AGENTS),
        )
        .unwrap();

        interpreter(agent, sink.clone())
            .run(&graph, WorkflowState::seeded(json!({})))
            .await;

        let steps: Vec<u32> = sink.entries().iter().map(|e| e.step_number).collect();
        assert!(steps.windows(2).all(|w| w[0] <= w[1]), "steps: {:?}", steps);
        assert_eq!(steps.first(), Some(&1));
        assert_eq!(sink.of_type(LogType::LlmStart).len(), 3);
    }

    #[tokio::test]
    async fn test_conditional_branches() {
        let graph = build(
            &branching_workflow(),
            &fixtures::agents(&["approver", "rejecter"]),
        )
        .unwrap();

        let cases = [
            ("yes", vec!["approver"]),
            ("no", vec!["rejecter", "approver"]),
        ];
        for (x, expected) in cases {
            let agent = Arc::new(ScriptedAgent::new());
            let run = interpreter(agent.clone(), Arc::new(MemoryLogSink::new()))
                .run(&graph, WorkflowState::seeded(json!({"x": x})))
                .await;
            assert!(run.state.error.is_none());
            assert_eq!(agent.calls(), expected);
            assert_eq!(run.state.current_step as usize, expected.len());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_keeps_declared_order() {
        let agent = Arc::new(
            ScriptedAgent::new()
                .respond_after("slow", "slow-out", Duration::from_millis(300))
                .respond_after("medium", "medium-out", Duration::from_millis(200))
                .respond_after("fast", "fast-out", Duration::from_millis(10)),
        );
        let wf = Workflow::new(
            "wf",
            "Fan",
            vec![StepConfig::parallel(
                "fan",
                vec!["slow".into(), "medium".into(), "fast".into()],
            )],
        );
        let graph = build(&wf, &fixtures::agents(&["slow", "medium", "fast"])).unwrap();

        let run = interpreter(agent.clone(), Arc::new(MemoryLogSink::new()))
            .run(&graph, WorkflowState::seeded(json!({"topic": "rust"})))
            .await;

        assert_eq!(
            run.state.step_outputs["parallel_results"],
            json!(["slow-out", "medium-out", "fast-out"])
        );
        assert_eq!(agent.finished(), vec!["fast", "medium", "slow"]);
        assert_eq!(run.state.current_step, 1);
        assert!(run.state.messages.is_empty());
        for id in ["slow", "medium", "fast"] {
            assert_eq!(agent.inputs_for(id), vec![json!({"topic": "rust"})]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_failure_cancels_siblings() {
        let agent = Arc::new(
            ScriptedAgent::new()
                .respond_after("slow", "never", Duration::from_secs(60))
                .fail_after("broken", "boom", Duration::from_millis(10)),
        );
        let wf = Workflow::new(
            "wf",
            "Fan",
            vec![
                StepConfig::parallel("fan", vec!["slow".into(), "broken".into()]),
                StepConfig::single_agent("after", "after"),
            ],
        );
        let graph = build(&wf, &fixtures::agents(&["slow", "broken", "after"])).unwrap();

        let run = interpreter(agent.clone(), Arc::new(MemoryLogSink::new()))
            .run(&graph, WorkflowState::seeded(json!({})))
            .await;

        let error = run.state.error.unwrap();
        assert!(error.contains("broken"), "error: {}", error);
        assert!(error.contains("boom"));
        assert_eq!(agent.finished(), vec!["broken"]);
        assert!(!run.state.step_outputs.contains_key("parallel_results"));
        assert_eq!(run.state.current_step, 0);

        // The sibling never completes, even after its delay would have elapsed
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(agent.finished(), vec!["broken"]);
    }

    #[tokio::test]
    async fn test_failure_keeps_partial_progress() {
        let agent = Arc::new(ScriptedAgent::new().fail("analyze", "model refused"));
        let sink = Arc::new(MemoryLogSink::new());
        let graph = build(
            &fixtures::research_pipeline(),
            &fixtures::agents(&fixtures::PIPELINE_AGENTS),
        )
        .unwrap();

        let run = interpreter(agent.clone(), sink.clone())
            .run(&graph, WorkflowState::seeded(json!({"query": "test"})))
            .await;

        let state = run.state;
        assert!(state.error.as_deref().unwrap().contains("model refused"));
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.step_outputs["research_results"], "research-result");
        assert!(!state.step_outputs.contains_key("analysis"));
        assert_eq!(agent.calls(), vec!["research", "analyze"]);
        assert_eq!(sink.of_type(LogType::Error).len(), 1);
    }

    #[tokio::test]
    async fn test_capability_error_is_agent_error() {
        let agent = Arc::new(ScriptedAgent::new().error("research", "connection reset"));
        let graph = build(
            &fixtures::research_pipeline(),
            &fixtures::agents(&fixtures::PIPELINE_AGENTS),
        )
        .unwrap();

        let run = interpreter(agent, Arc::new(MemoryLogSink::new()))
            .run(&graph, WorkflowState::seeded(json!({})))
            .await;

        let error = run.state.error.unwrap();
        assert!(error.starts_with("Agent execution failed: research"), "{}", error);
        assert!(!run.cancelled);
    }

    #[tokio::test]
    async fn test_cancel_during_agent() {
        let agent = Arc::new(ScriptedAgent::new().hang("analyze"));
        let graph = build(
            &fixtures::research_pipeline(),
            &fixtures::agents(&fixtures::PIPELINE_AGENTS),
        )
        .unwrap();
        let cancel = CancellationToken::new();
        let interp = Interpreter::new(
            agent.clone(),
            Arc::new(MemoryLogSink::new()),
            ExecutionId::new(),
            cancel.clone(),
        );

        let trip = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let run = interp.run(&graph, WorkflowState::seeded(json!({}))).await;
        trip.await.unwrap();

        assert!(run.cancelled);
        assert_eq!(run.state.error.as_deref(), Some("Execution cancelled"));
        assert_eq!(run.state.current_step, 1);
        assert!(run.state.step_outputs.contains_key("research_results"));
    }

    #[tokio::test]
    async fn test_output_key_and_usage() {
        let agent = Arc::new(
            ScriptedAgent::new()
                .with_usage("research", 100, 0.01)
                .with_usage("summarize", 50, 0.02),
        );
        let mut wf = fixtures::research_pipeline();
        wf.output_key = Some("final_summary".into());
        let graph = build(&wf, &fixtures::agents(&fixtures::PIPELINE_AGENTS)).unwrap();

        let run = interpreter(agent, Arc::new(MemoryLogSink::new()))
            .run(&graph, WorkflowState::seeded(json!({})))
            .await;

        assert_eq!(run.state.final_output, Some(json!("summarize-result")));
        assert_eq!(run.usage.tokens, 150);
        assert!((run.usage.cost - 0.03).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_structured_output_message() {
        let agent = Arc::new(ScriptedAgent::new().respond("research", json!({"hits": 2})));
        let wf = Workflow::new(
            "wf",
            "W",
            vec![StepConfig::single_agent("research", "research")
                .with_capture(vec!["raw".into()])],
        );
        let graph = build(&wf, &fixtures::agents(&["research"])).unwrap();

        let run = interpreter(agent, Arc::new(MemoryLogSink::new()))
            .run(&graph, WorkflowState::seeded(json!({})))
            .await;

        assert_eq!(run.state.messages, vec![r#"Step research: {"hits":2}"#]);
        assert_eq!(run.state.step_outputs["raw"], json!({"hits": 2}));
    }
}
