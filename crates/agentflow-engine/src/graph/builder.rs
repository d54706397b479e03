use std::collections::HashMap;

use tracing::debug;

use agentflow_core::error::{AgentflowError, Result};
use agentflow_core::workflow::{AgentDefinition, StepConfig, StepKind, Workflow, TERMINAL};

use super::edge::Edge;
use super::node::{ConditionalStep, Node, ParallelStep, SingleAgentStep};

/// A validated, ready-to-run workflow graph.
#[derive(Debug, Clone)]
pub struct ExecutableGraph {
    nodes: Vec<Node>,
    positions: HashMap<String, usize>,
    edges: Vec<Edge>,
    output_key: Option<String>,
}

impl ExecutableGraph {
    /// Name of the first declared step.
    pub fn entry(&self) -> &str {
        self.nodes.first().map(Node::name).unwrap_or(TERMINAL)
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.positions.get(name).map(|&i| &self.nodes[i])
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Target of the implicit edge leaving a non-conditional node.
    pub fn successor(&self, name: &str) -> Option<&str> {
        self.edges
            .iter()
            .find(|edge| edge.from == name)
            .map(|edge| edge.to.as_str())
    }

    pub fn output_key(&self) -> Option<&str> {
        self.output_key.as_deref()
    }
}

/// Build an executable graph from a workflow definition.
///
/// Fails with a config error when a step references an unknown agent, has
/// the wrong number of agent references, or a conditional branch targets a
/// step that does not exist or does not come after it.
pub fn build(
    workflow: &Workflow,
    agents: &HashMap<String, AgentDefinition>,
) -> Result<ExecutableGraph> {
    if workflow.steps.is_empty() {
        return Err(config_err(workflow, "workflow has no steps"));
    }

    let mut positions = HashMap::new();
    for (i, step) in workflow.steps.iter().enumerate() {
        if step.name.is_empty() || step.name == TERMINAL {
            return Err(config_err(
                workflow,
                format!("step {} has reserved or empty name '{}'", i, step.name),
            ));
        }
        if positions.insert(step.name.clone(), i).is_some() {
            return Err(config_err(
                workflow,
                format!("duplicate step name '{}'", step.name),
            ));
        }
    }

    let mut nodes = Vec::with_capacity(workflow.steps.len());
    for (i, step) in workflow.steps.iter().enumerate() {
        nodes.push(build_node(workflow, step, i, &positions, agents)?);
    }

    // Conditional nodes branch on their own; everything else falls through
    let last = workflow.steps.len() - 1;
    let edges = workflow
        .steps
        .iter()
        .enumerate()
        .filter(|(_, step)| step.kind != StepKind::Conditional)
        .map(|(i, step)| {
            let to = if i == last {
                TERMINAL
            } else {
                workflow.steps[i + 1].name.as_str()
            };
            Edge::new(&step.name, to)
        })
        .collect::<Vec<_>>();

    debug!(
        workflow_id = %workflow.id,
        nodes = nodes.len(),
        edges = edges.len(),
        "Workflow graph built"
    );

    Ok(ExecutableGraph {
        nodes,
        positions,
        edges,
        output_key: workflow.output_key.clone(),
    })
}

fn build_node(
    workflow: &Workflow,
    step: &StepConfig,
    index: usize,
    positions: &HashMap<String, usize>,
    agents: &HashMap<String, AgentDefinition>,
) -> Result<Node> {
    let lookup = |id: &str| {
        agents.get(id).cloned().ok_or_else(|| {
            config_err(
                workflow,
                format!("step '{}' references unknown agent '{}'", step.name, id),
            )
        })
    };

    match step.kind {
        StepKind::SingleAgent => {
            let refs = step.agent_refs();
            if refs.len() != 1 {
                return Err(config_err(
                    workflow,
                    format!(
                        "single_agent step '{}' needs exactly one agent, got {}",
                        step.name,
                        refs.len()
                    ),
                ));
            }
            Ok(Node::SingleAgent(SingleAgentStep {
                name: step.name.clone(),
                agent: lookup(refs[0])?,
                input_mapping: step.input_mapping.clone(),
                output_capture: step.output_capture.clone(),
            }))
        }
        StepKind::Parallel => {
            let refs = step.agent_refs();
            if refs.is_empty() {
                return Err(config_err(
                    workflow,
                    format!("parallel step '{}' needs at least one agent", step.name),
                ));
            }
            Ok(Node::Parallel(ParallelStep {
                name: step.name.clone(),
                agents: refs.into_iter().map(lookup).collect::<Result<Vec<_>>>()?,
            }))
        }
        StepKind::Conditional => {
            let condition = step.condition.clone().ok_or_else(|| {
                config_err(
                    workflow,
                    format!("conditional step '{}' has no condition", step.name),
                )
            })?;
            let true_branch = branch_target(
                workflow,
                step,
                index,
                "true_branch",
                &step.true_branch,
                positions,
            )?;
            let false_branch = branch_target(
                workflow,
                step,
                index,
                "false_branch",
                &step.false_branch,
                positions,
            )?;
            Ok(Node::Conditional(ConditionalStep {
                name: step.name.clone(),
                condition,
                true_branch,
                false_branch,
            }))
        }
    }
}

fn branch_target(
    workflow: &Workflow,
    step: &StepConfig,
    index: usize,
    label: &str,
    target: &Option<String>,
    positions: &HashMap<String, usize>,
) -> Result<String> {
    let target = target.as_deref().ok_or_else(|| {
        config_err(
            workflow,
            format!("conditional step '{}' is missing {}", step.name, label),
        )
    })?;
    if target == TERMINAL {
        return Ok(target.to_string());
    }
    match positions.get(target) {
        None => Err(config_err(
            workflow,
            format!(
                "conditional step '{}' {} targets unknown step '{}'",
                step.name, label, target
            ),
        )),
        // Back-edges would loop forever
        Some(&pos) if pos <= index => Err(config_err(
            workflow,
            format!(
                "conditional step '{}' {} points back to '{}'",
                step.name, label, target
            ),
        )),
        Some(_) => Ok(target.to_string()),
    }
}

fn config_err(workflow: &Workflow, message: impl std::fmt::Display) -> AgentflowError {
    AgentflowError::Config(format!("workflow '{}': {}", workflow.id, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::workflow::{Condition, ConditionOperator};
    use agentflow_test_utils::fixtures;
    use serde_json::json;

    fn yes_condition() -> Condition {
        Condition {
            field: "x".into(),
            operator: ConditionOperator::Equals,
            value: json!("yes"),
        }
    }

    fn assert_config_err(result: Result<ExecutableGraph>, needle: &str) {
        match result {
            Err(AgentflowError::Config(msg)) => {
                assert!(msg.contains(needle), "unexpected message: {}", msg)
            }
            other => panic!("expected config error, got {:?}", other.map(|g| g.nodes.len())),
        }
    }

    #[test]
    fn test_linear_wiring() {
        let wf = fixtures::research_pipeline();
        let graph = build(&wf, &fixtures::agents(&fixtures::PIPELINE_AGENTS)).unwrap();

        assert_eq!(graph.entry(), "research");
        assert_eq!(graph.successor("research"), Some("analyze"));
        assert_eq!(graph.successor("analyze"), Some("summarize"));
        assert_eq!(graph.successor("summarize"), Some(TERMINAL));
        assert_eq!(graph.nodes().len(), 3);
    }

    #[test]
    fn test_conditional_has_no_implicit_edge() {
        let wf = Workflow::new(
            "wf",
            "Branching",
            vec![
                StepConfig::single_agent("draft", "writer"),
                StepConfig::conditional("check", yes_condition(), "publish", TERMINAL),
                StepConfig::single_agent("publish", "writer"),
            ],
        );
        let graph = build(&wf, &fixtures::agents(&["writer"])).unwrap();

        assert_eq!(graph.successor("draft"), Some("check"));
        assert_eq!(graph.successor("check"), None);
        assert_eq!(graph.successor("publish"), Some(TERMINAL));
        assert_eq!(graph.edges().len(), 2);
    }

    #[test]
    fn test_unknown_agent() {
        let wf = Workflow::new("wf", "W", vec![StepConfig::single_agent("a", "ghost")]);
        assert_config_err(build(&wf, &HashMap::new()), "unknown agent 'ghost'");
    }

    #[test]
    fn test_unknown_parallel_agent() {
        let wf = Workflow::new(
            "wf",
            "W",
            vec![StepConfig::parallel("fan", vec!["a".into(), "ghost".into()])],
        );
        assert_config_err(build(&wf, &fixtures::agents(&["a"])), "unknown agent 'ghost'");
    }

    #[test]
    fn test_cardinality() {
        let mut step = StepConfig::single_agent("a", "x");
        step.agent_ids = vec!["y".into()];
        let wf = Workflow::new("wf", "W", vec![step]);
        assert_config_err(build(&wf, &fixtures::agents(&["x", "y"])), "exactly one agent");

        let wf = Workflow::new("wf", "W", vec![StepConfig::parallel("fan", vec![])]);
        assert_config_err(build(&wf, &HashMap::new()), "at least one agent");
    }

    #[test]
    fn test_missing_branch_target() {
        let wf = Workflow::new(
            "wf",
            "W",
            vec![StepConfig::conditional("check", yes_condition(), "nowhere", TERMINAL)],
        );
        assert_config_err(build(&wf, &HashMap::new()), "unknown step 'nowhere'");
    }

    #[test]
    fn test_back_edge_rejected() {
        let wf = Workflow::new(
            "wf",
            "W",
            vec![
                StepConfig::single_agent("draft", "writer"),
                StepConfig::conditional("check", yes_condition(), TERMINAL, "draft"),
            ],
        );
        assert_config_err(build(&wf, &fixtures::agents(&["writer"])), "points back");

        let self_loop = Workflow::new(
            "wf",
            "W",
            vec![StepConfig::conditional("check", yes_condition(), "check", TERMINAL)],
        );
        assert_config_err(build(&self_loop, &HashMap::new()), "points back");
    }

    #[test]
    fn test_duplicate_and_empty() {
        let wf = Workflow::new(
            "wf",
            "W",
            vec![
                StepConfig::single_agent("a", "writer"),
                StepConfig::single_agent("a", "writer"),
            ],
        );
        assert_config_err(build(&wf, &fixtures::agents(&["writer"])), "duplicate step");

        let empty = Workflow::new("wf", "W", vec![]);
        assert_config_err(build(&empty, &HashMap::new()), "no steps");
    }
}
