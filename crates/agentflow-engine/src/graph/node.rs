use std::collections::BTreeMap;

use agentflow_core::workflow::{AgentDefinition, Condition, StepKind};

/// Runs one agent and captures its output.
#[derive(Debug, Clone)]
pub struct SingleAgentStep {
    pub name: String,
    pub agent: AgentDefinition,
    pub input_mapping: BTreeMap<String, String>,
    pub output_capture: Vec<String>,
}

/// Runs several agents concurrently on the same input.
#[derive(Debug, Clone)]
pub struct ParallelStep {
    pub name: String,
    /// Declared order; results are collected in this order.
    pub agents: Vec<AgentDefinition>,
}

/// Chooses the next step from a condition over `step_outputs`.
#[derive(Debug, Clone)]
pub struct ConditionalStep {
    pub name: String,
    pub condition: Condition,
    pub true_branch: String,
    pub false_branch: String,
}

/// A node in an executable graph.
#[derive(Debug, Clone)]
pub enum Node {
    SingleAgent(SingleAgentStep),
    Parallel(ParallelStep),
    Conditional(ConditionalStep),
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::SingleAgent(step) => &step.name,
            Node::Parallel(step) => &step.name,
            Node::Conditional(step) => &step.name,
        }
    }

    pub fn kind(&self) -> StepKind {
        match self {
            Node::SingleAgent(_) => StepKind::SingleAgent,
            Node::Parallel(_) => StepKind::Parallel,
            Node::Conditional(_) => StepKind::Conditional,
        }
    }
}
