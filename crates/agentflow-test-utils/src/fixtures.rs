use std::collections::HashMap;

use agentflow_core::workflow::{AgentDefinition, StepConfig, Workflow};

/// A minimal agent definition.
pub fn agent(id: &str) -> AgentDefinition {
    AgentDefinition::new(id, id)
        .with_role(format!("the {} agent", id))
        .with_goal(format!("do the {} step", id))
}

/// Agent lookup table for the given ids.
pub fn agents(ids: &[&str]) -> HashMap<String, AgentDefinition> {
    ids.iter().map(|id| (id.to_string(), agent(id))).collect()
}

/// `research -> analyze -> summarize`, each step capturing one key.
pub fn research_pipeline() -> Workflow {
    Workflow::new(
        "research-pipeline",
        "Research pipeline",
        vec![
            StepConfig::single_agent("research", "research")
                .with_input("query", "query")
                .with_capture(vec!["research_results".into()]),
            StepConfig::single_agent("analyze", "analyze")
                .with_input("data", "research_results")
                .with_capture(vec!["analysis".into()]),
            StepConfig::single_agent("summarize", "summarize")
                .with_input("analysis", "analysis")
                .with_capture(vec!["final_summary".into()]),
        ],
    )
}

/// Agent ids referenced by [`research_pipeline`].
pub const PIPELINE_AGENTS: [&str; 3] = ["research", "analyze", "summarize"];
