use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Step name that ends a workflow run.
pub const TERMINAL: &str = "__end__";

/// An LLM-driven actor with tools.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentDefinition {
    pub id: String,
    pub name: String,
    /// Persona the agent plays ("a market researcher").
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub instructions: Option<String>,
    /// Model override; falls back to `[model]` in the app config.
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Tool names available to this agent.
    #[serde(default)]
    pub tools: Vec<String>,
}

impl AgentDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: String::new(),
            goal: String::new(),
            instructions: None,
            model_id: None,
            temperature: None,
            max_tokens: None,
            tools: vec![],
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = goal.into();
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }
}

/// Step type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    SingleAgent,
    Parallel,
    Conditional,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    Contains,
}

/// Branch condition evaluated against `step_outputs[field]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: serde_json::Value,
}

/// One declared step of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agent_ids: Vec<String>,
    /// step-input key -> state path (dotted paths walk nested objects).
    #[serde(default)]
    pub input_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub output_capture: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub true_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub false_branch: Option<String>,
}

impl StepConfig {
    pub fn single_agent(name: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::SingleAgent,
            agent_id: Some(agent_id.into()),
            agent_ids: vec![],
            input_mapping: BTreeMap::new(),
            output_capture: vec![],
            condition: None,
            true_branch: None,
            false_branch: None,
        }
    }

    pub fn parallel(name: impl Into<String>, agent_ids: Vec<String>) -> Self {
        Self {
            kind: StepKind::Parallel,
            agent_id: None,
            agent_ids,
            ..Self::single_agent(name, "")
        }
    }

    pub fn conditional(
        name: impl Into<String>,
        condition: Condition,
        true_branch: impl Into<String>,
        false_branch: impl Into<String>,
    ) -> Self {
        Self {
            kind: StepKind::Conditional,
            agent_id: None,
            condition: Some(condition),
            true_branch: Some(true_branch.into()),
            false_branch: Some(false_branch.into()),
            ..Self::single_agent(name, "")
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, path: impl Into<String>) -> Self {
        self.input_mapping.insert(key.into(), path.into());
        self
    }

    pub fn with_capture(mut self, keys: Vec<String>) -> Self {
        self.output_capture = keys;
        self
    }

    /// Every agent this step references, in declared order.
    pub fn agent_refs(&self) -> Vec<&str> {
        self.agent_id
            .iter()
            .map(String::as_str)
            .chain(self.agent_ids.iter().map(String::as_str))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    #[default]
    Manual,
    Scheduled,
    Webhook,
}

/// An ordered graph of agent steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub trigger_config: Option<serde_json::Value>,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
    /// `step_outputs` key promoted to the final output on success.
    #[serde(default)]
    pub output_key: Option<String>,
}

impl Workflow {
    pub fn new(id: impl Into<String>, name: impl Into<String>, steps: Vec<StepConfig>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            trigger_type: TriggerType::Manual,
            trigger_config: None,
            steps,
            output_key: None,
        }
    }

    /// Every agent id referenced by any step, deduplicated, in first-use order.
    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for step in &self.steps {
            for id in step.agent_refs() {
                if !ids.iter().any(|known| known == id) {
                    ids.push(id.to_string());
                }
            }
        }
        ids
    }
}
