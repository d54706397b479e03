use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AgentflowError;

/// Unique execution identifier.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ExecutionId {
    type Err = AgentflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| AgentflowError::NotFound(format!("invalid execution id: {}", s)))
    }
}

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal statuses admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = AgentflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(AgentflowError::Database(format!(
                "unknown execution status: {}",
                other
            ))),
        }
    }
}

/// What an execution runs. Exactly one of agent or workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExecutionTarget {
    #[serde(rename = "agent_id")]
    Agent(String),
    #[serde(rename = "workflow_id")]
    Workflow(String),
}

impl ExecutionTarget {
    pub fn id(&self) -> &str {
        match self {
            Self::Agent(id) | Self::Workflow(id) => id,
        }
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Agent(_) => TaskKind::Agent,
            Self::Workflow(_) => TaskKind::Workflow,
        }
    }
}

/// One concrete run of an agent or workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Execution {
    pub id: ExecutionId,
    #[serde(flatten)]
    pub target: ExecutionTarget,
    pub status: ExecutionStatus,
    pub input_data: serde_json::Value,
    #[serde(default)]
    pub output_data: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub total_cost: f64,
    pub executed_by: String,
    /// Number of times a worker has accepted this execution.
    #[serde(default)]
    pub attempt: u32,
}

impl Execution {
    /// A freshly submitted, `pending` execution.
    pub fn pending(
        target: ExecutionTarget,
        input_data: serde_json::Value,
        executed_by: impl Into<String>,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            target,
            status: ExecutionStatus::Pending,
            input_data,
            output_data: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            total_tokens: 0,
            total_cost: 0.0,
            executed_by: executed_by.into(),
            attempt: 0,
        }
    }
}

/// Kind of structured log event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    LlmStart,
    LlmEnd,
    ToolStart,
    ToolEnd,
    Error,
    Info,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LlmStart => "llm_start",
            Self::LlmEnd => "llm_end",
            Self::ToolStart => "tool_start",
            Self::ToolEnd => "tool_end",
            Self::Error => "error",
            Self::Info => "info",
        }
    }

    /// Whether this event starts a new step. Other events share the step
    /// number of the latest opened one.
    pub fn opens_step(&self) -> bool {
        matches!(self, Self::LlmStart | Self::ToolStart | Self::Info)
    }
}

impl FromStr for LogType {
    type Err = AgentflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "llm_start" => Ok(Self::LlmStart),
            "llm_end" => Ok(Self::LlmEnd),
            "tool_start" => Ok(Self::ToolStart),
            "tool_end" => Ok(Self::ToolEnd),
            "error" => Ok(Self::Error),
            "info" => Ok(Self::Info),
            other => Err(AgentflowError::Database(format!("unknown log type: {}", other))),
        }
    }
}

/// A persisted, append-only log event of an execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionLog {
    pub id: Uuid,
    /// Store-assigned insertion sequence; breaks timestamp ties and serves
    /// as the stream cursor.
    pub seq: i64,
    pub execution_id: ExecutionId,
    pub step_number: u32,
    pub log_type: LogType,
    pub log_data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// A log event before the store has stamped it.
///
/// The store assigns `seq`, `step_number` and `timestamp` together, under
/// its write lock, so all three orders agree.
#[derive(Debug, Clone)]
pub struct NewLog {
    pub execution_id: ExecutionId,
    pub log_type: LogType,
    pub log_data: serde_json::Value,
}

/// Values written when an execution reaches a terminal status.
#[derive(Debug, Clone)]
pub struct Completion {
    pub status: ExecutionStatus,
    pub output_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub usage: Usage,
    pub completed_at: DateTime<Utc>,
}

/// Token and cost totals reported by agent invocations.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub cost: f64,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.tokens += other.tokens;
        self.cost += other.cost;
    }
}

/// Filter and paging for execution listings.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionFilter {
    #[serde(default)]
    pub status: Option<ExecutionStatus>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for ExecutionFilter {
    fn default() -> Self {
        Self {
            status: None,
            agent_id: None,
            workflow_id: None,
            page: default_page(),
            page_size: default_page_size(),
        }
    }
}

fn default_page() -> u32 { 1 }
fn default_page_size() -> u32 { 20 }

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPage {
    pub executions: Vec<Execution>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

/// Whether an agent invocation succeeded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Success,
    Failed,
}

/// What the agent execution capability returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub output: serde_json::Value,
    pub status: AgentStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub usage: Usage,
}

impl AgentOutcome {
    pub fn success(output: impl Into<serde_json::Value>) -> Self {
        Self {
            output: output.into(),
            status: AgentStatus::Success,
            error: None,
            usage: Usage::default(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            output: serde_json::Value::Null,
            status: AgentStatus::Failed,
            error: Some(error.into()),
            usage: Usage::default(),
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }
}

/// Kind of task handed to the dispatch layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Agent,
    Workflow,
}

/// Opaque task descriptor. Workers load everything else from the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionTask {
    pub kind: TaskKind,
    pub execution_id: ExecutionId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Success.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_status_parse() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Success,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<ExecutionStatus>().unwrap(), status);
        }
        assert!("done".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn test_execution_target_flattens() {
        let exec = Execution::pending(
            ExecutionTarget::Workflow("wf-1".into()),
            serde_json::json!({"query": "test"}),
            "alice",
        );
        let json = serde_json::to_value(&exec).unwrap();
        assert_eq!(json["workflow_id"], "wf-1");
        assert!(json.get("agent_id").is_none());
        assert_eq!(json["status"], "pending");

        let parsed: Execution = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.target, ExecutionTarget::Workflow("wf-1".into()));
    }

    #[test]
    fn test_log_type_names() {
        let json = serde_json::to_string(&LogType::ToolStart).unwrap();
        assert_eq!(json, "\"tool_start\"");
        assert_eq!("llm_end".parse::<LogType>().unwrap(), LogType::LlmEnd);
    }

    #[test]
    fn test_usage_add() {
        let mut total = Usage::default();
        total.add(Usage { tokens: 10, cost: 0.5 });
        total.add(Usage { tokens: 5, cost: 0.25 });
        assert_eq!(total.tokens, 15);
        assert!((total.cost - 0.75).abs() < f64::EPSILON);
    }
}
