use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentflowError {
    // Workflow definition errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Agent errors
    #[error("Agent execution failed: {agent}: {message}")]
    AgentExecution { agent: String, message: String },

    #[error("LLM request failed: {0}")]
    Llm(String),

    // Lifecycle errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Execution already running: {0}")]
    AlreadyRunning(String),

    #[error("Execution already terminal: {id} ({status})")]
    AlreadyTerminal { id: String, status: String },

    #[error("Stale attempt {attempt} for execution {id}")]
    StaleAttempt { id: String, attempt: u32 },

    #[error("Execution cancelled")]
    Cancelled,

    // Dispatch errors
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgentflowError {
    /// Shorthand for a failed agent invocation.
    pub fn agent(agent: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AgentExecution {
            agent: agent.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentflowError>;
