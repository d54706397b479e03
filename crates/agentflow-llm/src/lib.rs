pub mod agent;
pub mod retry;

pub use agent::OpenAiAgent;
