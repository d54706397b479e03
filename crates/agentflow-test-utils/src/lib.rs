//! Mocks and fixtures shared by agentflow tests.

pub mod fixtures;
mod scripted;
mod sink;

pub use scripted::ScriptedAgent;
pub use sink::{MemoryLogSink, RecordedLog};
