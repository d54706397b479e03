pub mod config;
pub mod error;
pub mod traits;
pub mod types;
pub mod workflow;

pub use config::AppConfig;
pub use error::{AgentflowError, Result};
pub use types::*;
pub use workflow::*;
