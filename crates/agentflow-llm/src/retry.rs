use std::time::Duration;

use agentflow_core::config::RetryConfig;
use agentflow_core::error::AgentflowError;

/// Rate limits, server errors and transport failures are worth another try.
pub fn is_retryable(e: &AgentflowError) -> bool {
    match e {
        AgentflowError::Llm(msg) => {
            msg.starts_with("HTTP 429")
                || msg.starts_with("HTTP 5")
                || msg.contains("timeout")
                || msg.contains("connection")
        }
        _ => false,
    }
}

/// Exponential backoff capped at `max_backoff_ms`, with 0.8x to 1.2x jitter.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}
