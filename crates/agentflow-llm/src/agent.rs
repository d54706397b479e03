use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use agentflow_core::config::ModelConfig;
use agentflow_core::error::{AgentflowError, Result};
use agentflow_core::traits::{AgentExecutor, AgentRequest};
use agentflow_core::types::{AgentOutcome, LogType, Usage};
use agentflow_core::workflow::AgentDefinition;

use crate::retry::{calculate_backoff, is_retryable};

/// Agent capability backed by an OpenAI-compatible chat completions API.
/// Works with OpenRouter, OpenAI, Ollama, vLLM, Groq, etc.
pub struct OpenAiAgent {
    http: Client,
    config: ModelConfig,
}

impl OpenAiAgent {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn request_for(&self, agent: &AgentDefinition, input: &Value) -> ChatRequest {
        ChatRequest {
            model: agent
                .model_id
                .clone()
                .unwrap_or_else(|| self.config.model_id.clone()),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt(agent),
                },
                ChatMessage {
                    role: "user",
                    content: user_message(input),
                },
            ],
            max_tokens: agent.max_tokens.unwrap_or(self.config.max_tokens),
            temperature: agent.temperature.unwrap_or(self.config.temperature),
        }
    }

    async fn send_once(&self, body: &ChatRequest) -> Result<ChatResponse> {
        let mut req = self.http.post(self.endpoint()).json(body);
        if let Some(api_key) = &self.config.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| AgentflowError::Llm(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(AgentflowError::Llm(format!("HTTP {}: {}", status, body)));
        }

        response
            .json::<ChatResponse>()
            .await
            .map_err(|e| AgentflowError::Llm(format!("invalid response: {}", e)))
    }

    /// Send with retries on rate limits and server errors.
    async fn send(&self, body: &ChatRequest) -> Result<ChatResponse> {
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            match self.send_once(body).await {
                Ok(response) => return Ok(response),
                Err(e) if is_retryable(&e) && attempt < retry.max_retries => {
                    let backoff = calculate_backoff(attempt, retry);
                    warn!(
                        attempt = attempt + 1,
                        max_retries = retry.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Retrying LLM request"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn usage_of(&self, response: &ChatResponse) -> Usage {
        let tokens = response.usage.as_ref().map(|u| u.total()).unwrap_or(0);
        Usage {
            tokens,
            cost: tokens as f64 / 1000.0 * self.config.cost_per_1k_tokens,
        }
    }
}

/// Persona prompt built from the agent's role, goal and instructions.
pub fn system_prompt(agent: &AgentDefinition) -> String {
    let mut prompt = format!("You are {}.\n\nYour goal: {}\n\n", agent.role, agent.goal);
    if let Some(instructions) = agent.instructions.as_deref().filter(|s| !s.is_empty()) {
        prompt.push_str(instructions);
        prompt.push_str("\n\n");
    }
    if !agent.tools.is_empty() {
        prompt.push_str(&format!("Available tools: {}\n\n", agent.tools.join(", ")));
    }
    prompt.push_str("Think step-by-step and explain your reasoning.");
    prompt
}

/// `input.query` when it is a string, otherwise the whole input as JSON.
pub fn user_message(input: &Value) -> String {
    match input {
        Value::String(s) => s.clone(),
        Value::Object(map) => match map.get("query") {
            Some(Value::String(query)) => query.clone(),
            _ => input.to_string(),
        },
        other => other.to_string(),
    }
}

impl AgentExecutor for OpenAiAgent {
    fn execute(&self, request: AgentRequest) -> BoxFuture<'_, Result<AgentOutcome>> {
        Box::pin(async move {
            let body = self.request_for(&request.agent, &request.input);
            let sink = request.log_sink.clone();
            let prompts: Vec<&str> = body.messages.iter().map(|m| m.content.as_str()).collect();

            sink.record(
                LogType::LlmStart,
                json!({
                    "agent": request.agent.id,
                    "model": body.model,
                    "prompts": prompts,
                    "tools": request.tools,
                }),
            )
            .await?;

            let response = match self.send(&body).await {
                Ok(response) => response,
                Err(e) => {
                    sink.record(LogType::Error, json!({"error": e.to_string()}))
                        .await?;
                    return Ok(AgentOutcome::failed(e.to_string()));
                }
            };

            let usage = self.usage_of(&response);
            let choice = response.choices.into_iter().next();
            let finish_reason = choice.as_ref().and_then(|c| c.finish_reason.clone());
            let content = choice.and_then(|c| c.message.content).unwrap_or_default();
            debug!(
                execution_id = %request.execution_id,
                agent = %request.agent.id,
                tokens = usage.tokens,
                "LLM call finished"
            );

            sink.record(
                LogType::LlmEnd,
                json!({
                    "output": content,
                    "finish_reason": finish_reason,
                    "tokens": usage.tokens,
                }),
            )
            .await?;

            Ok(AgentOutcome::success(content).with_usage(usage))
        })
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ResponseUsage>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ResponseUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

impl ResponseUsage {
    fn total(&self) -> u64 {
        if self.total_tokens > 0 {
            self.total_tokens
        } else {
            self.prompt_tokens + self.completion_tokens
        }
    }
}
