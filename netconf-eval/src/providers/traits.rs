//! Model client contract shared by every provider adapter

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::parser::{FunctionCall, RawOutput};
use crate::runner::rate_limiter::RateLimiter;

/// A message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn is_system(&self) -> bool {
        self.role == "system"
    }
}

/// JSON-schema description of a function the model may call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Request for a completion from a model
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    /// Falls back to the client's configured limit
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Offered as tools to models with native function calling
    pub functions: Vec<FunctionSchema>,
    /// Ask for a JSON object response where the API supports it
    pub json_mode: bool,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.temperature = Some(temp);
        self
    }

    pub fn with_functions(mut self, functions: Vec<FunctionSchema>) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_json_mode(mut self, json_mode: bool) -> Self {
        self.json_mode = json_mode;
        self
    }

    /// All system messages joined, for APIs taking a single system prompt
    pub fn system_prompt(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .messages
            .iter()
            .filter(|m| m.is_system())
            .map(|m| m.content.as_str())
            .collect();
        (!parts.is_empty()).then(|| parts.join("\n"))
    }
}

/// Response from a model
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionResponse {
    pub content: String,
    pub tool_calls: Vec<FunctionCall>,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Zero for models without configured pricing
    pub cost_usd: f64,
    pub finish_reason: String,
    pub latency_ms: u64,
}

impl CompletionResponse {
    pub fn raw_output(&self) -> RawOutput {
        RawOutput {
            text: self.content.clone(),
            calls: self.tool_calls.clone(),
        }
    }
}

/// Failure of a model call
///
/// Everything except [`ModelCallError::Fatal`] is worth retrying.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelCallError {
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Auth, quota, unknown model or a rejected request
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl ModelCallError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, ModelCallError::Fatal(_))
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            408 => ModelCallError::Timeout { timeout_ms: 0 },
            429 => ModelCallError::RateLimited { retry_after_ms: 1000 },
            500..=599 => ModelCallError::Transient(format!("HTTP {}: {}", status, message)),
            _ => ModelCallError::Fatal(format!("HTTP {}: {}", status, message)),
        }
    }
}

impl From<reqwest::Error> for ModelCallError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ModelCallError::Timeout { timeout_ms: 0 }
        } else if e.is_builder() {
            ModelCallError::Fatal(format!("HTTP error: {}", e))
        } else {
            ModelCallError::Transient(format!("HTTP error: {}", e))
        }
    }
}

pub type ModelCallResult<T> = Result<T, ModelCallError>;

/// Trait for model clients
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Provider name (e.g. "openai", "huggingface", "ollama")
    fn name(&self) -> &str;

    /// Identifier used in result records and file names
    fn model_id(&self) -> &str;

    /// Whether the model returns structured tool calls
    fn supports_native_function_calling(&self) -> bool {
        false
    }

    async fn complete(&self, request: &CompletionRequest) -> ModelCallResult<CompletionResponse>;

    fn rate_limiter(&self) -> &Arc<RateLimiter>;
}
