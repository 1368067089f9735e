//! OpenAI chat completions client with tool calling

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use super::traits::{CompletionRequest, CompletionResponse, Message, ModelCallError, ModelCallResult, ModelClient};
use crate::config::{OpenAiModelConfig, Pricing};
use crate::parser::FunctionCall;
use crate::runner::rate_limiter::RateLimiter;

/// OpenAI API client
pub struct OpenAiClient {
    id: String,
    api_key: String,
    base_url: String,
    http_client: Client,
    rate_limiter: Arc<RateLimiter>,
    model_name: String,
    temperature: f32,
    max_tokens: u32,
    seed: Option<u64>,
    response_format: Option<String>,
    native_function_calling: bool,
    pricing: Option<Pricing>,
}

impl OpenAiClient {
    pub fn new(api_key: String, model_name: impl Into<String>) -> Self {
        let model_name = model_name.into();
        Self {
            id: model_name.clone(),
            api_key,
            base_url: "https://api.openai.com/v1".to_string(),
            http_client: Client::new(),
            rate_limiter: Arc::new(RateLimiter::new(500, 8)),
            model_name,
            temperature: 0.0,
            max_tokens: 4096,
            seed: None,
            response_format: None,
            native_function_calling: false,
            pricing: None,
        }
    }

    /// Create from the `OPENAI_API_KEY` environment variable
    pub fn from_env(model_name: impl Into<String>) -> ModelCallResult<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ModelCallError::Fatal("OPENAI_API_KEY not set".to_string()))?;
        Ok(Self::new(api_key, model_name))
    }

    /// Build from a `[models.<id>]` entry
    pub fn from_config(id: &str, config: &OpenAiModelConfig) -> ModelCallResult<Self> {
        let mut client = Self::from_env(&config.model_name)?
            .with_id(id)
            .with_base_url(&config.base_url)
            .with_rate_limits(config.rpm, config.max_concurrent)
            .with_token_limit(config.tpm)
            .with_temperature(config.temperature)
            .with_max_tokens(config.max_tokens)
            .with_native_function_calling(config.native_function_calling);
        client.seed = config.seed;
        client.response_format = config.response_format.clone();
        client.pricing = config.pricing;
        Ok(client)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set custom base URL
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set custom rate limits
    pub fn with_rate_limits(mut self, rpm: u32, max_concurrent: usize) -> Self {
        self.rate_limiter = Arc::new(RateLimiter::new(rpm, max_concurrent));
        self
    }

    /// Cap tokens per minute on the current limiter; zero disables the cap
    pub fn with_token_limit(mut self, tpm: u32) -> Self {
        let limiter = RateLimiter::new(self.rate_limiter.requests_per_minute(), self.rate_limiter.max_concurrent());
        self.rate_limiter = Arc::new(limiter.with_token_limit(tpm));
        self
    }

    pub fn with_pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = Some(pricing);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_native_function_calling(mut self, enabled: bool) -> Self {
        self.native_function_calling = enabled;
        self
    }

    fn build_body(&self, request: &CompletionRequest) -> OpenAiRequest {
        let tools: Vec<OpenAiTool> = if self.native_function_calling {
            request
                .functions
                .iter()
                .map(|f| OpenAiTool {
                    kind: "function",
                    function: OpenAiFunction {
                        name: f.name.clone(),
                        description: f.description.clone(),
                        parameters: f.parameters.clone(),
                    },
                })
                .collect()
        } else {
            Vec::new()
        };

        let response_format = match &self.response_format {
            Some(format) if request.json_mode && tools.is_empty() => Some(ResponseFormat { kind: format.clone() }),
            _ => None,
        };

        OpenAiRequest {
            model: self.model_name.clone(),
            messages: request.messages.iter().map(OpenAiMessage::from).collect(),
            max_tokens: request.max_tokens.unwrap_or(self.max_tokens),
            temperature: request.temperature.unwrap_or(self.temperature),
            seed: self.seed,
            response_format,
            tools,
        }
    }
}

#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAiTool>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: OpenAiFunction,
}

#[derive(Serialize)]
struct OpenAiFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Serialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

impl From<&Message> for OpenAiMessage {
    fn from(msg: &Message) -> Self {
        Self {
            role: msg.role.clone(),
            content: msg.content.clone(),
        }
    }
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<Choice>,
    model: String,
    usage: OpenAiUsage,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize)]
struct ToolCall {
    function: ToolCallFunction,
}

#[derive(Deserialize)]
struct ToolCallFunction {
    name: String,
    /// JSON-encoded argument object
    arguments: String,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct OpenAiError {
    error: OpenAiErrorDetail,
}

#[derive(Deserialize)]
struct OpenAiErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
}

#[async_trait]
impl ModelClient for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    fn model_id(&self) -> &str {
        &self.id
    }

    fn supports_native_function_calling(&self) -> bool {
        self.native_function_calling
    }

    async fn complete(&self, request: &CompletionRequest) -> ModelCallResult<CompletionResponse> {
        let _guard = self.rate_limiter.acquire().await;

        let start = Instant::now();
        let body = self.build_body(request);

        let response = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let latency_ms = start.elapsed().as_millis() as u64;
        let status = response.status();

        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(60)
                * 1000;

            // 429 covers both rate limiting and an exhausted quota; only the
            // former clears by waiting
            let body = response.text().await.unwrap_or_default();
            if let Ok(error) = serde_json::from_str::<OpenAiError>(&body) {
                let error_type = error.error.error_type.as_deref().unwrap_or("");
                if error_type == "insufficient_quota" || error.error.message.contains("exceeded your current quota") {
                    return Err(ModelCallError::Fatal(format!(
                        "OpenAI quota exceeded: {}",
                        error.error.message
                    )));
                }
                tracing::debug!("Rate limited (type={}): {}", error_type, error.error.message);
            }

            return Err(ModelCallError::RateLimited {
                retry_after_ms: retry_after,
            });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = match serde_json::from_str::<OpenAiError>(&body) {
                Ok(error) => error.error.message,
                Err(_) => body,
            };
            return Err(ModelCallError::from_status(status.as_u16(), message));
        }

        let api_response: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| ModelCallError::Transient(format!("Unreadable response: {}", e)))?;

        self.rate_limiter
            .record_tokens(api_response.usage.prompt_tokens + api_response.usage.completion_tokens)
            .await;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ModelCallError::Transient("No choices in response".to_string()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| FunctionCall::new(call.function.name, serde_json::Value::String(call.function.arguments)))
            .collect();

        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
            model: api_response.model,
            input_tokens: api_response.usage.prompt_tokens,
            output_tokens: api_response.usage.completion_tokens,
            cost_usd: self
                .pricing
                .map(|p| p.cost(api_response.usage.prompt_tokens, api_response.usage.completion_tokens))
                .unwrap_or(0.0),
            finish_reason: choice.finish_reason.unwrap_or_else(|| "unknown".to_string()),
            latency_ms,
        })
    }

    fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::FunctionSchema;

    fn request() -> CompletionRequest {
        CompletionRequest::new(vec![Message::system("setup"), Message::user("translate")])
            .with_functions(vec![FunctionSchema {
                name: "add_reachability".to_string(),
                description: "Add a reachability policy".to_string(),
                parameters: serde_json::json!({"type": "object"}),
            }])
            .with_json_mode(true)
    }

    #[test]
    fn test_tools_only_with_native_calling() {
        let mut client = OpenAiClient::new("key".to_string(), "gpt-4").with_seed(5000);
        client.response_format = Some("json_object".to_string());

        let body = serde_json::to_value(client.build_body(&request())).unwrap();
        assert!(body.get("tools").is_none());
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["seed"], 5000);

        let client = client.with_native_function_calling(true);
        let body = serde_json::to_value(client.build_body(&request())).unwrap();
        assert_eq!(body["tools"][0]["function"]["name"], "add_reachability");
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn test_tool_call_decoding() {
        let raw = r#"{
            "model": "gpt-4",
            "usage": {"prompt_tokens": 10, "completion_tokens": 5},
            "choices": [{"finish_reason": "tool_calls", "message": {"content": null, "tool_calls": [
                {"id": "1", "type": "function", "function": {"name": "add_waypoint", "arguments": "{\"source\": \"A\"}"}}
            ]}}]
        }"#;
        let response: OpenAiResponse = serde_json::from_str(raw).unwrap();
        let message = &response.choices[0].message;
        assert!(message.content.is_none());
        let calls = message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "add_waypoint");
    }
}
