//! HuggingFace text-generation client for instruction-tuned open models

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use super::traits::{CompletionRequest, CompletionResponse, Message, ModelCallError, ModelCallResult, ModelClient};
use crate::config::{HuggingFaceModelConfig, PromptBuilder};
use crate::runner::rate_limiter::RateLimiter;

const HOSTED_API: &str = "https://api-inference.huggingface.co/models";

pub struct HuggingFaceClient {
    id: String,
    token: Option<String>,
    endpoint: String,
    http_client: Client,
    rate_limiter: Arc<RateLimiter>,
    model_name: String,
    prompt_builder: PromptBuilder,
    max_length: u32,
    temperature: f32,
}

impl HuggingFaceClient {
    pub fn new(model_name: impl Into<String>) -> Self {
        let model_name = model_name.into();
        Self {
            id: model_name.clone(),
            token: std::env::var("HF_TOKEN").ok(),
            endpoint: format!("{}/{}", HOSTED_API, model_name),
            http_client: Client::new(),
            rate_limiter: Arc::new(RateLimiter::new(60, 1)),
            model_name,
            prompt_builder: PromptBuilder::Plain,
            max_length: 4096,
            temperature: 0.0,
        }
    }

    /// Build from a `[models.<id>]` entry
    pub fn from_config(id: &str, config: &HuggingFaceModelConfig) -> Self {
        let mut client = Self::new(&config.model_name)
            .with_prompt_builder(config.prompt_builder)
            .with_rate_limits(config.rpm, config.max_concurrent);
        client.id = id.to_string();
        client.max_length = config.max_length;
        client.temperature = config.temperature;
        if let Some(endpoint) = &config.endpoint {
            client.endpoint = endpoint.trim_end_matches('/').to_string();
        }
        if config.quantized {
            tracing::info!(model = %config.model_name, "Expecting a 4-bit quantized deployment");
        }
        client
    }

    pub fn with_prompt_builder(mut self, builder: PromptBuilder) -> Self {
        self.prompt_builder = builder;
        self
    }

    pub fn with_rate_limits(mut self, rpm: u32, max_concurrent: usize) -> Self {
        self.rate_limiter = Arc::new(RateLimiter::new(rpm, max_concurrent));
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// Render a conversation as a single prompt in the model's instruction format
///
/// System messages are merged into one preamble.
pub fn build_prompt(builder: PromptBuilder, messages: &[Message]) -> String {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.is_system())
        .map(|m| m.content.as_str())
        .collect();
    let system = system.join("\n");
    let turns: Vec<&Message> = messages.iter().filter(|m| !m.is_system()).collect();

    match builder {
        PromptBuilder::Llama2 | PromptBuilder::Mistral => {
            let mut prompt = String::from("<s>");
            let mut first_user = true;
            for turn in turns {
                if turn.role == "assistant" {
                    prompt.push_str(&format!(" {} </s><s>", turn.content));
                    continue;
                }
                let content = if first_user && !system.is_empty() {
                    first_user = false;
                    match builder {
                        PromptBuilder::Llama2 => format!("<<SYS>>\n{}\n<</SYS>>\n\n{}", system, turn.content),
                        _ => format!("{}\n\n{}", system, turn.content),
                    }
                } else {
                    first_user = false;
                    turn.content.clone()
                };
                prompt.push_str(&format!("[INST] {} [/INST]", content));
            }
            prompt
        }
        PromptBuilder::Plain => {
            let mut prompt = String::new();
            if !system.is_empty() {
                prompt.push_str(&system);
                prompt.push_str("\n\n");
            }
            for turn in turns {
                prompt.push_str(&turn.content);
                prompt.push('\n');
            }
            prompt
        }
    }
}

#[derive(Serialize)]
struct GenerateRequest {
    inputs: String,
    parameters: GenerateParameters,
}

#[derive(Serialize)]
struct GenerateParameters {
    max_new_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    do_sample: bool,
    return_full_text: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GenerateResponse {
    Many(Vec<Generation>),
    One(Generation),
}

#[derive(Deserialize)]
struct Generation {
    generated_text: String,
    #[serde(default)]
    details: Option<GenerationDetails>,
}

#[derive(Deserialize)]
struct GenerationDetails {
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    generated_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct HfError {
    error: String,
}

#[async_trait]
impl ModelClient for HuggingFaceClient {
    fn name(&self) -> &str {
        "huggingface"
    }

    fn model_id(&self) -> &str {
        &self.id
    }

    async fn complete(&self, request: &CompletionRequest) -> ModelCallResult<CompletionResponse> {
        let _guard = self.rate_limiter.acquire().await;
        let start = Instant::now();

        let temperature = request.temperature.unwrap_or(self.temperature);
        let body = GenerateRequest {
            inputs: build_prompt(self.prompt_builder, &request.messages),
            parameters: GenerateParameters {
                max_new_tokens: request.max_tokens.unwrap_or(self.max_length),
                // greedy decoding rejects a zero temperature
                temperature: (temperature > 0.0).then_some(temperature),
                do_sample: temperature > 0.0,
                return_full_text: false,
            },
        };

        let mut builder = self.http_client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?;
        let latency_ms = start.elapsed().as_millis() as u64;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<HfError>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            // the hosted API answers 503 while the model is loading
            return Err(ModelCallError::from_status(status.as_u16(), message));
        }

        let generation = match response
            .json::<GenerateResponse>()
            .await
            .map_err(|e| ModelCallError::Transient(format!("Unreadable response: {}", e)))?
        {
            GenerateResponse::One(g) => g,
            GenerateResponse::Many(many) => many
                .into_iter()
                .next()
                .ok_or_else(|| ModelCallError::Transient("Empty generation list".to_string()))?,
        };

        let (finish_reason, output_tokens) = match generation.details {
            Some(d) => (d.finish_reason.unwrap_or_else(|| "unknown".to_string()), d.generated_tokens.unwrap_or(0)),
            None => ("unknown".to_string(), 0),
        };

        Ok(CompletionResponse {
            content: generation.generated_text,
            tool_calls: Vec::new(),
            model: self.model_name.clone(),
            input_tokens: 0,
            output_tokens,
            cost_usd: 0.0,
            finish_reason,
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

    fn conversation() -> Vec<Message> {
        vec![
            Message::system("You translate requirements."),
            Message::system("Answer in JSON."),
            Message::user("Traffic from A to B must be allowed."),
        ]
    }

    #[test]
    fn test_llama2_prompt() {
        let prompt = build_prompt(PromptBuilder::Llama2, &conversation());
        assert!(prompt.starts_with("<s>[INST] <<SYS>>\nYou translate requirements.\nAnswer in JSON.\n<</SYS>>"));
        assert!(prompt.ends_with("Traffic from A to B must be allowed. [/INST]"));
    }

    #[test]
    fn test_mistral_prompt_has_no_sys_tags() {
        let prompt = build_prompt(PromptBuilder::Mistral, &conversation());
        assert!(!prompt.contains("<<SYS>>"));
        assert!(prompt.starts_with("<s>[INST] You translate requirements."));
    }

    #[test]
    fn test_plain_prompt() {
        let prompt = build_prompt(PromptBuilder::Plain, &conversation());
        assert_eq!(
            prompt,
            "You translate requirements.\nAnswer in JSON.\n\nTraffic from A to B must be allowed.\n"
        );
    }

    #[test]
    fn test_response_shapes() {
        let many: GenerateResponse = serde_json::from_str(r#"[{"generated_text": "{}"}]"#).unwrap();
        assert!(matches!(many, GenerateResponse::Many(ref g) if g.len() == 1));
        let one: GenerateResponse = serde_json::from_str(r#"{"generated_text": "{}"}"#).unwrap();
        assert!(matches!(one, GenerateResponse::One(_)));
    }
}
