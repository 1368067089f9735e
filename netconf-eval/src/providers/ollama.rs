//! Ollama chat client for locally served models

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use super::traits::{CompletionRequest, CompletionResponse, Message, ModelCallError, ModelCallResult, ModelClient};
use crate::config::OllamaModelConfig;
use crate::runner::rate_limiter::RateLimiter;

pub struct OllamaClient {
    id: String,
    base_url: String,
    http_client: Client,
    rate_limiter: Arc<RateLimiter>,
    model_name: String,
    seed: Option<u64>,
    temperature: f32,
    json_mode: bool,
}

impl OllamaClient {
    pub fn new(model_name: impl Into<String>) -> Self {
        let model_name = model_name.into();
        Self {
            id: model_name.clone(),
            base_url: "http://localhost:11434".to_string(),
            http_client: Client::new(),
            rate_limiter: Arc::new(RateLimiter::new(0, 1)),
            model_name,
            seed: None,
            temperature: 0.0,
            json_mode: true,
        }
    }

    pub fn from_config(id: &str, config: &OllamaModelConfig) -> Self {
        let mut client = Self::new(&config.model_name)
            .with_base_url(&config.base_url)
            .with_rate_limits(config.rpm, config.max_concurrent);
        client.rate_limiter = Arc::new(
            RateLimiter::new(config.rpm, config.max_concurrent).with_token_limit(config.tpm),
        );
        client.id = id.to_string();
        client.seed = config.seed;
        client.temperature = config.temperature;
        client.json_mode = config.json_mode;
        client
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_rate_limits(mut self, rpm: u32, max_concurrent: usize) -> Self {
        self.rate_limiter = Arc::new(RateLimiter::new(rpm, max_concurrent));
        self
    }

    fn build_body<'a>(&'a self, request: &'a CompletionRequest) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model_name,
            messages: merge_system_messages(&request.messages),
            stream: false,
            format: (self.json_mode && request.json_mode).then_some("json"),
            options: ChatOptions {
                seed: self.seed,
                temperature: request.temperature.unwrap_or(self.temperature),
                num_predict: request.max_tokens,
            },
        }
    }
}

/// Local models follow one leading system prompt better than several
fn merge_system_messages(messages: &[Message]) -> Vec<Message> {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.is_system())
        .map(|m| m.content.as_str())
        .collect();
    let mut merged = Vec::with_capacity(messages.len());
    if !system.is_empty() {
        merged.push(Message::system(system.join("\n")));
    }
    merged.extend(messages.iter().filter(|m| !m.is_system()).cloned());
    merged
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'static str>,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    model: String,
    message: Message,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: u32,
    #[serde(default)]
    eval_count: u32,
}

#[derive(Deserialize)]
struct OllamaError {
    error: String,
}

#[async_trait]
impl ModelClient for OllamaClient {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model_id(&self) -> &str {
        &self.id
    }

    async fn complete(&self, request: &CompletionRequest) -> ModelCallResult<CompletionResponse> {
        let _guard = self.rate_limiter.acquire().await;
        let start = Instant::now();

        let response = self
            .http_client
            .post(format!("{}/api/chat", self.base_url))
            .json(&self.build_body(request))
            .send()
            .await?;

        let latency_ms = start.elapsed().as_millis() as u64;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<OllamaError>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            // an unpulled model is a 404 and will not appear by retrying
            return Err(ModelCallError::from_status(status.as_u16(), message));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| ModelCallError::Transient(format!("Unreadable response: {}", e)))?;

        self.rate_limiter
            .record_tokens(chat.prompt_eval_count + chat.eval_count)
            .await;

        Ok(CompletionResponse {
            content: chat.message.content,
            tool_calls: Vec::new(),
            model: chat.model,
            input_tokens: chat.prompt_eval_count,
            output_tokens: chat.eval_count,
            cost_usd: 0.0,
            finish_reason: chat.done_reason.unwrap_or_else(|| "stop".to_string()),
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

    #[test]
    fn test_body_merges_system_prompts() {
        let mut client = OllamaClient::new("llama3");
        client.seed = Some(5000);
        let request = CompletionRequest::new(vec![
            Message::system("setup"),
            Message::system("functions"),
            Message::user("translate"),
        ])
        .with_json_mode(true);

        let body = serde_json::to_value(client.build_body(&request)).unwrap();
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
        assert_eq!(body["messages"][0]["content"], "setup\nfunctions");
        assert_eq!(body["format"], "json");
        assert_eq!(body["options"]["seed"], 5000);
        assert_eq!(body["stream"], false);
    }
}
