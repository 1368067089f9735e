//! Model client implementations

pub mod huggingface;
pub mod ollama;
pub mod openai;
pub mod traits;

pub use huggingface::HuggingFaceClient;
pub use ollama::OllamaClient;
pub use openai::OpenAiClient;
pub use traits::{
    CompletionRequest, CompletionResponse, FunctionSchema, Message, ModelCallError, ModelCallResult,
    ModelClient,
};

use crate::config::{Config, ModelConfig};
use std::sync::Arc;

/// Create the client for one configured model
pub fn build_client(id: &str, config: &ModelConfig) -> ModelCallResult<Arc<dyn ModelClient>> {
    let client: Arc<dyn ModelClient> = match config {
        ModelConfig::OpenAi(c) => Arc::new(OpenAiClient::from_config(id, c)?),
        ModelConfig::HuggingFace(c) => Arc::new(HuggingFaceClient::from_config(id, c)),
        ModelConfig::Ollama(c) => Arc::new(OllamaClient::from_config(id, c)),
    };
    Ok(client)
}

/// Create clients for the named models, in the order given
pub fn create_clients(ids: &[String], config: &Config) -> Result<Vec<Arc<dyn ModelClient>>, String> {
    let mut clients = Vec::with_capacity(ids.len());
    for id in ids {
        let model = config.model(id).map_err(|e| e.to_string())?;
        let client = build_client(id, model).map_err(|e| format!("{}: {}", id, e))?;
        clients.push(client);
    }
    Ok(clients)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_local_clients() {
        let config = Config::default();
        let client = build_client("llama3-8b", config.model("llama3-8b").unwrap()).unwrap();
        assert_eq!(client.name(), "ollama");
        assert_eq!(client.model_id(), "llama3-8b");
        assert!(!client.supports_native_function_calling());

        let client = build_client(
            "mistral-7b-instruct",
            config.model("mistral-7b-instruct").unwrap(),
        )
        .unwrap();
        assert_eq!(client.name(), "huggingface");
    }

    #[test]
    fn test_unknown_model_is_rejected() {
        let config = Config::default();
        let err = create_clients(&["nope".to_string()], &config).err().unwrap();
        assert!(err.contains("nope"));
    }
}
