//! Configuration management for the benchmark harness
//!
//! Loads model definitions and run settings from TOML and provides runtime
//! access. Command-line flags override what is loaded here.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::policy::PolicyFilter;

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
    #[serde(default)]
    pub benchmark: BenchmarkConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
}

/// A model definition, discriminated by its `provider`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ModelConfig {
    #[serde(rename = "openai")]
    OpenAi(OpenAiModelConfig),
    #[serde(rename = "huggingface")]
    HuggingFace(HuggingFaceModelConfig),
    Ollama(OllamaModelConfig),
}

impl ModelConfig {
    pub fn provider(&self) -> &'static str {
        match self {
            ModelConfig::OpenAi(_) => "openai",
            ModelConfig::HuggingFace(_) => "huggingface",
            ModelConfig::Ollama(_) => "ollama",
        }
    }

    pub fn model_name(&self) -> &str {
        match self {
            ModelConfig::OpenAi(c) => &c.model_name,
            ModelConfig::HuggingFace(c) => &c.model_name,
            ModelConfig::Ollama(c) => &c.model_name,
        }
    }

    pub fn native_function_calling(&self) -> bool {
        matches!(self, ModelConfig::OpenAi(c) if c.native_function_calling)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenAiModelConfig {
    pub model_name: String,
    /// `json_object` asks the API for a JSON response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub native_function_calling: bool,
    #[serde(default = "default_rpm")]
    pub rpm: u32,
    /// Tokens per minute; zero disables the cap
    #[serde(default)]
    pub tpm: u32,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_openai_url")]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing: Option<Pricing>,
}

/// USD per thousand tokens
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Pricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl Pricing {
    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (f64::from(input_tokens) * self.input_per_1k + f64::from(output_tokens) * self.output_per_1k) / 1000.0
    }
}

/// Prompt layout for instruction-tuned models behind a raw text endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptBuilder {
    Llama2,
    Mistral,
    #[default]
    Plain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HuggingFaceModelConfig {
    pub model_name: String,
    #[serde(default)]
    pub prompt_builder: PromptBuilder,
    /// Upper bound on generated tokens
    #[serde(default = "default_max_tokens")]
    pub max_length: u32,
    /// Served with 4-bit weights
    #[serde(default)]
    pub quantized: bool,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_rpm")]
    pub rpm: u32,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Text-generation inference endpoint; defaults to the hosted API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OllamaModelConfig {
    pub model_name: String,
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_true")]
    pub json_mode: bool,
    #[serde(default = "default_rpm")]
    pub rpm: u32,
    /// Tokens per minute; zero disables the cap
    #[serde(default)]
    pub tpm: u32,
    #[serde(default = "default_ollama_concurrent")]
    pub max_concurrent: usize,
}

/// Benchmark execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    #[serde(default = "default_n_runs")]
    pub n_runs: u32,
    #[serde(default = "default_batch_sizes")]
    pub batch_sizes: Vec<usize>,
    #[serde(default = "default_policy_types")]
    pub policy_types: Vec<String>,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_parallel_requests")]
    pub parallel_requests: usize,
    #[serde(default = "default_results_dir")]
    pub results_dir: String,
}

/// Scoring settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Tolerance on load-balance weights
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    /// Deadline for one test case of generated code
    #[serde(default = "default_code_timeout_ms")]
    pub code_timeout_ms: u64,
    /// Test cases of generated code running at once
    #[serde(default = "default_code_concurrency")]
    pub code_concurrency: usize,
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default)]
    pub interpreter_args: Vec<String>,
    /// Appended to candidate programs; the Python driver when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_suffix: Option<String>,
    /// Emulator command line; config experiments are inconclusive without one
    #[serde(default)]
    pub emulator_command: Vec<String>,
    #[serde(default = "default_emulator_timeout_ms")]
    pub emulator_timeout_ms: u64,
}

// Default value functions
fn default_true() -> bool { true }
fn default_rpm() -> u32 { 60 }
fn default_max_concurrent() -> usize { 4 }
fn default_ollama_concurrent() -> usize { 1 }
fn default_max_tokens() -> u32 { 4096 }
fn default_openai_url() -> String { "https://api.openai.com/v1".to_string() }
fn default_ollama_url() -> String { "http://localhost:11434".to_string() }
fn default_n_runs() -> u32 { 5 }
fn default_batch_sizes() -> Vec<usize> { vec![1, 2, 5, 10, 20] }
fn default_policy_types() -> Vec<String> {
    vec!["reachability".to_string(), "waypoint".to_string(), "loadbalancing".to_string()]
}
fn default_retry_count() -> u32 { 3 }
fn default_retry_delay_ms() -> u64 { 1000 }
fn default_max_retry_delay_ms() -> u64 { 60_000 }
fn default_timeout_ms() -> u64 { 120_000 }
fn default_parallel_requests() -> usize { 3 }
fn default_results_dir() -> String { "results".to_string() }
fn default_epsilon() -> f64 { 1e-3 }
fn default_code_timeout_ms() -> u64 { 10_000 }
fn default_code_concurrency() -> usize { 4 }
fn default_interpreter() -> String { "python3".to_string() }
fn default_emulator_timeout_ms() -> u64 { 600_000 }

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            n_runs: default_n_runs(),
            batch_sizes: default_batch_sizes(),
            policy_types: default_policy_types(),
            retry_count: default_retry_count(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            timeout_ms: default_timeout_ms(),
            parallel_requests: default_parallel_requests(),
            results_dir: default_results_dir(),
        }
    }
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            epsilon: default_epsilon(),
            code_timeout_ms: default_code_timeout_ms(),
            code_concurrency: default_code_concurrency(),
            interpreter: default_interpreter(),
            interpreter_args: Vec::new(),
            driver_suffix: None,
            emulator_command: Vec::new(),
            emulator_timeout_ms: default_emulator_timeout_ms(),
        }
    }
}

impl BenchmarkConfig {
    pub fn policy_filter(&self) -> Result<PolicyFilter, ConfigError> {
        self.policy_types
            .join(",")
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("policy_types: {}", e)))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl EvaluationConfig {
    pub fn code_timeout(&self) -> Duration {
        Duration::from_millis(self.code_timeout_ms)
    }

    pub fn emulator_timeout(&self) -> Duration {
        Duration::from_millis(self.emulator_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from default config location or return defaults
    pub fn load_or_default() -> Self {
        let config_paths = [
            "config/models.toml",
            "../config/models.toml",
            "netconf-eval/config/models.toml",
        ];

        for path in &config_paths {
            match Self::from_file(path) {
                Ok(config) => {
                    tracing::info!("Loaded configuration from {}", path);
                    return config;
                }
                Err(ConfigError::Io(_)) => {}
                Err(e) => tracing::warn!("Ignoring {}: {}", path, e),
            }
        }

        tracing::info!("Using default configuration");
        Self::default()
    }

    /// Save configuration to a TOML file
    pub fn save_toml<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        fs::write(path, content)
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.benchmark.policy_filter()?;
        if self.benchmark.batch_sizes.is_empty() || self.benchmark.batch_sizes.contains(&0) {
            return Err(ConfigError::Invalid("batch_sizes must be non-empty and positive".to_string()));
        }
        if self.evaluation.epsilon.is_nan() || self.evaluation.epsilon < 0.0 {
            return Err(ConfigError::Invalid("epsilon must be non-negative".to_string()));
        }
        Ok(())
    }

    /// Get a model definition by its id
    pub fn model(&self, id: &str) -> Result<&ModelConfig, ConfigError> {
        self.models
            .get(id)
            .ok_or_else(|| ConfigError::UnknownModel(id.to_string()))
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut models = BTreeMap::new();

        models.insert("gpt-4-turbo".to_string(), ModelConfig::OpenAi(OpenAiModelConfig {
            model_name: "gpt-4-1106-preview".to_string(),
            response_format: Some("json_object".to_string()),
            seed: Some(5000),
            temperature: 0.0,
            max_tokens: default_max_tokens(),
            native_function_calling: false,
            rpm: 500,
            tpm: 0,
            max_concurrent: 8,
            base_url: default_openai_url(),
            pricing: Some(Pricing { input_per_1k: 0.01, output_per_1k: 0.03 }),
        }));
        models.insert("gpt-4-turbo-fc".to_string(), ModelConfig::OpenAi(OpenAiModelConfig {
            model_name: "gpt-4-1106-preview".to_string(),
            response_format: None,
            seed: Some(5000),
            temperature: 0.0,
            max_tokens: default_max_tokens(),
            native_function_calling: true,
            rpm: 500,
            tpm: 0,
            max_concurrent: 8,
            base_url: default_openai_url(),
            pricing: Some(Pricing { input_per_1k: 0.01, output_per_1k: 0.03 }),
        }));
        models.insert("gpt-3.5-turbo".to_string(), ModelConfig::OpenAi(OpenAiModelConfig {
            model_name: "gpt-3.5-turbo-1106".to_string(),
            response_format: Some("json_object".to_string()),
            seed: Some(5000),
            temperature: 0.0,
            max_tokens: default_max_tokens(),
            native_function_calling: false,
            rpm: 500,
            tpm: 0,
            max_concurrent: 8,
            base_url: default_openai_url(),
            pricing: Some(Pricing { input_per_1k: 0.001, output_per_1k: 0.002 }),
        }));
        models.insert("codellama-7b-instruct".to_string(), ModelConfig::HuggingFace(HuggingFaceModelConfig {
            model_name: "codellama/CodeLlama-7b-Instruct-hf".to_string(),
            prompt_builder: PromptBuilder::Llama2,
            max_length: 4096,
            quantized: true,
            temperature: 0.0,
            rpm: default_rpm(),
            max_concurrent: 1,
            endpoint: None,
        }));
        models.insert("mistral-7b-instruct".to_string(), ModelConfig::HuggingFace(HuggingFaceModelConfig {
            model_name: "mistralai/Mistral-7B-Instruct-v0.1".to_string(),
            prompt_builder: PromptBuilder::Mistral,
            max_length: 4096,
            quantized: true,
            temperature: 0.0,
            rpm: default_rpm(),
            max_concurrent: 1,
            endpoint: None,
        }));
        models.insert("llama3-8b".to_string(), ModelConfig::Ollama(OllamaModelConfig {
            model_name: "llama3:8b-instruct-fp16".to_string(),
            base_url: default_ollama_url(),
            seed: Some(5000),
            temperature: 0.0,
            json_mode: true,
            rpm: 0,
            tpm: 0,
            max_concurrent: 1,
        }));

        Self {
            models,
            benchmark: BenchmarkConfig::default(),
            evaluation: EvaluationConfig::default(),
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Invalid(String),
    UnknownModel(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Invalid(e) => write!(f, "Invalid configuration: {}", e),
            ConfigError::UnknownModel(id) => write!(f, "Unknown model: {}", id),
        }
    }
}

impl std::error::Error for ConfigError {}
