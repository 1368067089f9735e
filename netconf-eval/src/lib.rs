//! Benchmark harness for LLM network-configuration tasks
//!
//! A model is prompted with natural-language requirements, its raw answer is
//! parsed into formal policies (or code, or device configuration), the parsed
//! answer is checked against ground truth, and per-trial records are
//! aggregated into accuracy metrics per model and experiment.
//!
//! # Pipeline
//!
//! - [`tasks`] builds prompt instances from a requirement dataset
//! - [`runner::Executor`] dispatches them to a [`providers::ModelClient`],
//!   retrying transient failures
//! - [`parser`] turns responses into a [`policy::PolicySet`] or an artifact
//! - [`analysis::EquivalenceChecker`] scores each sub-request
//! - [`reporting`] stores trial records and prints the comparison
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use netconf_eval::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_or_default();
//!     let clients = create_clients(&["gpt-4-turbo".to_string()], &config)?;
//!
//!     let filter = config.benchmark.policy_filter()?;
//!     let dataset = synthetic_requirements(&filter, 6);
//!     let generator = TranslationGenerator::new(dataset, filter, vec![1, 5])?;
//!
//!     let checker = EquivalenceChecker::new(Arc::new(ProcessRunner::python()));
//!     let store = Arc::new(JsonlResultStore::open("results")?);
//!     let executor = Executor::new(ExecutorConfig::default(), checker, store);
//!
//!     let report = executor.run(&generator, &clients, 3).await?;
//!     println!("accuracy: {:.3}", report.metrics.accuracy);
//!     Ok(())
//! }
//! ```

pub mod analysis;
pub mod config;
pub mod parser;
pub mod policy;
pub mod providers;
pub mod reporting;
pub mod runner;
pub mod tasks;

pub use config::Config;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::analysis::{
        AggregateMetrics, AggregatedResults, ComparisonEngine, EquivalenceChecker, Expected, ProcessRunner, Verdict,
    };
    pub use crate::config::Config;
    pub use crate::parser::{parser_for, ParseError, ParsedOutput, RawOutput};
    pub use crate::policy::{Policy, PolicyFilter, PolicySet, PolicyType};
    pub use crate::providers::{
        create_clients, CompletionRequest, CompletionResponse, Message, ModelCallError, ModelClient,
    };
    pub use crate::reporting::{print_console_report, JsonSummary, JsonlResultStore, ResultStore};
    pub use crate::runner::{Executor, ExecutorConfig, SessionReport};
    pub use crate::tasks::{
        synthetic_requirements, Experiment, TaskGenerator, TranslationGenerator, TrialOutcome, TrialResult,
    };
}
