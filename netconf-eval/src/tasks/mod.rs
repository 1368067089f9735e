//! Task definitions, generation and per-request trial records

pub mod categories;
pub mod generators;
pub mod loader;
pub mod prompts;

pub use categories::{Experiment, RagMode};
pub use generators::{
    chunk_list, insert_conflict, pick_sample, CodeGenerator, ConfigGenerator, ConflictGenerator, TaskGenerator,
    TranslationGenerator,
};
pub use loader::{
    load_requirements_from_file, load_requirements_from_string, load_scenarios_from_file, synthetic_requirements,
    ConfigScenario, LoadError, Requirement,
};

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analysis::equivalence::{Expected, MatchOutcome, Verdict, VerdictReason};
use crate::parser::ParseError;
use crate::policy::{PolicyFilter, PolicyKey};
use crate::providers::{CompletionRequest, CompletionResponse, FunctionSchema, Message, ModelCallError};

/// Errors raised while building task instances
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("invalid policy types: {0}")]
    Filter(#[from] crate::policy::FilterError),

    #[error("no requirements of type `{0}` in the dataset")]
    EmptyDataset(String),

    #[error("batch size must be positive")]
    ZeroBatch,
}

/// One request inside a prompt, scored on its own
#[derive(Debug, Clone)]
pub struct SubRequest {
    pub id: String,
    pub expected: Expected,
    /// Policy identities this request asks for; drives batch partitioning
    pub keys: BTreeSet<PolicyKey>,
}

/// A prompt sent to a model, covering one or more sub-requests
#[derive(Debug, Clone)]
pub struct TaskInstance {
    pub id: String,
    pub experiment: Experiment,
    pub run_index: u32,
    pub batch_size: usize,
    pub messages: Vec<Message>,
    pub functions: Vec<FunctionSchema>,
    pub json_mode: bool,
    pub filter: PolicyFilter,
    pub requests: Vec<SubRequest>,
}

impl TaskInstance {
    pub fn completion_request(&self) -> CompletionRequest {
        CompletionRequest::new(self.messages.clone())
            .with_functions(self.functions.clone())
            .with_json_mode(self.json_mode)
    }

    pub fn request_keys(&self) -> Vec<BTreeSet<PolicyKey>> {
        self.requests.iter().map(|r| r.keys.clone()).collect()
    }
}

/// How a single trial ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialOutcome {
    Success,
    Mismatch,
    ParseFailure,
    ExecutionError,
    Timeout,
    ModelCallFailed,
    Inconclusive,
}

impl TrialOutcome {
    pub fn from_verdict(verdict: &Verdict) -> Self {
        match (verdict.outcome, verdict.reason) {
            (MatchOutcome::Match, _) => TrialOutcome::Success,
            (MatchOutcome::Inconclusive, _) => TrialOutcome::Inconclusive,
            (MatchOutcome::Mismatch, Some(VerdictReason::ExecutionError)) => TrialOutcome::ExecutionError,
            (MatchOutcome::Mismatch, Some(VerdictReason::Timeout)) => TrialOutcome::Timeout,
            (MatchOutcome::Mismatch, _) => TrialOutcome::Mismatch,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrialOutcome::Success => "success",
            TrialOutcome::Mismatch => "mismatch",
            TrialOutcome::ParseFailure => "parse_failure",
            TrialOutcome::ExecutionError => "execution_error",
            TrialOutcome::Timeout => "timeout",
            TrialOutcome::ModelCallFailed => "model_call_failed",
            TrialOutcome::Inconclusive => "inconclusive",
        }
    }
}

/// Key identifying a trial: at most one record per key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrialKey {
    pub task_id: String,
    pub model_id: String,
    pub run_index: u32,
}

/// Identity and grouping fields shared by every record of a trial
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialContext {
    pub task_id: String,
    pub model_id: String,
    pub run_index: u32,
    pub experiment: Experiment,
    pub batch_size: usize,
}

/// Outcome of one sub-request for one model and run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub task_id: String,
    pub model_id: String,
    pub run_index: u32,
    pub experiment: Experiment,
    pub batch_size: usize,
    pub outcome: TrialOutcome,
    pub success: bool,
    pub latency_ms: u64,
    pub raw_output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<ParseError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<VerdictReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub attempts: u32,
    /// Position among the records sharing one response
    #[serde(default)]
    pub request_index: u32,
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(default)]
    pub cost_usd: f64,
    pub recorded_at: DateTime<Utc>,
}

impl TrialResult {
    fn base(ctx: TrialContext, outcome: TrialOutcome, attempts: u32) -> Self {
        Self {
            task_id: ctx.task_id,
            model_id: ctx.model_id,
            run_index: ctx.run_index,
            experiment: ctx.experiment,
            batch_size: ctx.batch_size,
            outcome,
            success: outcome == TrialOutcome::Success,
            latency_ms: 0,
            raw_output: String::new(),
            parse_error: None,
            reason: None,
            diff: None,
            warnings: Vec::new(),
            attempts,
            request_index: 0,
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            recorded_at: Utc::now(),
        }
    }

    fn with_response(mut self, response: &CompletionResponse) -> Self {
        self.latency_ms = response.latency_ms;
        self.raw_output = response.raw_output().render();
        self.input_tokens = response.input_tokens;
        self.output_tokens = response.output_tokens;
        self.cost_usd = response.cost_usd;
        self
    }

    /// Keep this record's share of a response answering `count` requests
    ///
    /// Tokens are split evenly with the remainder on the first record, which
    /// also carries the whole cost. Summing the records of one response gives
    /// back its totals.
    pub fn share_of(mut self, index: usize, count: usize) -> Self {
        let count = count.max(1) as u32;
        let first = index == 0;
        let share = |total: u32| total / count + if first { total % count } else { 0 };

        self.request_index = index as u32;
        self.input_tokens = share(self.input_tokens);
        self.output_tokens = share(self.output_tokens);
        if !first {
            self.cost_usd = 0.0;
        }
        self
    }

    /// Whether this record speaks for its response in latency averages
    pub fn is_first_of_response(&self) -> bool {
        self.request_index == 0
    }

    /// A response that was parsed and scored
    pub fn scored(
        ctx: TrialContext,
        verdict: Verdict,
        warnings: Vec<String>,
        response: &CompletionResponse,
        attempts: u32,
    ) -> Self {
        let mut result = Self::base(ctx, TrialOutcome::from_verdict(&verdict), attempts).with_response(response);
        result.reason = verdict.reason;
        result.diff = verdict.diff;
        result.warnings = warnings;
        result
    }

    /// A response the parser rejected
    pub fn parse_failed(ctx: TrialContext, error: ParseError, response: &CompletionResponse, attempts: u32) -> Self {
        let mut result = Self::base(ctx, TrialOutcome::ParseFailure, attempts).with_response(response);
        result.diff = Some(error.to_string());
        result.parse_error = Some(error);
        result
    }

    /// No usable response after the retry budget, or a fatal error
    pub fn model_call_failed(ctx: TrialContext, error: &ModelCallError, attempts: u32) -> Self {
        let mut result = Self::base(ctx, TrialOutcome::ModelCallFailed, attempts);
        result.diff = Some(error.to_string());
        result
    }

    pub fn key(&self) -> TrialKey {
        TrialKey {
            task_id: self.task_id.clone(),
            model_id: self.model_id.clone(),
            run_index: self.run_index,
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TrialContext {
        TrialContext {
            task_id: "translation-b1-c0-r0".to_string(),
            model_id: "gpt-4".to_string(),
            run_index: 2,
            experiment: Experiment::Translation,
            batch_size: 1,
        }
    }

    fn response() -> CompletionResponse {
        CompletionResponse {
            content: "{}".to_string(),
            latency_ms: 120,
            input_tokens: 30,
            output_tokens: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_outcome_from_verdict() {
        assert_eq!(TrialOutcome::from_verdict(&Verdict::matched()), TrialOutcome::Success);
        assert_eq!(TrialOutcome::from_verdict(&Verdict::mismatch("x")), TrialOutcome::Mismatch);
        assert_eq!(TrialOutcome::from_verdict(&Verdict::timeout("x")), TrialOutcome::Timeout);
        assert_eq!(
            TrialOutcome::from_verdict(&Verdict::execution_error("x")),
            TrialOutcome::ExecutionError
        );
        assert_eq!(
            TrialOutcome::from_verdict(&Verdict::inconclusive("x")),
            TrialOutcome::Inconclusive
        );
    }

    #[test]
    fn test_scored_result_carries_response() {
        let result = TrialResult::scored(ctx(), Verdict::matched(), Vec::new(), &response(), 1);
        assert!(result.is_success());
        assert_eq!(result.latency_ms, 120);
        assert_eq!(result.raw_output, "{}");
        assert_eq!(result.key().run_index, 2);
    }

    #[test]
    fn test_parse_failure_keeps_error() {
        let error = ParseError::MalformedOutput("not json".to_string());
        let result = TrialResult::parse_failed(ctx(), error.clone(), &response(), 1);
        assert_eq!(result.outcome, TrialOutcome::ParseFailure);
        assert!(!result.success);
        assert_eq!(result.parse_error, Some(error));
    }

    #[test]
    fn test_batch_records_share_one_response() {
        let mut response = response();
        response.input_tokens = 100;
        response.output_tokens = 8;
        response.cost_usd = 0.25;

        let shares: Vec<TrialResult> = (0..3)
            .map(|i| TrialResult::scored(ctx(), Verdict::matched(), Vec::new(), &response, 1).share_of(i, 3))
            .collect();

        let input: Vec<u32> = shares.iter().map(|r| r.input_tokens).collect();
        assert_eq!(input, vec![34, 33, 33]);
        assert_eq!(shares.iter().map(|r| r.output_tokens).sum::<u32>(), 8);
        assert_eq!(shares.iter().map(|r| r.cost_usd).sum::<f64>(), 0.25);
        assert!(shares[0].is_first_of_response());
        assert_eq!(shares[2].request_index, 2);
        assert!(!shares[2].is_first_of_response());
    }

    #[test]
    fn test_record_serialization() {
        let result = TrialResult::model_call_failed(ctx(), &ModelCallError::Fatal("bad key".to_string()), 1);
        let line = serde_json::to_string(&result).unwrap();
        assert!(line.contains("\"outcome\":\"model_call_failed\""));
        assert!(!line.contains("parse_error"));
        let back: TrialResult = serde_json::from_str(&line).unwrap();
        assert_eq!(back, result);
    }
}
