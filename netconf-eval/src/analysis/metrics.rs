//! Aggregate metrics over recorded trials

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::tasks::{TrialOutcome, TrialResult};

/// Outcome counters for a group of trials
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub total: usize,
    pub successes: usize,
    /// Every scored answer that did not match, execution failures included
    pub mismatches: usize,
    /// Candidate programs that crashed, printed garbage or timed out
    pub execution_errors: usize,
    pub timeouts: usize,
    pub parse_failures: usize,
    /// Model calls that failed after retries
    pub infra_failures: usize,
    pub inconclusive: usize,
}

impl OutcomeCounts {
    fn record(&mut self, outcome: TrialOutcome) {
        self.total += 1;
        match outcome {
            TrialOutcome::Success => self.successes += 1,
            TrialOutcome::Mismatch => self.mismatches += 1,
            TrialOutcome::ExecutionError => {
                self.mismatches += 1;
                self.execution_errors += 1;
            }
            TrialOutcome::Timeout => {
                self.mismatches += 1;
                self.execution_errors += 1;
                self.timeouts += 1;
            }
            TrialOutcome::ParseFailure => self.parse_failures += 1,
            TrialOutcome::ModelCallFailed => self.infra_failures += 1,
            TrialOutcome::Inconclusive => self.inconclusive += 1,
        }
    }

    /// Successes over all trials; zero for an empty group
    pub fn accuracy(&self) -> f64 {
        ratio(self.successes, self.total)
    }

    pub fn parse_failure_rate(&self) -> f64 {
        ratio(self.parse_failures, self.total)
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Metrics for one batch size
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchMetrics {
    pub counts: OutcomeCounts,
    pub accuracy: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

/// Summary of a set of trial results
///
/// A pure function of its input: replaying stored results gives the same
/// metrics as the session that recorded them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetrics {
    pub counts: OutcomeCounts,
    pub accuracy: f64,
    pub mean_latency_ms: f64,
    pub parse_failure_rate: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
    /// Keyed by batch size, ascending
    pub by_batch_size: IndexMap<usize, BatchMetrics>,
}

impl AggregateMetrics {
    pub fn from_results(results: &[TrialResult]) -> Self {
        let mut counts = OutcomeCounts::default();
        let mut latency_total = 0u64;
        let mut latency_samples = 0usize;
        let mut input_tokens = 0u64;
        let mut output_tokens = 0u64;
        let mut cost_usd = 0.0;
        let mut by_batch_size: IndexMap<usize, BatchMetrics> = IndexMap::new();

        for result in results {
            counts.record(result.outcome);
            // one sample per response; failed calls have no latency worth averaging
            if result.outcome != TrialOutcome::ModelCallFailed && result.is_first_of_response() {
                latency_total += result.latency_ms;
                latency_samples += 1;
            }
            input_tokens += u64::from(result.input_tokens);
            output_tokens += u64::from(result.output_tokens);
            cost_usd += result.cost_usd;

            let batch = by_batch_size.entry(result.batch_size).or_default();
            batch.counts.record(result.outcome);
            batch.input_tokens += u64::from(result.input_tokens);
            batch.output_tokens += u64::from(result.output_tokens);
            batch.cost_usd += result.cost_usd;
        }

        by_batch_size.sort_keys();
        for batch in by_batch_size.values_mut() {
            batch.accuracy = batch.counts.accuracy();
        }

        Self {
            accuracy: counts.accuracy(),
            parse_failure_rate: counts.parse_failure_rate(),
            mean_latency_ms: if latency_samples == 0 {
                0.0
            } else {
                latency_total as f64 / latency_samples as f64
            },
            counts,
            input_tokens,
            output_tokens,
            cost_usd,
            by_batch_size,
        }
    }

    pub fn total(&self) -> usize {
        self.counts.total
    }
}
