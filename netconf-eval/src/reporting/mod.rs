//! Results reporting

pub mod store;

pub use store::{load_dir, JsonlResultStore, MemoryResultStore, ResultStore, StoreError};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::analysis::{AggregateMetrics, AggregatedResults};

/// JSON summary export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonSummary {
    pub run_id: String,
    pub timestamp: String,
    pub total_trials: usize,
    pub model_rankings: Vec<ModelRanking>,
    /// Experiment name to per-model metrics
    pub experiments: BTreeMap<String, BTreeMap<String, AggregateMetrics>>,
    pub results_dir: String,
}

/// Model ranking in summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRanking {
    pub model_id: String,
    pub wins: u32,
    pub mean_accuracy: f64,
}

fn rankings(aggregated: &AggregatedResults) -> Vec<ModelRanking> {
    let mut accuracies: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for comparison in &aggregated.comparisons {
        for score in &comparison.scores_by_model {
            accuracies
                .entry(score.model_id.as_str())
                .or_default()
                .push(score.metrics.accuracy);
        }
    }

    let mut rankings: Vec<ModelRanking> = accuracies
        .into_iter()
        .map(|(model_id, values)| ModelRanking {
            model_id: model_id.to_string(),
            wins: *aggregated.wins_by_model.get(model_id).unwrap_or(&0),
            mean_accuracy: values.iter().sum::<f64>() / values.len() as f64,
        })
        .collect();

    rankings.sort_by(|a, b| {
        b.mean_accuracy
            .partial_cmp(&a.mean_accuracy)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    rankings
}

impl JsonSummary {
    /// Create from aggregated results
    pub fn from_aggregated(
        run_id: impl Into<String>,
        aggregated: &AggregatedResults,
        results_dir: impl Into<String>,
    ) -> Self {
        let experiments = aggregated
            .comparisons
            .iter()
            .map(|comparison| {
                let models = comparison
                    .scores_by_model
                    .iter()
                    .map(|s| (s.model_id.clone(), s.metrics.clone()))
                    .collect();
                (comparison.experiment.as_str().to_string(), models)
            })
            .collect();

        Self {
            run_id: run_id.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            total_trials: aggregated.total_trials,
            model_rankings: rankings(aggregated),
            experiments,
            results_dir: results_dir.into(),
        }
    }

    /// Write to JSON file
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }
}

/// Generate a console report
pub fn print_console_report(aggregated: &AggregatedResults) {
    println!("\n=== NetConfEval Results ===\n");
    println!("Total Trials: {}\n", aggregated.total_trials);

    println!("Model Rankings:");
    println!("{:-<50}", "");
    for (i, ranking) in rankings(aggregated).iter().enumerate() {
        println!(
            "  {}. {} - Mean Accuracy: {:.3}, Wins: {}",
            i + 1,
            ranking.model_id,
            ranking.mean_accuracy,
            ranking.wins
        );
    }

    for comparison in &aggregated.comparisons {
        println!("\n{}:", comparison.experiment);
        println!("{:-<50}", "");
        for score in &comparison.scores_by_model {
            let m = &score.metrics;
            println!(
                "  {}: accuracy {:.3} ({}/{}), mismatches {}, exec errors {}, parse failures {}, \
                 model failures {}, inconclusive {}, mean latency {:.0}ms",
                score.model_id,
                m.accuracy,
                m.counts.successes,
                m.counts.total,
                m.counts.mismatches,
                m.counts.execution_errors,
                m.counts.parse_failures,
                m.counts.infra_failures,
                m.counts.inconclusive,
                m.mean_latency_ms
            );
            for (batch_size, batch) in &m.by_batch_size {
                println!(
                    "    batch {:>3}: {:.3} ({}/{}), tokens {}/{}, cost ${:.4}",
                    batch_size,
                    batch.accuracy,
                    batch.counts.successes,
                    batch.counts.total,
                    batch.input_tokens,
                    batch.output_tokens,
                    batch.cost_usd
                );
            }
        }
        if let (Some(winner), Some(margin)) = (&comparison.winner, comparison.margin) {
            println!("  Leader: {} (+{:.3})", winner, margin);
        }
    }

    println!("\n{:=<50}", "");
}
