//! Cross-model comparison of recorded trials

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::metrics::AggregateMetrics;
use crate::tasks::{Experiment, TrialResult};

/// Score of one model within an experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelScore {
    pub model_id: String,
    pub metrics: AggregateMetrics,
}

/// Models ranked by accuracy on one experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub experiment: Experiment,
    pub models_ranked: Vec<String>,
    pub scores_by_model: Vec<ModelScore>,
    pub winner: Option<String>,
    pub margin: Option<f64>,
}

/// Results grouped by (experiment, model) with metrics per pairing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedResults {
    pub total_trials: usize,
    pub comparisons: Vec<ComparisonResult>,
    pub wins_by_model: HashMap<String, u32>,
}

/// Comparison engine ranking models per experiment
#[derive(Debug, Clone, Default)]
pub struct ComparisonEngine;

impl ComparisonEngine {
    pub fn new() -> Self {
        Self
    }

    /// Group results into pairings, ordered by experiment then model id
    pub fn group(&self, results: &[TrialResult]) -> BTreeMap<(Experiment, String), Vec<TrialResult>> {
        let mut groups: BTreeMap<(Experiment, String), Vec<TrialResult>> = BTreeMap::new();
        for result in results {
            groups
                .entry((result.experiment, result.model_id.clone()))
                .or_default()
                .push(result.clone());
        }
        groups
    }

    /// Rank models on one experiment; ties keep model id order
    pub fn compare(&self, experiment: Experiment, scores: Vec<ModelScore>) -> ComparisonResult {
        let mut scores = scores;
        scores.sort_by(|a, b| {
            b.metrics
                .accuracy
                .partial_cmp(&a.metrics.accuracy)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.model_id.cmp(&b.model_id))
        });

        let models_ranked: Vec<String> = scores.iter().map(|s| s.model_id.clone()).collect();
        let winner = scores.first().map(|s| s.model_id.clone());
        let margin = if scores.len() >= 2 {
            Some(scores[0].metrics.accuracy - scores[1].metrics.accuracy)
        } else {
            None
        };

        ComparisonResult {
            experiment,
            models_ranked,
            scores_by_model: scores,
            winner,
            margin,
        }
    }

    pub fn aggregate(&self, results: &[TrialResult]) -> AggregatedResults {
        let mut per_experiment: BTreeMap<Experiment, Vec<ModelScore>> = BTreeMap::new();
        for ((experiment, model_id), trials) in self.group(results) {
            per_experiment.entry(experiment).or_default().push(ModelScore {
                model_id,
                metrics: AggregateMetrics::from_results(&trials),
            });
        }

        let comparisons: Vec<ComparisonResult> = per_experiment
            .into_iter()
            .map(|(experiment, scores)| self.compare(experiment, scores))
            .collect();

        let mut wins: HashMap<String, u32> = HashMap::new();
        for comparison in &comparisons {
            if let Some(winner) = &comparison.winner {
                *wins.entry(winner.clone()).or_insert(0) += 1;
            }
        }

        AggregatedResults {
            total_trials: results.len(),
            comparisons,
            wins_by_model: wins,
        }
    }
}
