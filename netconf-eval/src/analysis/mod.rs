//! Scoring of parsed answers and aggregation of trial results

pub mod code_check;
pub mod comparator;
pub mod emulator;
pub mod equivalence;
pub mod metrics;

pub use code_check::{
    AlgorithmOutput, Battery, CandidateRunner, CaseError, FnRunner, ProcessRunner, Query, TestCase,
};
pub use comparator::{AggregatedResults, ComparisonEngine, ComparisonResult, ModelScore};
pub use emulator::{CommandEmulator, EmulationSetupError, NetworkEmulator, Scenario, ScenarioVerdict};
pub use equivalence::{
    policies_equivalent, policy_set_diff, EquivalenceChecker, Expected, MatchOutcome, Verdict, VerdictReason,
};
pub use metrics::{AggregateMetrics, BatchMetrics, OutcomeCounts};
