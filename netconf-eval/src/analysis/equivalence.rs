//! Semantic equivalence between a parsed answer and ground truth
//!
//! Nothing here returns an error: every failure mode of the candidate (wrong
//! policies, crashing code, a hung program, an emulator that will not start)
//! becomes a [`Verdict`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use serde::{Deserialize, Serialize};

use super::code_check::{Battery, CandidateRunner, CaseError};
use super::emulator::{NetworkEmulator, Scenario};
use crate::parser::{CandidateSource, ParsedOutput};
use crate::policy::{LowLevelConfig, Policy, PolicySet, Topology};

pub const DEFAULT_EPSILON: f64 = 1e-3;

/// Slack for rounding in weights that sit exactly on the tolerance boundary
const ROUNDING_SLACK: f64 = 1e-12;

pub(crate) fn within(a: f64, b: f64, epsilon: f64) -> bool {
    (a - b).abs() <= epsilon + ROUNDING_SLACK
}

/// Ground truth for one sub-request
#[derive(Debug, Clone)]
pub enum Expected {
    Policies(PolicySet),
    /// `conflict` tells whether the batch contains contradicting requirements
    Conflict { conflict: bool, policies: PolicySet },
    Code(Arc<Battery>),
    Emulation { topology: Topology, scenarios: Vec<Scenario> },
    ConfigText(LowLevelConfig),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOutcome {
    Match,
    Mismatch,
    Inconclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictReason {
    Mismatch,
    ExecutionError,
    Timeout,
    EmulationSetup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub outcome: MatchOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<VerdictReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

impl Verdict {
    pub fn matched() -> Self {
        Self {
            outcome: MatchOutcome::Match,
            reason: None,
            diff: None,
        }
    }

    pub fn mismatch(diff: impl Into<String>) -> Self {
        Self::failed(VerdictReason::Mismatch, diff)
    }

    pub fn execution_error(detail: impl Into<String>) -> Self {
        Self::failed(VerdictReason::ExecutionError, detail)
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::failed(VerdictReason::Timeout, detail)
    }

    pub fn inconclusive(detail: impl Into<String>) -> Self {
        Self {
            outcome: MatchOutcome::Inconclusive,
            reason: Some(VerdictReason::EmulationSetup),
            diff: Some(detail.into()),
        }
    }

    fn failed(reason: VerdictReason, diff: impl Into<String>) -> Self {
        Self {
            outcome: MatchOutcome::Mismatch,
            reason: Some(reason),
            diff: Some(diff.into()),
        }
    }

    pub fn is_match(&self) -> bool {
        self.outcome == MatchOutcome::Match
    }
}

/// Two policies are equivalent: exact canonical equality, except load
/// balance weights which agree within `epsilon` over the same hop set
pub fn policies_equivalent(a: &Policy, b: &Policy, epsilon: f64) -> bool {
    match (a, b) {
        (
            Policy::LoadBalance {
                source: sa,
                destination: da,
                next_hops: ha,
            },
            Policy::LoadBalance {
                source: sb,
                destination: db,
                next_hops: hb,
            },
        ) => {
            sa == sb
                && da == db
                && ha.len() == hb.len()
                && ha
                    .iter()
                    .all(|(hop, weight)| hb.get(hop).is_some_and(|other| within(*weight, *other, epsilon)))
        }
        _ => a.canonical_cmp(b).is_eq(),
    }
}

/// Missing and unexpected policies, or `None` when the sets are equivalent
pub fn policy_set_diff(expected: &PolicySet, actual: &PolicySet, epsilon: f64) -> Option<String> {
    let expected: Vec<&Policy> = expected.iter().collect();
    let actual: Vec<&Policy> = actual.iter().collect();
    let mut used = vec![false; actual.len()];
    let mut lines = Vec::new();

    for want in &expected {
        let found = actual
            .iter()
            .enumerate()
            .find(|(idx, got)| !used[*idx] && policies_equivalent(want, got, epsilon))
            .map(|(idx, _)| idx);
        match found {
            Some(idx) => used[idx] = true,
            None => lines.push(format!("- missing: {}", want)),
        }
    }
    for (idx, got) in actual.iter().enumerate() {
        if !used[idx] {
            lines.push(format!("+ unexpected: {}", got));
        }
    }

    (!lines.is_empty()).then(|| lines.join("\n"))
}

/// Scores parsed answers against ground truth
#[derive(Clone)]
pub struct EquivalenceChecker {
    epsilon: f64,
    code_timeout: Duration,
    runner: Arc<dyn CandidateRunner>,
    emulator: Option<Arc<dyn NetworkEmulator>>,
    /// Shared by every clone, so parallel trials draw from one pool
    case_slots: Arc<Semaphore>,
}

/// Test cases running at once across all trials
pub const DEFAULT_CASE_CONCURRENCY: usize = 4;

impl EquivalenceChecker {
    pub fn new(runner: Arc<dyn CandidateRunner>) -> Self {
        Self {
            epsilon: DEFAULT_EPSILON,
            code_timeout: Duration::from_secs(10),
            runner,
            emulator: None,
            case_slots: Arc::new(Semaphore::new(DEFAULT_CASE_CONCURRENCY)),
        }
    }

    pub fn with_case_concurrency(mut self, cases: usize) -> Self {
        self.case_slots = Arc::new(Semaphore::new(cases.max(1)));
        self
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_code_timeout(mut self, timeout: Duration) -> Self {
        self.code_timeout = timeout;
        self
    }

    pub fn with_emulator(mut self, emulator: Arc<dyn NetworkEmulator>) -> Self {
        self.emulator = Some(emulator);
        self
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub async fn check(&self, parsed: &ParsedOutput, expected: &Expected) -> Verdict {
        match (parsed, expected) {
            (ParsedOutput::Policies(actual), Expected::Policies(want)) => self.check_policies(actual, want),

            (ParsedOutput::ConflictReport(_), Expected::Conflict { conflict: true, .. }) => Verdict::matched(),
            (ParsedOutput::Policies(_), Expected::Conflict { conflict: true, .. }) => {
                Verdict::mismatch("conflict not detected")
            }
            (ParsedOutput::ConflictReport(reason), Expected::Conflict { conflict: false, .. }) => {
                Verdict::mismatch(format!("reported a conflict that does not exist: {}", reason))
            }
            (ParsedOutput::Policies(actual), Expected::Conflict { conflict: false, policies }) => {
                self.check_policies(actual, policies)
            }

            (ParsedOutput::Code(candidate), Expected::Code(battery)) => self.check_code(candidate, battery).await,

            (ParsedOutput::Config(configs), Expected::Emulation { topology, scenarios }) => {
                self.check_emulation(configs, topology, scenarios).await
            }
            (ParsedOutput::Config(configs), Expected::ConfigText(want)) => {
                let diff = want.text_diff(configs);
                if diff.is_empty() {
                    Verdict::matched()
                } else {
                    Verdict::mismatch(diff.join("\n"))
                }
            }

            (parsed, _) => Verdict::mismatch(format!("answer of the wrong kind: {}", kind_of(parsed))),
        }
    }

    fn check_policies(&self, actual: &PolicySet, expected: &PolicySet) -> Verdict {
        match policy_set_diff(expected, actual, self.epsilon) {
            None => Verdict::matched(),
            Some(diff) => Verdict::mismatch(diff),
        }
    }

    /// Run every battery case in its own task under the code deadline
    ///
    /// At most the configured number of cases run at once; the deadline
    /// starts when a case gets its slot.
    pub async fn check_code(&self, candidate: &CandidateSource, battery: &Battery) -> Verdict {
        if battery.is_empty() {
            return Verdict {
                outcome: MatchOutcome::Inconclusive,
                reason: None,
                diff: Some("empty test battery".to_string()),
            };
        }

        let mut handles = Vec::with_capacity(battery.len());
        for case in &battery.cases {
            let runner = self.runner.clone();
            let candidate = candidate.clone();
            let case = case.clone();
            let deadline = self.code_timeout;
            let slots = self.case_slots.clone();
            handles.push(tokio::spawn(async move {
                let _slot = slots.acquire_owned().await.ok();
                let outcome = tokio::time::timeout(deadline, runner.run_case(&candidate, &case)).await;
                (case, outcome)
            }));
        }

        let mut first_failure: Option<Verdict> = None;
        let mut passed = 0usize;
        let mut pending = handles.into_iter();
        for handle in pending.by_ref() {
            let verdict = match handle.await {
                Ok((case, Ok(Ok(output)))) => {
                    if output.agrees_with(&case.expected, self.epsilon) {
                        passed += 1;
                        continue;
                    }
                    Verdict::mismatch(format!(
                        "{}: expected {}, got {}",
                        case.name,
                        serde_json::to_string(&case.expected).unwrap_or_default(),
                        serde_json::to_string(&output).unwrap_or_default()
                    ))
                }
                Ok((case, Ok(Err(CaseError::Execution(detail))))) => {
                    Verdict::execution_error(format!("{}: {}", case.name, detail))
                }
                Ok((case, Ok(Err(CaseError::InvalidOutput(detail))))) => {
                    Verdict::execution_error(format!("{}: invalid output: {}", case.name, detail))
                }
                Ok((case, Err(_))) => Verdict::timeout(format!(
                    "{}: no answer within {}ms",
                    case.name,
                    self.code_timeout.as_millis()
                )),
                Err(e) => Verdict::execution_error(format!("case task failed: {}", e)),
            };
            first_failure = Some(verdict);
            break;
        }

        // one failure decides the verdict; the rest are cancelled
        let mut cancelled = 0usize;
        for handle in pending {
            handle.abort();
            cancelled += 1;
        }

        match first_failure {
            None => Verdict::matched(),
            Some(mut verdict) => {
                if let Some(diff) = verdict.diff.as_mut() {
                    diff.push_str(&format!(
                        " ({} of {} cases passed, {} not awaited)",
                        passed,
                        battery.len(),
                        cancelled
                    ));
                }
                verdict
            }
        }
    }

    async fn check_emulation(&self, configs: &LowLevelConfig, topology: &Topology, scenarios: &[Scenario]) -> Verdict {
        let Some(emulator) = &self.emulator else {
            return Verdict::inconclusive("no network emulator configured");
        };

        match emulator.evaluate(configs, topology, scenarios).await {
            Ok(results) => {
                let failed: Vec<String> = results
                    .iter()
                    .filter(|r| !r.passed)
                    .map(|r| match &r.detail {
                        Some(detail) => format!("{}: {}", r.scenario, detail),
                        None => r.scenario.clone(),
                    })
                    .collect();
                let missing: Vec<&str> = scenarios
                    .iter()
                    .filter(|s| !results.iter().any(|r| r.scenario == s.name))
                    .map(|s| s.name.as_str())
                    .collect();

                if failed.is_empty() && missing.is_empty() {
                    Verdict::matched()
                } else if failed.is_empty() {
                    Verdict::inconclusive(format!("emulator skipped scenarios: {}", missing.join(", ")))
                } else {
                    Verdict::mismatch(format!("failed scenarios: {}", failed.join("; ")))
                }
            }
            Err(e) => {
                tracing::warn!(emulator = emulator.name(), "Emulation setup failed: {}", e);
                Verdict::inconclusive(e.to_string())
            }
        }
    }
}

fn kind_of(parsed: &ParsedOutput) -> &'static str {
    match parsed {
        ParsedOutput::Policies(_) => "policy set",
        ParsedOutput::ConflictReport(_) => "conflict report",
        ParsedOutput::Code(_) => "code",
        ParsedOutput::Config(_) => "device configuration",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::code_check::{AlgorithmOutput, FnRunner, ProcessRunner, Query, TestCase};
    use crate::analysis::emulator::{EmulationSetupError, ScenarioVerdict};
    use crate::policy::PolicyType;
    use async_trait::async_trait;
    use std::time::Instant;

    fn checker() -> EquivalenceChecker {
        EquivalenceChecker::new(Arc::new(ProcessRunner::new("sh").with_extension(".sh")))
            .with_code_timeout(Duration::from_millis(500))
    }

    fn lb(b: f64, c: f64) -> PolicySet {
        vec![Policy::load_balance("A", "D", [("B", b), ("C", c)])].into()
    }

    #[tokio::test]
    async fn test_policy_sets_match_regardless_of_order() {
        let want: PolicySet = vec![Policy::reachability("A", "B", true), Policy::waypoint("A", "C", "D")].into();
        let got: PolicySet = vec![Policy::waypoint("A", "C", "D"), Policy::reachability("A", "B", true)].into();
        let verdict = checker().check(&ParsedOutput::Policies(got), &Expected::Policies(want)).await;
        assert!(verdict.is_match());
    }

    #[tokio::test]
    async fn test_load_balance_tolerance() {
        let c = checker();
        let close = c.check(&ParsedOutput::Policies(lb(0.501, 0.499)), &Expected::Policies(lb(0.5, 0.5))).await;
        assert!(close.is_match());

        let far = c.check(&ParsedOutput::Policies(lb(0.6, 0.4)), &Expected::Policies(lb(0.5, 0.5))).await;
        assert_eq!(far.outcome, MatchOutcome::Mismatch);
        assert_eq!(far.reason, Some(VerdictReason::Mismatch));
    }

    #[tokio::test]
    async fn test_shortest_path_is_exact() {
        let want: PolicySet = vec![Policy::shortest_path("A", "C", ["A", "B", "C"])].into();
        let got: PolicySet = vec![Policy::shortest_path("A", "C", ["A", "C", "B"])].into();
        let verdict = checker().check(&ParsedOutput::Policies(got), &Expected::Policies(want)).await;
        let diff = verdict.diff.unwrap();
        assert!(diff.contains("- missing: shortest_path(A, C, [A, B, C])"));
        assert!(diff.contains("+ unexpected: shortest_path(A, C, [A, C, B])"));
    }

    #[tokio::test]
    async fn test_conflict_answers() {
        let c = checker();
        let policies: PolicySet = vec![Policy::reachability("A", "B", true)].into();
        let conflicting = Expected::Conflict {
            conflict: true,
            policies: policies.clone(),
        };
        let clean = Expected::Conflict {
            conflict: false,
            policies: policies.clone(),
        };

        assert!(c.check(&ParsedOutput::ConflictReport("A/B".into()), &conflicting).await.is_match());
        assert!(!c.check(&ParsedOutput::Policies(policies.clone()), &conflicting).await.is_match());
        assert!(c.check(&ParsedOutput::Policies(policies), &clean).await.is_match());
        assert!(!c.check(&ParsedOutput::ConflictReport("none".into()), &clean).await.is_match());
    }

    #[tokio::test]
    async fn test_infinite_loop_times_out() {
        let battery = Arc::new(Battery::for_kind(PolicyType::ShortestPath));
        let candidate = CandidateSource {
            language: Some("sh".to_string()),
            source: "while true; do :; done".to_string(),
        };
        let started = Instant::now();
        let verdict = checker().check(&ParsedOutput::Code(candidate), &Expected::Code(battery)).await;
        assert_eq!(verdict.outcome, MatchOutcome::Mismatch);
        assert_eq!(verdict.reason, Some(VerdictReason::Timeout));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_correct_in_process_candidate() {
        let battery = Arc::new(Battery::for_kind(PolicyType::ShortestPath));
        let runner = FnRunner::new(|topology, query| match query {
            Query::ShortestPath { source, destination } => topology
                .unique_shortest_path(source, destination)
                .map(|path| AlgorithmOutput::Path { path })
                .ok_or_else(|| "no unique path".to_string()),
            _ => Err("unsupported".to_string()),
        });
        let verdict = EquivalenceChecker::new(Arc::new(runner))
            .check_code(
                &CandidateSource {
                    language: None,
                    source: String::new(),
                },
                &battery,
            )
            .await;
        assert!(verdict.is_match(), "{:?}", verdict);
    }

    /// Answers after a pause and remembers the highest number of cases in flight
    struct CountingRunner {
        running: std::sync::atomic::AtomicUsize,
        peak: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl CandidateRunner for CountingRunner {
        async fn run_case(&self, _candidate: &CandidateSource, case: &TestCase) -> Result<AlgorithmOutput, CaseError> {
            use std::sync::atomic::Ordering;
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(case.expected.clone())
        }
    }

    #[tokio::test]
    async fn test_case_concurrency_is_bounded() {
        let battery = Battery::for_kind(PolicyType::ShortestPath);
        assert!(battery.len() > 2);
        let runner = Arc::new(CountingRunner {
            running: Default::default(),
            peak: Default::default(),
        });
        let verdict = EquivalenceChecker::new(runner.clone())
            .with_case_concurrency(2)
            .check_code(
                &CandidateSource {
                    language: None,
                    source: String::new(),
                },
                &battery,
            )
            .await;
        assert!(verdict.is_match(), "{:?}", verdict);
        assert!(runner.peak.load(std::sync::atomic::Ordering::SeqCst) <= 2);
    }

    struct BrokenEmulator;

    #[async_trait]
    impl NetworkEmulator for BrokenEmulator {
        fn name(&self) -> &str {
            "broken"
        }

        async fn evaluate(
            &self,
            _configs: &LowLevelConfig,
            _topology: &Topology,
            _scenarios: &[Scenario],
        ) -> Result<Vec<ScenarioVerdict>, EmulationSetupError> {
            Err(EmulationSetupError::Setup("docker daemon not running".to_string()))
        }
    }

    #[tokio::test]
    async fn test_emulation_setup_failure_is_inconclusive() {
        let checker = checker().with_emulator(Arc::new(BrokenEmulator));
        let verdict = checker
            .check(
                &ParsedOutput::Config(LowLevelConfig::new().with_device("r1", "router ospf")),
                &Expected::Emulation {
                    topology: Topology::new(),
                    scenarios: vec![],
                },
            )
            .await;
        assert_eq!(verdict.outcome, MatchOutcome::Inconclusive);
        assert_eq!(verdict.reason, Some(VerdictReason::EmulationSetup));
    }
}
