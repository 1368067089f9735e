//! Execution of generated routing code against synthetic topologies
//!
//! A [`Battery`] is built once per policy kind; its expected outputs come
//! from the reference solver in [`crate::policy::topology`]. A
//! [`CandidateRunner`] executes one case of a candidate program.

use std::collections::BTreeMap;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::parser::CandidateSource;
use crate::policy::{NodeId, PolicyType, Topology};

/// Question put to a candidate algorithm
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "query", rename_all = "snake_case")]
pub enum Query {
    Reachability { source: NodeId, destination: NodeId },
    ShortestPath { source: NodeId, destination: NodeId },
    Waypoint { source: NodeId, destination: NodeId, via: NodeId },
    LoadBalance { source: NodeId, destination: NodeId },
}

/// What a candidate answers for one query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AlgorithmOutput {
    Path { path: Vec<NodeId> },
    Reachable { reachable: bool },
    NextHops { next_hops: BTreeMap<NodeId, f64> },
}

impl AlgorithmOutput {
    /// Compare against an expected output; next-hop weights within `epsilon`
    pub fn agrees_with(&self, expected: &AlgorithmOutput, epsilon: f64) -> bool {
        match (self, expected) {
            (AlgorithmOutput::Path { path: a }, AlgorithmOutput::Path { path: b }) => a == b,
            (AlgorithmOutput::Reachable { reachable: a }, AlgorithmOutput::Reachable { reachable: b }) => a == b,
            (AlgorithmOutput::NextHops { next_hops: a }, AlgorithmOutput::NextHops { next_hops: b }) => {
                let total: f64 = a.values().sum();
                if total <= 0.0 || a.len() != b.len() {
                    return false;
                }
                a.iter().all(|(hop, weight)| {
                    b.get(hop)
                        .is_some_and(|want| super::equivalence::within(weight / total, *want, epsilon))
                })
            }
            _ => false,
        }
    }
}

/// Input handed to the candidate for one case
#[derive(Debug, Clone, Serialize)]
pub struct CaseInput<'a> {
    pub topology: &'a Topology,
    #[serde(flatten)]
    pub query: &'a Query,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub topology: Topology,
    pub query: Query,
    pub expected: AlgorithmOutput,
}

impl TestCase {
    pub fn input(&self) -> CaseInput<'_> {
        CaseInput {
            topology: &self.topology,
            query: &self.query,
        }
    }
}

/// Fixed set of test cases with precomputed answers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Battery {
    pub cases: Vec<TestCase>,
}

fn standard_topologies() -> Vec<(&'static str, Topology)> {
    vec![
        (
            "line",
            Topology::new()
                .with_link("A", "B", 1)
                .with_link("B", "C", 1)
                .with_link("C", "D", 1),
        ),
        (
            "weighted_triangle",
            Topology::new()
                .with_link("A", "B", 1)
                .with_link("B", "C", 1)
                .with_link("A", "C", 5),
        ),
        (
            "diamond",
            Topology::new()
                .with_link("A", "B", 1)
                .with_link("A", "C", 1)
                .with_link("B", "D", 1)
                .with_link("C", "D", 1),
        ),
        (
            "disconnected",
            Topology::new()
                .with_link("A", "B", 1)
                .with_link("C", "D", 1),
        ),
    ]
}

impl Battery {
    /// Cases for the algorithm implementing `kind`
    ///
    /// Path-valued cases are only included where the shortest path is unique,
    /// so every case has exactly one right answer.
    pub fn for_kind(kind: PolicyType) -> Self {
        let mut cases = Vec::new();
        for (name, topology) in standard_topologies() {
            let nodes: Vec<NodeId> = topology.nodes.iter().cloned().collect();
            for source in &nodes {
                for destination in &nodes {
                    if source == destination {
                        continue;
                    }
                    if let Some((query, expected)) = reference_answer(kind, &topology, source, destination, &nodes) {
                        cases.push(TestCase {
                            name: format!("{}:{}->{}", name, source, destination),
                            topology: topology.clone(),
                            query,
                            expected,
                        });
                    }
                }
            }
        }
        Self { cases }
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

fn reference_answer(
    kind: PolicyType,
    topology: &Topology,
    source: &NodeId,
    destination: &NodeId,
    nodes: &[NodeId],
) -> Option<(Query, AlgorithmOutput)> {
    let (source, destination) = (source.clone(), destination.clone());
    match kind {
        PolicyType::Reachability => {
            let reachable = topology.is_reachable(&source, &destination);
            Some((Query::Reachability { source, destination }, AlgorithmOutput::Reachable { reachable }))
        }
        PolicyType::ShortestPath => {
            let path = topology.unique_shortest_path(&source, &destination)?;
            Some((Query::ShortestPath { source, destination }, AlgorithmOutput::Path { path }))
        }
        PolicyType::Waypoint => {
            // first intermediate node with a unique path on both legs
            nodes
                .iter()
                .filter(|via| **via != source && **via != destination)
                .find_map(|via| {
                    let mut path = topology.unique_shortest_path(&source, via)?;
                    let tail = topology.unique_shortest_path(via, &destination)?;
                    path.extend(tail.into_iter().skip(1));
                    Some((
                        Query::Waypoint {
                            source: source.clone(),
                            destination: destination.clone(),
                            via: via.clone(),
                        },
                        AlgorithmOutput::Path { path },
                    ))
                })
        }
        PolicyType::LoadBalance => {
            let next_hops = topology.ecmp_next_hops(&source, &destination);
            if next_hops.is_empty() {
                return None;
            }
            Some((Query::LoadBalance { source, destination }, AlgorithmOutput::NextHops { next_hops }))
        }
    }
}

/// Why one case of a candidate failed to produce an output
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaseError {
    #[error("execution error: {0}")]
    Execution(String),

    #[error("invalid output: {0}")]
    InvalidOutput(String),
}

/// Executes a candidate program on one test case
///
/// Deadlines are enforced by the caller; implementations must release their
/// resources when the returned future is dropped.
#[async_trait]
pub trait CandidateRunner: Send + Sync {
    async fn run_case(&self, candidate: &CandidateSource, case: &TestCase) -> Result<AlgorithmOutput, CaseError>;
}

/// Runs a candidate as a script under an external interpreter
///
/// The candidate plus `driver_suffix` is written to a temporary file; the
/// case goes to stdin as JSON and the last non-empty stdout line is read
/// back as JSON. The child is killed when the run is abandoned.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    interpreter: String,
    args: Vec<String>,
    driver_suffix: String,
    extension: String,
}

/// Glue appended to Python candidates defining `solve(topology, query)`
pub const PYTHON_DRIVER: &str = r#"
if __name__ == "__main__":
    import json as _json, sys as _sys
    _case = _json.load(_sys.stdin)
    print(_json.dumps(solve(_case["topology"], _case)))
"#;

impl ProcessRunner {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
            args: Vec::new(),
            driver_suffix: String::new(),
            extension: ".py".to_string(),
        }
    }

    /// `python3` with the default driver
    pub fn python() -> Self {
        Self::new("python3").with_driver_suffix(PYTHON_DRIVER)
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_driver_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.driver_suffix = suffix.into();
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    fn write_script(&self, candidate: &CandidateSource) -> std::io::Result<tempfile::NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix("netconf-candidate-")
            .suffix(&self.extension)
            .tempfile()?;
        file.write_all(candidate.source.as_bytes())?;
        file.write_all(b"\n")?;
        file.write_all(self.driver_suffix.as_bytes())?;
        file.flush()?;
        Ok(file)
    }
}

#[async_trait]
impl CandidateRunner for ProcessRunner {
    async fn run_case(&self, candidate: &CandidateSource, case: &TestCase) -> Result<AlgorithmOutput, CaseError> {
        let script = self
            .write_script(candidate)
            .map_err(|e| CaseError::Execution(format!("failed to write candidate: {}", e)))?;
        let input = serde_json::to_vec(&case.input()).map_err(|e| CaseError::Execution(e.to_string()))?;

        let mut child = Command::new(&self.interpreter)
            .args(&self.args)
            .arg(script.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CaseError::Execution(format!("failed to start {}: {}", self.interpreter, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // a candidate that ignores stdin may exit before reading it
            let _ = stdin.write_all(&input).await;
            let _ = stdin.shutdown().await;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CaseError::Execution(e.to_string()))?;
        drop(script);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
            return Err(CaseError::Execution(format!(
                "exit status {}: {}",
                output.status.code().unwrap_or(-1),
                last.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| CaseError::InvalidOutput("no output".to_string()))?;
        serde_json::from_str(line.trim()).map_err(|e| CaseError::InvalidOutput(format!("{}: {}", e, line.trim())))
    }
}

pub type CandidateFn = dyn Fn(&Topology, &Query) -> Result<AlgorithmOutput, String> + Send + Sync;

/// Runs an in-process candidate on a dedicated thread, catching panics
///
/// A thread past its deadline cannot be stopped; it is detached and its
/// result discarded.
#[derive(Clone)]
pub struct FnRunner {
    candidate: Arc<CandidateFn>,
}

impl FnRunner {
    pub fn new<F>(candidate: F) -> Self
    where
        F: Fn(&Topology, &Query) -> Result<AlgorithmOutput, String> + Send + Sync + 'static,
    {
        Self {
            candidate: Arc::new(candidate),
        }
    }
}

#[async_trait]
impl CandidateRunner for FnRunner {
    async fn run_case(&self, _candidate: &CandidateSource, case: &TestCase) -> Result<AlgorithmOutput, CaseError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let candidate = self.candidate.clone();
        let topology = case.topology.clone();
        let query = case.query.clone();

        std::thread::Builder::new()
            .name("netconf-candidate".to_string())
            .spawn(move || {
                let result = catch_unwind(AssertUnwindSafe(|| candidate(&topology, &query)));
                let _ = tx.send(result);
            })
            .map_err(|e| CaseError::Execution(format!("failed to spawn thread: {}", e)))?;

        match rx.await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(message))) => Err(CaseError::Execution(message)),
            Ok(Err(_)) => Err(CaseError::Execution("candidate panicked".to_string())),
            Err(_) => Err(CaseError::Execution("candidate thread vanished".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(text: &str) -> CandidateSource {
        CandidateSource {
            language: Some("sh".to_string()),
            source: text.to_string(),
        }
    }

    fn sh_runner() -> ProcessRunner {
        ProcessRunner::new("sh").with_extension(".sh")
    }

    #[test]
    fn test_battery_has_unique_answers() {
        let battery = Battery::for_kind(PolicyType::ShortestPath);
        assert!(!battery.is_empty());
        assert!(battery.cases.iter().all(|c| !c.name.starts_with("diamond:A->D")));
        assert!(battery.cases.iter().any(|c| c.name == "weighted_triangle:A->C"
            && c.expected == AlgorithmOutput::Path { path: vec!["A".into(), "B".into(), "C".into()] }));
    }

    #[test]
    fn test_load_balance_battery_uses_ecmp() {
        let battery = Battery::for_kind(PolicyType::LoadBalance);
        let diamond = battery.cases.iter().find(|c| c.name == "diamond:A->D").unwrap();
        match &diamond.expected {
            AlgorithmOutput::NextHops { next_hops } => {
                assert_eq!(next_hops.len(), 2);
                assert!((next_hops[&NodeId::new("B")] - 0.5).abs() < 1e-9);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_reachability_battery_covers_disconnected() {
        let battery = Battery::for_kind(PolicyType::Reachability);
        let case = battery.cases.iter().find(|c| c.name == "disconnected:A->C").unwrap();
        assert_eq!(case.expected, AlgorithmOutput::Reachable { reachable: false });
    }

    #[test]
    fn test_output_agreement_with_tolerance() {
        let want = AlgorithmOutput::NextHops {
            next_hops: BTreeMap::from([(NodeId::new("B"), 0.5), (NodeId::new("C"), 0.5)]),
        };
        let close = AlgorithmOutput::NextHops {
            next_hops: BTreeMap::from([(NodeId::new("B"), 50.1), (NodeId::new("C"), 49.9)]),
        };
        let far = AlgorithmOutput::NextHops {
            next_hops: BTreeMap::from([(NodeId::new("B"), 0.6), (NodeId::new("C"), 0.4)]),
        };
        assert!(close.agrees_with(&want, 1e-3));
        assert!(!far.agrees_with(&want, 1e-3));
    }

    #[test]
    fn test_output_shapes_decode() {
        let path: AlgorithmOutput = serde_json::from_str(r#"{"path": ["A", "B"]}"#).unwrap();
        assert!(matches!(path, AlgorithmOutput::Path { .. }));
        let reach: AlgorithmOutput = serde_json::from_str(r#"{"reachable": false}"#).unwrap();
        assert_eq!(reach, AlgorithmOutput::Reachable { reachable: false });
    }

    #[tokio::test]
    async fn test_process_runner_reads_stdout() {
        let battery = Battery::for_kind(PolicyType::Reachability);
        let output = sh_runner()
            .run_case(&source("cat > /dev/null\necho '{\"reachable\": true}'"), &battery.cases[0])
            .await
            .unwrap();
        assert_eq!(output, AlgorithmOutput::Reachable { reachable: true });
    }

    #[tokio::test]
    async fn test_process_runner_reports_failures() {
        let battery = Battery::for_kind(PolicyType::Reachability);
        let err = sh_runner()
            .run_case(&source("echo 'Traceback: boom' >&2\nexit 1"), &battery.cases[0])
            .await
            .unwrap_err();
        assert!(matches!(err, CaseError::Execution(ref m) if m.contains("boom")));

        let err = sh_runner()
            .run_case(&source("echo 'not json'"), &battery.cases[0])
            .await
            .unwrap_err();
        assert!(matches!(err, CaseError::InvalidOutput(_)));
    }

    #[tokio::test]
    async fn test_fn_runner_catches_panics() {
        let battery = Battery::for_kind(PolicyType::Reachability);
        let runner = FnRunner::new(|_, _| panic!("index out of range"));
        let err = runner.run_case(&source(""), &battery.cases[0]).await.unwrap_err();
        assert_eq!(err, CaseError::Execution("candidate panicked".to_string()));
    }
}
