//! Requirement datasets and configuration scenarios from JSON files

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::analysis::emulator::Scenario;
use crate::policy::{LowLevelConfig, NodeId, Policy, PolicyFilter, PolicyType, Topology};

/// Error type for dataset loading
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Missing field: {0}")]
    MissingField(String),
}

/// One natural-language requirement and the policy it states
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    /// Generated from the policy when absent
    #[serde(default)]
    pub text: String,
    pub policy: Policy,
}

impl Requirement {
    pub fn new(policy: Policy) -> Self {
        Self {
            text: policy.describe(),
            policy,
        }
    }

    pub fn policy_type(&self) -> PolicyType {
        self.policy.policy_type()
    }
}

/// A configuration-generation task on a fixed topology
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigScenario {
    pub name: String,
    pub topology: Topology,
    /// What the operator asks for, in prose
    pub requirements: String,
    #[serde(default)]
    pub scenarios: Vec<Scenario>,
    /// Reference configuration for text comparison when no emulator is used
    #[serde(default)]
    pub expected_configs: Option<LowLevelConfig>,
}

/// Load requirements from a JSON array or a JSON-lines file
pub fn load_requirements_from_file(path: impl AsRef<Path>) -> Result<Vec<Requirement>, LoadError> {
    let content = std::fs::read_to_string(path)?;
    load_requirements_from_string(&content)
}

pub fn load_requirements_from_string(content: &str) -> Result<Vec<Requirement>, LoadError> {
    let trimmed = content.trim_start();
    let requirements: Vec<Requirement> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).map_err(|e| LoadError::Parse(e.to_string()))?
    } else {
        trimmed
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line).map_err(|e| LoadError::Parse(format!("line {}: {}", idx + 1, e)))
            })
            .collect::<Result<_, _>>()?
    };

    Ok(requirements
        .into_iter()
        .map(|requirement| {
            let policy = requirement.policy.canonical();
            let text = if requirement.text.trim().is_empty() {
                policy.describe()
            } else {
                requirement.text
            };
            Requirement { text, policy }
        })
        .collect())
}

/// Load configuration scenarios from a JSON array
pub fn load_scenarios_from_file(path: impl AsRef<Path>) -> Result<Vec<ConfigScenario>, LoadError> {
    let content = std::fs::read_to_string(path)?;
    load_scenarios_from_string(&content)
}

pub fn load_scenarios_from_string(content: &str) -> Result<Vec<ConfigScenario>, LoadError> {
    let scenarios: Vec<ConfigScenario> =
        serde_json::from_str(content).map_err(|e| LoadError::Parse(e.to_string()))?;
    for scenario in &scenarios {
        if scenario.topology.nodes.is_empty() {
            return Err(LoadError::MissingField(format!("{}: topology", scenario.name)));
        }
        if scenario.scenarios.is_empty() && scenario.expected_configs.is_none() {
            return Err(LoadError::MissingField(format!(
                "{}: scenarios or expected_configs",
                scenario.name
            )));
        }
    }
    Ok(scenarios)
}

/// Load a documentation file for prompt augmentation
pub fn load_documents(path: impl AsRef<Path>) -> Result<String, LoadError> {
    Ok(std::fs::read_to_string(path)?)
}

/// Deterministic requirement set over a grid of named hosts
///
/// Used when no dataset file is given. Every host pair yields one
/// requirement per selected type.
pub fn synthetic_requirements(filter: &PolicyFilter, hosts: usize) -> Vec<Requirement> {
    let names: Vec<NodeId> = (0..hosts.max(2)).map(|i| NodeId::new(format!("h{}", i + 1))).collect();
    let routers: Vec<NodeId> = ["r1", "r2", "r3"].iter().map(NodeId::new).collect();

    let mut requirements = Vec::new();
    let mut pair_index = 0usize;
    for (i, source) in names.iter().enumerate() {
        for destination in names.iter().skip(i + 1) {
            let via = &routers[pair_index % routers.len()];
            let alt = &routers[(pair_index + 1) % routers.len()];
            for policy_type in filter.iter() {
                let policy = match policy_type {
                    PolicyType::Reachability => {
                        Policy::reachability(source.clone(), destination.clone(), pair_index % 3 != 2)
                    }
                    PolicyType::Waypoint => Policy::waypoint(source.clone(), destination.clone(), via.clone()),
                    PolicyType::LoadBalance => Policy::load_balance(
                        source.clone(),
                        destination.clone(),
                        vec![(via.clone(), 1.0), (alt.clone(), 1.0)],
                    ),
                    PolicyType::ShortestPath => Policy::shortest_path(
                        source.clone(),
                        destination.clone(),
                        vec![source.clone(), via.clone(), destination.clone()],
                    ),
                };
                requirements.push(Requirement::new(policy));
            }
            pair_index += 1;
        }
    }
    requirements
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_json_array_fills_missing_text() {
        let content = r#"[
            {"text": "h1 must reach h2", "policy": {"type": "reachability", "source": "h1", "destination": "h2", "allowed": true}},
            {"policy": {"type": "waypoint", "source": "h1", "destination": "h3", "via": "r1"}}
        ]"#;
        let requirements = load_requirements_from_string(content).unwrap();
        assert_eq!(requirements.len(), 2);
        assert_eq!(requirements[0].text, "h1 must reach h2");
        assert_eq!(requirements[1].text, "Traffic from h1 to h3 must pass through r1.");
    }

    #[test]
    fn test_load_json_lines_reports_line() {
        let content = concat!(
            r#"{"policy": {"type": "reachability", "source": "h1", "destination": "h2", "allowed": false}}"#,
            "\n\n",
            "not json\n"
        );
        let err = load_requirements_from_string(content).unwrap_err();
        assert!(err.to_string().contains("line 3"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"policy": {{"type": "loadbalancing", "source": "h1", "destination": "h2", "next_hops": {{"r1": 1.0, "r2": 1.0}}}}}}"#
        )
        .unwrap();
        let requirements = load_requirements_from_file(file.path()).unwrap();
        assert_eq!(requirements[0].policy_type(), PolicyType::LoadBalance);
    }

    #[test]
    fn test_scenarios_require_a_reference() {
        let content = r#"[{"name": "ospf", "topology": {"nodes": ["r1", "r2"]}, "requirements": "run OSPF"}]"#;
        assert!(matches!(
            load_scenarios_from_string(content),
            Err(LoadError::MissingField(_))
        ));

        let content = r#"[{"name": "ospf", "topology": {"nodes": ["r1", "r2"]}, "requirements": "run OSPF",
            "scenarios": [{"name": "r1 reaches r2"}]}]"#;
        let scenarios = load_scenarios_from_string(content).unwrap();
        assert_eq!(scenarios[0].scenarios.len(), 1);
    }

    #[test]
    fn test_synthetic_requirements_cover_every_type() {
        let filter: PolicyFilter = "reachability,waypoint".parse().unwrap();
        let requirements = synthetic_requirements(&filter, 4);
        // 6 pairs, 2 types each
        assert_eq!(requirements.len(), 12);
        assert!(requirements.iter().any(|r| r.policy_type() == PolicyType::Waypoint));
    }
}
