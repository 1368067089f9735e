//! Task generators: turn datasets into prompt instances per run

use std::collections::BTreeSet;
use std::sync::Arc;

use super::categories::Experiment;
use super::loader::{ConfigScenario, Requirement};
use super::prompts::{self, RagContext};
use super::{SubRequest, TaskError, TaskInstance};
use crate::analysis::code_check::Battery;
use crate::analysis::equivalence::Expected;
use crate::policy::{Policy, PolicyFilter, PolicySet, PolicyType};

/// Source of the prompt instances for one experiment
pub trait TaskGenerator: Send + Sync {
    fn experiment(&self) -> Experiment;

    /// Instances for one run; ids are stable across runs
    fn instances(&self, run_index: u32) -> Result<Vec<TaskInstance>, TaskError>;
}

/// Pick up to `max_n / |types|` requirements of every selected type,
/// rotating the starting point with the iteration so runs see different
/// samples, and interleave them type by type
pub fn pick_sample(
    max_n: usize,
    dataset: &[Requirement],
    iteration: u32,
    filter: &PolicyFilter,
) -> Result<Vec<Requirement>, TaskError> {
    let per_type = max_n / filter.len().max(1);
    let mut columns: Vec<Vec<Requirement>> = Vec::with_capacity(filter.len());

    for policy_type in filter.iter() {
        let pool: Vec<&Requirement> = dataset.iter().filter(|r| r.policy_type() == policy_type).collect();
        if pool.is_empty() {
            return Err(TaskError::EmptyDataset(policy_type.to_string()));
        }
        let take = per_type.min(pool.len());
        let start = (iteration as usize * take) % pool.len();
        columns.push(
            (0..take)
                .map(|offset| pool[(start + offset) % pool.len()].clone())
                .collect(),
        );
    }

    let rows = columns.iter().map(Vec::len).max().unwrap_or(0);
    let mut sample = Vec::with_capacity(max_n);
    for row in 0..rows {
        for column in &columns {
            if let Some(requirement) = column.get(row) {
                sample.push(requirement.clone());
            }
        }
    }
    Ok(sample)
}

pub fn chunk_list<T: Clone>(items: &[T], size: usize) -> Vec<Vec<T>> {
    items.chunks(size.max(1)).map(<[T]>::to_vec).collect()
}

/// Plant a contradiction: the opposite of the first reachability requirement
///
/// Returns whether the chunk now contains a conflict.
pub fn insert_conflict(chunk: &mut Vec<Requirement>) -> bool {
    let opposite = chunk.iter().find_map(|r| match &r.policy {
        Policy::Reachability {
            source,
            destination,
            allowed,
        } => Some(Policy::reachability(source.clone(), destination.clone(), !allowed)),
        _ => None,
    });
    let Some(opposite) = opposite else {
        return false;
    };
    chunk.push(Requirement::new(opposite));
    let set: PolicySet = chunk.iter().map(|r| r.policy.clone()).collect();
    !set.conflicts().is_empty()
}

fn check_batch_sizes(batch_sizes: &[usize]) -> Result<(), TaskError> {
    if batch_sizes.is_empty() || batch_sizes.contains(&0) {
        return Err(TaskError::ZeroBatch);
    }
    Ok(())
}

/// Natural-language to policy translation in batches
pub struct TranslationGenerator {
    dataset: Vec<Requirement>,
    filter: PolicyFilter,
    batch_sizes: Vec<usize>,
}

impl TranslationGenerator {
    pub fn new(dataset: Vec<Requirement>, filter: PolicyFilter, batch_sizes: Vec<usize>) -> Result<Self, TaskError> {
        filter.validate_for_translation()?;
        check_batch_sizes(&batch_sizes)?;
        Ok(Self {
            dataset,
            filter,
            batch_sizes,
        })
    }

    fn max_requirements(&self) -> usize {
        self.batch_sizes.iter().copied().max().unwrap_or(1) * self.filter.len()
    }
}

impl TaskGenerator for TranslationGenerator {
    fn experiment(&self) -> Experiment {
        Experiment::Translation
    }

    fn instances(&self, run_index: u32) -> Result<Vec<TaskInstance>, TaskError> {
        let sample = pick_sample(self.max_requirements(), &self.dataset, run_index, &self.filter)?;
        let label = self.filter.label();
        let mut instances = Vec::new();

        for &batch_size in &self.batch_sizes {
            for (chunk_index, chunk) in chunk_list(&sample, batch_size * self.filter.len())
                .into_iter()
                .enumerate()
            {
                let id = format!("translation-{}-b{}-c{}", label, batch_size, chunk_index);
                let texts: Vec<&str> = chunk.iter().map(|r| r.text.as_str()).collect();
                let requests = chunk
                    .iter()
                    .enumerate()
                    .map(|(j, requirement)| SubRequest {
                        id: format!("{}-r{}", id, j),
                        expected: Expected::Policies(PolicySet::from(vec![requirement.policy.clone()])),
                        keys: BTreeSet::from([requirement.policy.key()]),
                    })
                    .collect();

                instances.push(TaskInstance {
                    messages: prompts::translation_messages(&self.filter, &texts),
                    functions: prompts::function_schemas(&self.filter),
                    json_mode: true,
                    filter: self.filter.clone(),
                    experiment: Experiment::Translation,
                    run_index,
                    batch_size,
                    requests,
                    id,
                });
            }
        }
        Ok(instances)
    }
}

/// Translation batches where every other chunk carries a planted conflict
pub struct ConflictGenerator {
    dataset: Vec<Requirement>,
    filter: PolicyFilter,
    batch_sizes: Vec<usize>,
}

impl ConflictGenerator {
    pub fn new(dataset: Vec<Requirement>, filter: PolicyFilter, batch_sizes: Vec<usize>) -> Result<Self, TaskError> {
        filter.validate_for_translation()?;
        check_batch_sizes(&batch_sizes)?;
        Ok(Self {
            dataset,
            filter,
            batch_sizes,
        })
    }
}

impl TaskGenerator for ConflictGenerator {
    fn experiment(&self) -> Experiment {
        Experiment::Conflict
    }

    fn instances(&self, run_index: u32) -> Result<Vec<TaskInstance>, TaskError> {
        let max_n = self.batch_sizes.iter().copied().max().unwrap_or(1) * self.filter.len();
        let sample = pick_sample(max_n, &self.dataset, run_index, &self.filter)?;
        let label = self.filter.label();
        let mut functions = prompts::function_schemas(&self.filter);
        functions.push(prompts::report_conflict_schema());
        let mut instances = Vec::new();

        for &batch_size in &self.batch_sizes {
            let mut chunks = chunk_list(&sample, batch_size * self.filter.len());
            // a single chunk is repeated so both the conflict and the clean case are asked
            if chunks.len() == 1 {
                chunks.push(chunks[0].clone());
            }

            let mut plant = true;
            for (chunk_index, mut chunk) in chunks.into_iter().enumerate() {
                if plant {
                    insert_conflict(&mut chunk);
                }
                plant = !plant;

                let id = format!("conflict-{}-b{}-c{}", label, batch_size, chunk_index);
                let texts: Vec<&str> = chunk.iter().map(|r| r.text.as_str()).collect();
                let policies: PolicySet = chunk.iter().map(|r| r.policy.clone()).collect();
                let conflict = !policies.conflicts().is_empty();
                let keys = policies.iter().map(Policy::key).collect();

                instances.push(TaskInstance {
                    messages: prompts::conflict_messages(&self.filter, &texts),
                    functions: functions.clone(),
                    json_mode: true,
                    filter: self.filter.clone(),
                    experiment: Experiment::Conflict,
                    run_index,
                    batch_size,
                    requests: vec![SubRequest {
                        id: format!("{}-r0", id),
                        expected: Expected::Conflict { conflict, policies },
                        keys,
                    }],
                    id,
                });
            }
        }
        Ok(instances)
    }
}

/// Routing-algorithm generation, one instance per algorithm
pub struct CodeGenerator {
    batteries: Vec<(PolicyType, Arc<Battery>)>,
}

impl CodeGenerator {
    pub fn new(kinds: impl IntoIterator<Item = PolicyType>) -> Self {
        Self {
            batteries: kinds
                .into_iter()
                .map(|kind| (kind, Arc::new(Battery::for_kind(kind))))
                .collect(),
        }
    }
}

impl TaskGenerator for CodeGenerator {
    fn experiment(&self) -> Experiment {
        Experiment::Code
    }

    fn instances(&self, run_index: u32) -> Result<Vec<TaskInstance>, TaskError> {
        Ok(self
            .batteries
            .iter()
            .map(|(kind, battery)| {
                let id = format!("code-{}", kind);
                TaskInstance {
                    messages: prompts::code_messages(*kind),
                    functions: Vec::new(),
                    json_mode: false,
                    filter: PolicyFilter::new([*kind]),
                    experiment: Experiment::Code,
                    run_index,
                    batch_size: 1,
                    requests: vec![SubRequest {
                        id: format!("{}-r0", id),
                        expected: Expected::Code(battery.clone()),
                        keys: BTreeSet::new(),
                    }],
                    id,
                }
            })
            .collect())
    }
}

/// Device configuration generation over fixed topologies
pub struct ConfigGenerator {
    scenarios: Vec<ConfigScenario>,
    rag: RagContext,
    text_reference: bool,
}

impl ConfigGenerator {
    pub fn new(scenarios: Vec<ConfigScenario>) -> Self {
        Self {
            scenarios,
            rag: RagContext::off(),
            text_reference: false,
        }
    }

    pub fn with_rag(mut self, rag: RagContext) -> Self {
        self.rag = rag;
        self
    }

    /// Score against `expected_configs` text where a scenario has one
    pub fn with_text_reference(mut self, enabled: bool) -> Self {
        self.text_reference = enabled;
        self
    }

    fn expected(&self, scenario: &ConfigScenario) -> Expected {
        match &scenario.expected_configs {
            Some(configs) if self.text_reference || scenario.scenarios.is_empty() => {
                Expected::ConfigText(configs.clone())
            }
            _ => Expected::Emulation {
                topology: scenario.topology.clone(),
                scenarios: scenario.scenarios.clone(),
            },
        }
    }
}

impl TaskGenerator for ConfigGenerator {
    fn experiment(&self) -> Experiment {
        Experiment::Config
    }

    fn instances(&self, run_index: u32) -> Result<Vec<TaskInstance>, TaskError> {
        Ok(self
            .scenarios
            .iter()
            .map(|scenario| {
                let id = format!("config-{}", scenario.name);
                let context = self.rag.context_for(&scenario.requirements);
                TaskInstance {
                    messages: prompts::config_messages(scenario, context.as_deref()),
                    functions: Vec::new(),
                    json_mode: true,
                    filter: PolicyFilter::all(),
                    experiment: Experiment::Config,
                    run_index,
                    batch_size: 1,
                    requests: vec![SubRequest {
                        id: format!("{}-r0", id),
                        expected: self.expected(scenario),
                        keys: BTreeSet::new(),
                    }],
                    id,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Topology;
    use crate::tasks::loader::synthetic_requirements;

    fn filter() -> PolicyFilter {
        "reachability,waypoint".parse().unwrap()
    }

    #[test]
    fn test_pick_sample_interleaves_types() {
        let dataset = synthetic_requirements(&filter(), 5);
        let sample = pick_sample(6, &dataset, 0, &filter()).unwrap();
        assert_eq!(sample.len(), 6);
        let types: Vec<PolicyType> = sample.iter().map(Requirement::policy_type).collect();
        assert_eq!(
            types,
            vec![
                PolicyType::Reachability,
                PolicyType::Waypoint,
                PolicyType::Reachability,
                PolicyType::Waypoint,
                PolicyType::Reachability,
                PolicyType::Waypoint,
            ]
        );
    }

    #[test]
    fn test_pick_sample_rotates_with_iteration() {
        let dataset = synthetic_requirements(&filter(), 5);
        let first = pick_sample(4, &dataset, 0, &filter()).unwrap();
        let second = pick_sample(4, &dataset, 1, &filter()).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_pick_sample_requires_every_type() {
        let dataset = synthetic_requirements(&"reachability".parse().unwrap(), 3);
        assert!(matches!(
            pick_sample(4, &dataset, 0, &filter()),
            Err(TaskError::EmptyDataset(_))
        ));
    }

    #[test]
    fn test_chunk_list() {
        let chunks = chunk_list(&[1, 2, 3, 4, 5], 2);
        assert_eq!(chunks, vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[test]
    fn test_insert_conflict_flips_reachability() {
        let mut chunk = vec![
            Requirement::new(Policy::waypoint("h1", "h2", "r1")),
            Requirement::new(Policy::reachability("h1", "h3", true)),
        ];
        assert!(insert_conflict(&mut chunk));
        assert_eq!(chunk.last().unwrap().policy, Policy::reachability("h1", "h3", false));

        let mut no_reachability = vec![Requirement::new(Policy::waypoint("h1", "h2", "r1"))];
        assert!(!insert_conflict(&mut no_reachability));
        assert_eq!(no_reachability.len(), 1);
    }

    #[test]
    fn test_translation_instances_one_request_per_requirement() {
        let dataset = synthetic_requirements(&filter(), 5);
        let generator = TranslationGenerator::new(dataset, filter(), vec![1, 2]).unwrap();
        let instances = generator.instances(0).unwrap();

        // sample of 2*2 requirements: 2 chunks of batch 1, 1 chunk of batch 2
        assert_eq!(instances.len(), 3);
        assert_eq!(instances[0].requests.len(), 2);
        assert_eq!(instances[2].requests.len(), 4);
        assert_eq!(instances[0].requests[1].id, "translation-reachability_waypoint-b1-c0-r1");

        let ids: BTreeSet<&str> = instances
            .iter()
            .flat_map(|i| i.requests.iter().map(|r| r.id.as_str()))
            .collect();
        assert_eq!(ids.len(), 8);
    }

    #[test]
    fn test_translation_rejects_invalid_filter() {
        let dataset = synthetic_requirements(&PolicyFilter::all(), 3);
        assert!(TranslationGenerator::new(dataset.clone(), "waypoint".parse().unwrap(), vec![1]).is_err());
        assert!(TranslationGenerator::new(dataset, filter(), vec![0]).is_err());
    }

    #[test]
    fn test_conflict_chunks_alternate() {
        let dataset = synthetic_requirements(&filter(), 5);
        let generator = ConflictGenerator::new(dataset, filter(), vec![2]).unwrap();
        let instances = generator.instances(0).unwrap();

        // one chunk is duplicated: first with the planted conflict, then clean
        assert_eq!(instances.len(), 2);
        let flags: Vec<bool> = instances
            .iter()
            .map(|i| match &i.requests[0].expected {
                Expected::Conflict { conflict, .. } => *conflict,
                _ => panic!("expected a conflict task"),
            })
            .collect();
        assert_eq!(flags, vec![true, false]);
        assert!(instances[0].functions.iter().any(|f| f.name == "report_conflict"));
    }

    #[test]
    fn test_conflict_flag_includes_dataset_conflicts() {
        // pair h1-h4 is blocked and also carries a waypoint
        let dataset = synthetic_requirements(&filter(), 5);
        let generator = ConflictGenerator::new(dataset, filter(), vec![3]).unwrap();
        let instances = generator.instances(0).unwrap();

        assert_eq!(instances.len(), 2);
        for instance in &instances {
            match &instance.requests[0].expected {
                Expected::Conflict { conflict, policies } => {
                    assert!(*conflict, "{} should be labelled conflicting", instance.id);
                    assert_eq!(*conflict, !policies.conflicts().is_empty());
                }
                _ => panic!("expected a conflict task"),
            }
        }
    }

    #[test]
    fn test_code_instances_carry_batteries() {
        let generator = CodeGenerator::new([PolicyType::ShortestPath, PolicyType::Reachability]);
        let instances = generator.instances(3).unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].id, "code-shortest_path");
        assert_eq!(instances[0].run_index, 3);
        assert!(matches!(&instances[0].requests[0].expected, Expected::Code(b) if !b.is_empty()));
    }

    #[test]
    fn test_config_expected_follows_reference() {
        let scenario = ConfigScenario {
            name: "ospf".to_string(),
            topology: Topology::new().with_link("r1", "r2", 1),
            requirements: "Run OSPF on every router".to_string(),
            scenarios: vec![crate::analysis::emulator::Scenario {
                name: "r1 reaches r2".to_string(),
                description: None,
                params: serde_json::Value::Null,
            }],
            expected_configs: Some(crate::policy::LowLevelConfig::new().with_device("r1", "router ospf 1")),
        };

        let generator = ConfigGenerator::new(vec![scenario.clone()]);
        let instance = &generator.instances(0).unwrap()[0];
        assert!(matches!(instance.requests[0].expected, Expected::Emulation { .. }));
        assert!(instance.messages.last().unwrap().content.contains("r1 -- r2"));

        let generator = ConfigGenerator::new(vec![scenario]).with_text_reference(true);
        let instance = &generator.instances(0).unwrap()[0];
        assert!(matches!(instance.requests[0].expected, Expected::ConfigText(_)));
    }
}
