//! Policy model for network requirements
//!
//! A [`Policy`] is one declarative rule (reachability, waypoint, load balance
//! or shortest path). A [`PolicySet`] is the full answer for a task instance
//! and compares as a set: insertion order never matters, exact duplicates
//! collapse, and only the hop sequence of a shortest path is order-sensitive.

pub mod device;
pub mod topology;

pub use device::{normalize_config_text, LowLevelConfig};
pub use topology::{Link, Topology};

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of a node (router, host or subnet) in a requirement
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for NodeId {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl From<&str> for NodeId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<NodeId> for String {
    fn from(node: NodeId) -> Self {
        node.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of policy, also used as the experiment-level filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyType {
    Reachability,
    Waypoint,
    #[serde(rename = "loadbalancing", alias = "load_balance")]
    LoadBalance,
    ShortestPath,
}

impl PolicyType {
    pub fn all() -> Vec<PolicyType> {
        vec![
            PolicyType::Reachability,
            PolicyType::Waypoint,
            PolicyType::LoadBalance,
            PolicyType::ShortestPath,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyType::Reachability => "reachability",
            PolicyType::Waypoint => "waypoint",
            PolicyType::LoadBalance => "loadbalancing",
            PolicyType::ShortestPath => "shortest_path",
        }
    }

    /// Name of the function a model calls to emit a policy of this type
    pub fn call_name(&self) -> &'static str {
        match self {
            PolicyType::Reachability => "add_reachability",
            PolicyType::Waypoint => "add_waypoint",
            PolicyType::LoadBalance => "add_load_balance",
            PolicyType::ShortestPath => "add_shortest_path",
        }
    }

    /// Map a function-call name back to its policy type
    pub fn from_call_name(name: &str) -> Option<PolicyType> {
        let name = name.trim().to_lowercase();
        name.strip_prefix("add_")?.parse().ok()
    }
}

impl std::str::FromStr for PolicyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "reachability" | "reach" => Ok(PolicyType::Reachability),
            "waypoint" | "waypoints" => Ok(PolicyType::Waypoint),
            "loadbalancing" | "load_balancing" | "load_balance" | "loadbalance" => {
                Ok(PolicyType::LoadBalance)
            }
            "shortest_path" | "shortestpath" | "path" => Ok(PolicyType::ShortestPath),
            _ => Err(format!("Unknown policy type: {}", s)),
        }
    }
}

impl fmt::Display for PolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a requirement: the policy type and the endpoints it constrains
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PolicyKey {
    pub policy_type: PolicyType,
    pub source: NodeId,
    pub destination: NodeId,
}

/// One declarative network-behaviour rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Policy {
    Reachability {
        source: NodeId,
        destination: NodeId,
        allowed: bool,
    },
    Waypoint {
        source: NodeId,
        destination: NodeId,
        via: NodeId,
    },
    #[serde(rename = "loadbalancing", alias = "load_balance")]
    LoadBalance {
        source: NodeId,
        destination: NodeId,
        next_hops: BTreeMap<NodeId, f64>,
    },
    ShortestPath {
        source: NodeId,
        destination: NodeId,
        hops: Vec<NodeId>,
    },
}

impl Policy {
    pub fn reachability(source: impl Into<NodeId>, destination: impl Into<NodeId>, allowed: bool) -> Self {
        Policy::Reachability {
            source: source.into(),
            destination: destination.into(),
            allowed,
        }
    }

    pub fn waypoint(source: impl Into<NodeId>, destination: impl Into<NodeId>, via: impl Into<NodeId>) -> Self {
        Policy::Waypoint {
            source: source.into(),
            destination: destination.into(),
            via: via.into(),
        }
    }

    /// Build a load-balance policy; weights are normalised to sum to one
    pub fn load_balance<I, N>(source: impl Into<NodeId>, destination: impl Into<NodeId>, next_hops: I) -> Self
    where
        I: IntoIterator<Item = (N, f64)>,
        N: Into<NodeId>,
    {
        let mut hops = BTreeMap::new();
        for (node, weight) in next_hops {
            *hops.entry(node.into()).or_insert(0.0) += weight;
        }
        Policy::LoadBalance {
            source: source.into(),
            destination: destination.into(),
            next_hops: normalize_weights(hops),
        }
    }

    pub fn shortest_path<I, N>(source: impl Into<NodeId>, destination: impl Into<NodeId>, hops: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<NodeId>,
    {
        Policy::ShortestPath {
            source: source.into(),
            destination: destination.into(),
            hops: hops.into_iter().map(Into::into).collect(),
        }
    }

    pub fn policy_type(&self) -> PolicyType {
        match self {
            Policy::Reachability { .. } => PolicyType::Reachability,
            Policy::Waypoint { .. } => PolicyType::Waypoint,
            Policy::LoadBalance { .. } => PolicyType::LoadBalance,
            Policy::ShortestPath { .. } => PolicyType::ShortestPath,
        }
    }

    pub fn source(&self) -> &NodeId {
        match self {
            Policy::Reachability { source, .. }
            | Policy::Waypoint { source, .. }
            | Policy::LoadBalance { source, .. }
            | Policy::ShortestPath { source, .. } => source,
        }
    }

    pub fn destination(&self) -> &NodeId {
        match self {
            Policy::Reachability { destination, .. }
            | Policy::Waypoint { destination, .. }
            | Policy::LoadBalance { destination, .. }
            | Policy::ShortestPath { destination, .. } => destination,
        }
    }

    pub fn key(&self) -> PolicyKey {
        PolicyKey {
            policy_type: self.policy_type(),
            source: self.source().clone(),
            destination: self.destination().clone(),
        }
    }

    /// Canonical form: load-balance weights re-normalised
    pub fn canonical(self) -> Self {
        match self {
            Policy::LoadBalance {
                source,
                destination,
                next_hops,
            } => Policy::LoadBalance {
                source,
                destination,
                next_hops: normalize_weights(next_hops),
            },
            other => other,
        }
    }

    /// Total order used to keep policy sets sorted and deduplicated
    pub fn canonical_cmp(&self, other: &Self) -> Ordering {
        self.policy_type()
            .cmp(&other.policy_type())
            .then_with(|| self.source().cmp(other.source()))
            .then_with(|| self.destination().cmp(other.destination()))
            .then_with(|| match (self, other) {
                (Policy::Reachability { allowed: a, .. }, Policy::Reachability { allowed: b, .. }) => a.cmp(b),
                (Policy::Waypoint { via: a, .. }, Policy::Waypoint { via: b, .. }) => a.cmp(b),
                (Policy::ShortestPath { hops: a, .. }, Policy::ShortestPath { hops: b, .. }) => a.cmp(b),
                (Policy::LoadBalance { next_hops: a, .. }, Policy::LoadBalance { next_hops: b, .. }) => {
                    for ((node_a, weight_a), (node_b, weight_b)) in a.iter().zip(b.iter()) {
                        let ord = node_a.cmp(node_b).then_with(|| weight_a.total_cmp(weight_b));
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                    a.len().cmp(&b.len())
                }
                _ => Ordering::Equal,
            })
    }

    /// Natural-language rendering used when building prompts
    pub fn describe(&self) -> String {
        match self {
            Policy::Reachability {
                source,
                destination,
                allowed: true,
            } => format!("Traffic from {} to {} must be allowed.", source, destination),
            Policy::Reachability {
                source,
                destination,
                allowed: false,
            } => format!("Traffic from {} to {} must be blocked.", source, destination),
            Policy::Waypoint {
                source,
                destination,
                via,
            } => format!("Traffic from {} to {} must pass through {}.", source, destination, via),
            Policy::LoadBalance {
                source,
                destination,
                next_hops,
            } => {
                let hops: Vec<String> = next_hops
                    .iter()
                    .map(|(node, weight)| format!("{} ({:.0}%)", node, weight * 100.0))
                    .collect();
                format!(
                    "Traffic from {} to {} must be balanced across {}.",
                    source,
                    destination,
                    hops.join(", ")
                )
            }
            Policy::ShortestPath {
                source,
                destination,
                hops,
            } => {
                let hops: Vec<&str> = hops.iter().map(NodeId::as_str).collect();
                format!(
                    "Traffic from {} to {} must follow the path {}.",
                    source,
                    destination,
                    hops.join(" -> ")
                )
            }
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::Reachability {
                source,
                destination,
                allowed,
            } => write!(f, "reachability({}, {}, {})", source, destination, allowed),
            Policy::Waypoint {
                source,
                destination,
                via,
            } => write!(f, "waypoint({}, {}, via={})", source, destination, via),
            Policy::LoadBalance {
                source,
                destination,
                next_hops,
            } => {
                let hops: Vec<String> = next_hops
                    .iter()
                    .map(|(node, weight)| format!("{}={:.3}", node, weight))
                    .collect();
                write!(f, "loadbalancing({}, {}, [{}])", source, destination, hops.join(", "))
            }
            Policy::ShortestPath {
                source,
                destination,
                hops,
            } => {
                let hops: Vec<&str> = hops.iter().map(NodeId::as_str).collect();
                write!(f, "shortest_path({}, {}, [{}])", source, destination, hops.join(", "))
            }
        }
    }
}

fn normalize_weights(next_hops: BTreeMap<NodeId, f64>) -> BTreeMap<NodeId, f64> {
    let total: f64 = next_hops.values().sum();
    if !total.is_finite() || total <= 0.0 {
        return next_hops;
    }
    next_hops
        .into_iter()
        .map(|(node, weight)| (node, weight / total))
        .collect()
}

/// Unordered collection of policies forming one answer
///
/// Stored sorted under [`Policy::canonical_cmp`], so equality is set equality.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Policy>", into = "Vec<Policy>")]
pub struct PolicySet {
    policies: Vec<Policy>,
}

impl PolicySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a policy; returns false when an identical policy is already present
    pub fn insert(&mut self, policy: Policy) -> bool {
        let policy = policy.canonical();
        match self
            .policies
            .binary_search_by(|existing| existing.canonical_cmp(&policy))
        {
            Ok(_) => false,
            Err(pos) => {
                self.policies.insert(pos, policy);
                true
            }
        }
    }

    pub fn extend(&mut self, other: PolicySet) {
        for policy in other.policies {
            self.insert(policy);
        }
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Policy> {
        self.policies.iter()
    }

    pub fn contains(&self, policy: &Policy) -> bool {
        self.policies
            .binary_search_by(|existing| existing.canonical_cmp(policy))
            .is_ok()
    }

    pub fn of_type(&self, policy_type: PolicyType) -> impl Iterator<Item = &Policy> {
        self.policies
            .iter()
            .filter(move |p| p.policy_type() == policy_type)
    }

    pub fn types(&self) -> BTreeSet<PolicyType> {
        self.policies.iter().map(Policy::policy_type).collect()
    }

    /// Requirements in this set that contradict each other
    pub fn conflicts(&self) -> Vec<Conflict> {
        let mut reachability: BTreeMap<(&NodeId, &NodeId), BTreeSet<bool>> = BTreeMap::new();
        for policy in &self.policies {
            if let Policy::Reachability {
                source,
                destination,
                allowed,
            } = policy
            {
                reachability
                    .entry((source, destination))
                    .or_default()
                    .insert(*allowed);
            }
        }

        let mut conflicts = Vec::new();
        for ((source, destination), verdicts) in &reachability {
            if verdicts.len() > 1 {
                conflicts.push(Conflict {
                    source: (*source).clone(),
                    destination: (*destination).clone(),
                    description: format!(
                        "traffic from {} to {} is both allowed and blocked",
                        source, destination
                    ),
                });
            }
        }

        for policy in &self.policies {
            if policy.policy_type() == PolicyType::Reachability {
                continue;
            }
            let denied = reachability
                .get(&(policy.source(), policy.destination()))
                .map(|verdicts| verdicts.len() == 1 && verdicts.contains(&false))
                .unwrap_or(false);
            if denied {
                conflicts.push(Conflict {
                    source: policy.source().clone(),
                    destination: policy.destination().clone(),
                    description: format!("{} applies to blocked traffic", policy),
                });
            }
        }

        conflicts
    }

    pub fn into_vec(self) -> Vec<Policy> {
        self.policies
    }
}

impl PartialEq for PolicySet {
    fn eq(&self, other: &Self) -> bool {
        self.policies.len() == other.policies.len()
            && self
                .policies
                .iter()
                .zip(other.policies.iter())
                .all(|(a, b)| a.canonical_cmp(b) == Ordering::Equal)
    }
}

impl FromIterator<Policy> for PolicySet {
    fn from_iter<T: IntoIterator<Item = Policy>>(iter: T) -> Self {
        let mut set = PolicySet::new();
        for policy in iter {
            set.insert(policy);
        }
        set
    }
}

impl From<Vec<Policy>> for PolicySet {
    fn from(policies: Vec<Policy>) -> Self {
        policies.into_iter().collect()
    }
}

impl From<PolicySet> for Vec<Policy> {
    fn from(set: PolicySet) -> Self {
        set.policies
    }
}

impl<'a> IntoIterator for &'a PolicySet {
    type Item = &'a Policy;
    type IntoIter = std::slice::Iter<'a, Policy>;

    fn into_iter(self) -> Self::IntoIter {
        self.policies.iter()
    }
}

/// Two requirements that cannot hold at the same time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub source: NodeId,
    pub destination: NodeId,
    pub description: String,
}

/// Errors raised when an experiment declares an unusable policy filter
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("no policy types selected")]
    Empty,

    #[error("`reachability` is required by every translation experiment")]
    MissingReachability,

    #[error("`loadbalancing` cannot be requested without `waypoint`")]
    LoadBalanceWithoutWaypoint,

    #[error("{0}")]
    Unknown(String),
}

/// Declared set of policy types an experiment asks the model for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyFilter(BTreeSet<PolicyType>);

impl PolicyFilter {
    pub fn new(types: impl IntoIterator<Item = PolicyType>) -> Self {
        Self(types.into_iter().collect())
    }

    pub fn all() -> Self {
        Self::new(PolicyType::all())
    }

    /// Check the combination rules of the translation experiments
    pub fn validate_for_translation(&self) -> Result<(), FilterError> {
        if self.0.is_empty() {
            return Err(FilterError::Empty);
        }
        if !self.0.contains(&PolicyType::Reachability) {
            return Err(FilterError::MissingReachability);
        }
        if self.0.contains(&PolicyType::LoadBalance) && !self.0.contains(&PolicyType::Waypoint) {
            return Err(FilterError::LoadBalanceWithoutWaypoint);
        }
        Ok(())
    }

    pub fn allows(&self, policy_type: PolicyType) -> bool {
        self.0.contains(&policy_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = PolicyType> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Label used in result file names, e.g. `reachability_waypoint`
    pub fn label(&self) -> String {
        self.0
            .iter()
            .map(PolicyType::as_str)
            .collect::<Vec<_>>()
            .join("_")
    }
}

impl std::str::FromStr for PolicyFilter {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let types = s
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(|part| part.parse::<PolicyType>().map_err(FilterError::Unknown))
            .collect::<Result<Vec<_>, _>>()?;
        if types.is_empty() {
            return Err(FilterError::Empty);
        }
        Ok(Self::new(types))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_policies() -> Vec<Policy> {
        vec![
            Policy::reachability("A", "B", true),
            Policy::waypoint("A", "C", "D"),
            Policy::load_balance("A", "E", [("B", 0.5), ("C", 0.5)]),
            Policy::shortest_path("A", "C", ["A", "B", "C"]),
            Policy::reachability("C", "A", false),
        ]
    }

    #[test]
    fn test_set_is_order_independent() {
        let forward: PolicySet = sample_policies().into_iter().collect();
        let mut reversed_input = sample_policies();
        reversed_input.reverse();
        let reversed: PolicySet = reversed_input.into_iter().collect();

        let mut rotated_input = sample_policies();
        rotated_input.rotate_left(2);
        let rotated: PolicySet = rotated_input.into_iter().collect();

        assert_eq!(forward, reversed);
        assert_eq!(forward, rotated);
    }

    #[test]
    fn test_duplicates_collapse() {
        let mut set = PolicySet::new();
        assert!(set.insert(Policy::reachability("A", "B", true)));
        assert!(!set.insert(Policy::reachability("A", "B", true)));
        assert!(!set.insert(Policy::reachability(" A ", "B", true)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_path_order_matters() {
        let abc: PolicySet = vec![Policy::shortest_path("A", "C", ["A", "B", "C"])].into();
        let acb: PolicySet = vec![Policy::shortest_path("A", "C", ["A", "C", "B"])].into();
        assert_ne!(abc, acb);
    }

    #[test]
    fn test_load_balance_weights_normalised() {
        let policy = Policy::load_balance("A", "B", [("C", 60.0), ("D", 40.0)]);
        match policy {
            Policy::LoadBalance { next_hops, .. } => {
                let total: f64 = next_hops.values().sum();
                assert!((total - 1.0).abs() < 1e-9);
                assert!((next_hops[&NodeId::new("C")] - 0.6).abs() < 1e-9);
            }
            _ => panic!("Expected load balance"),
        }
    }

    #[test]
    fn test_detects_conflicts() {
        let set: PolicySet = vec![
            Policy::reachability("A", "B", true),
            Policy::reachability("A", "B", false),
            Policy::reachability("C", "D", false),
            Policy::waypoint("C", "D", "E"),
            Policy::reachability("E", "F", true),
        ]
        .into();

        let conflicts = set.conflicts();
        assert_eq!(conflicts.len(), 2);
        assert!(conflicts.iter().any(|c| c.source.as_str() == "A"));
        assert!(conflicts.iter().any(|c| c.source.as_str() == "C"));
    }

    #[test]
    fn test_filter_rules() {
        let ok: PolicyFilter = "reachability,waypoint,loadbalancing".parse().unwrap();
        assert!(ok.validate_for_translation().is_ok());

        let no_reach: PolicyFilter = "waypoint".parse().unwrap();
        assert_eq!(no_reach.validate_for_translation(), Err(FilterError::MissingReachability));

        let lb_only: PolicyFilter = "reachability,loadbalancing".parse().unwrap();
        assert_eq!(
            lb_only.validate_for_translation(),
            Err(FilterError::LoadBalanceWithoutWaypoint)
        );

        assert!("reachability,teleport".parse::<PolicyFilter>().is_err());
        assert_eq!(ok.label(), "reachability_waypoint_loadbalancing");
    }

    #[test]
    fn test_call_name_mapping() {
        assert_eq!(PolicyType::from_call_name("add_reachability"), Some(PolicyType::Reachability));
        assert_eq!(PolicyType::from_call_name("add_loadbalancing"), Some(PolicyType::LoadBalance));
        assert_eq!(PolicyType::from_call_name("add_load_balance"), Some(PolicyType::LoadBalance));
        assert_eq!(PolicyType::from_call_name("add_shortest_path"), Some(PolicyType::ShortestPath));
        assert_eq!(PolicyType::from_call_name("remove_reachability"), None);
        assert_eq!(PolicyType::from_call_name("add_firewall"), None);
    }

    #[test]
    fn test_serde_roundtrip_keeps_set_semantics() {
        let set: PolicySet = sample_policies().into();
        let json = serde_json::to_string(&set).unwrap();
        let back: PolicySet = serde_json::from_str(&json).unwrap();
        assert_eq!(set, back);
    }
}
