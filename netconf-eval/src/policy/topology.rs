//! Weighted undirected topologies and the reference routing solver
//!
//! The code-execution battery uses these to precompute the answers a
//! generated routing algorithm must reproduce.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use serde::{Deserialize, Serialize};

use super::NodeId;

/// Upper bound on enumerated equal-cost paths between two nodes
const MAX_ENUMERATED_PATHS: usize = 64;

fn default_cost() -> u32 { 1 }

/// An undirected link with an integer cost
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub a: NodeId,
    pub b: NodeId,
    #[serde(default = "default_cost")]
    pub cost: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub nodes: BTreeSet<NodeId>,
    #[serde(default)]
    pub links: Vec<Link>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(mut self, node: impl Into<NodeId>) -> Self {
        self.nodes.insert(node.into());
        self
    }

    /// Add a link, registering both endpoints as nodes
    pub fn with_link(mut self, a: impl Into<NodeId>, b: impl Into<NodeId>, cost: u32) -> Self {
        let (a, b) = (a.into(), b.into());
        self.nodes.insert(a.clone());
        self.nodes.insert(b.clone());
        self.links.push(Link { a, b, cost });
        self
    }

    fn adjacency(&self) -> BTreeMap<&NodeId, Vec<(&NodeId, u32)>> {
        let mut adj: BTreeMap<&NodeId, Vec<(&NodeId, u32)>> = BTreeMap::new();
        for node in &self.nodes {
            adj.entry(node).or_default();
        }
        for link in &self.links {
            adj.entry(&link.a).or_default().push((&link.b, link.cost));
            adj.entry(&link.b).or_default().push((&link.a, link.cost));
        }
        adj
    }

    /// Dijkstra distances from `source` to every reachable node
    pub fn distances_from(&self, source: &NodeId) -> BTreeMap<NodeId, u64> {
        let adj = self.adjacency();
        let mut dist: BTreeMap<&NodeId, u64> = BTreeMap::new();
        if !adj.contains_key(source) {
            return BTreeMap::new();
        }

        let mut heap = BinaryHeap::new();
        dist.insert(source, 0);
        heap.push(Reverse((0u64, source)));

        while let Some(Reverse((d, node))) = heap.pop() {
            if dist.get(node).is_some_and(|&best| d > best) {
                continue;
            }
            for &(next, cost) in adj.get(node).into_iter().flatten() {
                let candidate = d + u64::from(cost);
                if dist.get(next).map_or(true, |&best| candidate < best) {
                    dist.insert(next, candidate);
                    heap.push(Reverse((candidate, next)));
                }
            }
        }

        dist.into_iter().map(|(node, d)| (node.clone(), d)).collect()
    }

    pub fn is_reachable(&self, source: &NodeId, destination: &NodeId) -> bool {
        self.distances_from(source).contains_key(destination)
    }

    /// Every minimum-cost path from `source` to `destination`, in lexical order
    pub fn shortest_paths(&self, source: &NodeId, destination: &NodeId) -> Vec<Vec<NodeId>> {
        let dist = self.distances_from(source);
        if !dist.contains_key(destination) {
            return Vec::new();
        }
        let adj = self.adjacency();

        // Walk the shortest-path DAG backwards from the destination
        let mut paths = Vec::new();
        let mut stack: Vec<Vec<&NodeId>> = vec![vec![destination]];
        while let Some(partial) = stack.pop() {
            if paths.len() >= MAX_ENUMERATED_PATHS {
                break;
            }
            let head = partial[partial.len() - 1];
            if head == source {
                let mut path: Vec<NodeId> = partial.iter().map(|n| (*n).clone()).collect();
                path.reverse();
                paths.push(path);
                continue;
            }
            let head_dist = dist[head];
            for &(prev, cost) in adj.get(head).into_iter().flatten() {
                let on_dag = dist
                    .get(prev)
                    .is_some_and(|&d| d + u64::from(cost) == head_dist);
                if on_dag && !partial.contains(&prev) {
                    let mut extended = partial.clone();
                    extended.push(prev);
                    stack.push(extended);
                }
            }
        }

        paths.sort();
        paths.dedup();
        paths
    }

    /// The shortest path, only when it is unique
    pub fn unique_shortest_path(&self, source: &NodeId, destination: &NodeId) -> Option<Vec<NodeId>> {
        let mut paths = self.shortest_paths(source, destination);
        if paths.len() == 1 {
            paths.pop()
        } else {
            None
        }
    }

    /// Equal split of traffic over the first hops of all shortest paths
    pub fn ecmp_next_hops(&self, source: &NodeId, destination: &NodeId) -> BTreeMap<NodeId, f64> {
        let first_hops: BTreeSet<NodeId> = self
            .shortest_paths(source, destination)
            .into_iter()
            .filter_map(|path| path.get(1).cloned())
            .collect();
        let share = 1.0 / first_hops.len().max(1) as f64;
        first_hops.into_iter().map(|hop| (hop, share)).collect()
    }
}
