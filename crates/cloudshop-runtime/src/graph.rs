//! Dependency graph over resource names.
//!
//! Edges point from a dependency to its dependent (`vpc → subnet`).
//! Topological order uses Kahn's algorithm with insertion-order tie-breaking,
//! so the same order always yields the same schedule.

use std::collections::{HashMap, VecDeque};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use cloudshop_core::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct Dag {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
    insertion_order: Vec<NodeIndex>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(name, dependencies)` pairs in the given order.
    ///
    /// Every dependency must itself be a node.
    pub fn from_dependencies<'a, I, D>(nodes: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, D)>,
        D: IntoIterator<Item = &'a str>,
    {
        let nodes: Vec<(&str, Vec<&str>)> = nodes
            .into_iter()
            .map(|(name, deps)| (name, deps.into_iter().collect()))
            .collect();

        let mut dag = Self::new();
        for (name, _) in &nodes {
            if dag.index.contains_key(*name) {
                return Err(Error::Validation(format!("duplicate resource name {}", name)));
            }
            dag.add_node(name);
        }
        for (name, deps) in &nodes {
            for dep in deps {
                if !dag.index.contains_key(*dep) {
                    return Err(Error::Validation(format!(
                        "resource {} depends on unknown resource {}",
                        name, dep
                    )));
                }
                dag.add_edge(dep, name)?;
            }
        }
        Ok(dag)
    }

    /// Adds a node; existing nodes are left alone.
    pub fn add_node(&mut self, name: &str) -> NodeIndex {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.graph.add_node(name.to_string());
        self.index.insert(name.to_string(), idx);
        self.insertion_order.push(idx);
        idx
    }

    /// Adds `from → to` (`to` depends on `from`). Duplicate edges are ignored.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<()> {
        let from_idx = self.node(from)?;
        let to_idx = self.node(to)?;
        if self.graph.find_edge(from_idx, to_idx).is_none() {
            self.graph.add_edge(from_idx, to_idx, ());
        }
        Ok(())
    }

    /// Names in dependency order.
    ///
    /// # Errors
    ///
    /// [`Error::DependencyCycle`] listing every node that sits on, or
    /// downstream of, a cycle (self-loops included).
    pub fn toposort(&self) -> Result<Vec<String>> {
        let mut in_degree: HashMap<NodeIndex, usize> =
            self.graph.node_indices().map(|idx| (idx, 0)).collect();
        for edge in self.graph.edge_references() {
            *in_degree.entry(edge.target()).or_insert(0) += 1;
        }

        let mut queue: VecDeque<NodeIndex> = self
            .insertion_order
            .iter()
            .filter(|idx| in_degree.get(idx).copied().unwrap_or(0) == 0)
            .copied()
            .collect();
        let mut result = Vec::with_capacity(self.graph.node_count());

        while let Some(idx) = queue.pop_front() {
            result.push(self.graph[idx].clone());
            for neighbor in self.sorted_neighbors(idx, Direction::Outgoing) {
                if let Some(deg) = in_degree.get_mut(&neighbor) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 {
                        queue.push_back(neighbor);
                    }
                }
            }
        }

        if result.len() != self.graph.node_count() {
            let stuck: Vec<String> = self
                .insertion_order
                .iter()
                .filter(|idx| in_degree.get(idx).copied().unwrap_or(0) > 0)
                .map(|&idx| self.graph[idx].clone())
                .collect();
            return Err(Error::DependencyCycle(stuck));
        }

        Ok(result)
    }

    fn node(&self, name: &str) -> Result<NodeIndex> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("graph node {}", name)))
    }

    fn sorted_neighbors(&self, idx: NodeIndex, direction: Direction) -> Vec<NodeIndex> {
        let mut neighbors: Vec<NodeIndex> = self.graph.neighbors_directed(idx, direction).collect();
        neighbors.sort_by_key(|n| {
            self.insertion_order
                .iter()
                .position(|i| i == n)
                .unwrap_or(usize::MAX)
        });
        neighbors.dedup();
        neighbors
    }
}
