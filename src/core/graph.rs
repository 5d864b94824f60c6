//! Worker dependency graph.
//!
//! Records which workers logically depend on which others. The graph is
//! built once when the coordinator is assembled and is read-only afterwards:
//! the coordinator holds it behind an `Arc` without a lock, so runtime
//! mutation is impossible by construction.

use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap};

use crate::core::worker::WorkerId;
use crate::error::{Error, Result};

/// Dependency graph over worker ids.
///
/// An edge `a -> b` means `b` depends on `a`: `a` must be coordinated
/// before `b`.
pub struct DependencyGraph {
    graph: DiGraph<WorkerId, ()>,
    index: HashMap<WorkerId, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Add a worker node, returning the existing index if already present.
    pub fn add_worker(&mut self, id: &WorkerId) -> NodeIndex {
        if let Some(&index) = self.index.get(id) {
            return index;
        }
        let index = self.graph.add_node(id.clone());
        self.index.insert(id.clone(), index);
        index
    }

    /// Declare that `worker` depends on `dependency`.
    ///
    /// Both nodes are created on demand. Duplicate edges are ignored.
    ///
    /// # Errors
    /// Returns `DependencyCycle` if the edge would close a cycle; the graph
    /// is left unchanged in that case.
    pub fn add_dependency(&mut self, worker: &WorkerId, dependency: &WorkerId) -> Result<()> {
        if worker == dependency {
            return Err(Error::DependencyCycle {
                from: dependency.clone(),
                to: worker.clone(),
            });
        }

        let from = self.add_worker(dependency);
        let to = self.add_worker(worker);
        if self.graph.find_edge(from, to).is_some() {
            return Ok(());
        }

        // Temporarily add the edge to check for cycles
        let edge = self.graph.add_edge(from, to, ());
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::DependencyCycle {
                from: dependency.clone(),
                to: worker.clone(),
            });
        }
        Ok(())
    }

    /// Declare several dependencies for one worker.
    pub fn depends_on<'a, I>(&mut self, worker: &WorkerId, dependencies: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a WorkerId>,
    {
        for dependency in dependencies {
            self.add_dependency(worker, dependency)?;
        }
        Ok(())
    }

    /// Workers that `id` depends on.
    pub fn dependencies_of(&self, id: &WorkerId) -> BTreeSet<WorkerId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Workers that depend on `id`.
    pub fn dependents_of(&self, id: &WorkerId) -> BTreeSet<WorkerId> {
        self.neighbors(id, Direction::Outgoing)
    }

    pub fn has_dependency(&self, worker: &WorkerId, dependency: &WorkerId) -> bool {
        match (self.index.get(dependency), self.index.get(worker)) {
            (Some(&from), Some(&to)) => self.graph.find_edge(from, to).is_some(),
            _ => false,
        }
    }

    /// All `(worker, dependency)` pairs, ordered.
    pub fn edges(&self) -> Vec<(WorkerId, WorkerId)> {
        let mut edges: Vec<(WorkerId, WorkerId)> = self
            .graph
            .edge_indices()
            .filter_map(|edge| {
                let (from, to) = self.graph.edge_endpoints(edge)?;
                Some((self.graph[to].clone(), self.graph[from].clone()))
            })
            .collect();
        edges.sort();
        edges
    }

    /// Workers in an order where each comes after everything it depends on.
    pub fn coordination_order(&self) -> Result<Vec<WorkerId>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            Error::Validation(format!(
                "Cycle detected at worker: {}",
                self.graph[cycle.node_id()]
            ))
        })?;
        Ok(sorted
            .into_iter()
            .map(|index| self.graph[index].clone())
            .collect())
    }

    pub fn worker_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    fn neighbors(&self, id: &WorkerId, direction: Direction) -> BTreeSet<WorkerId> {
        match self.index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .map(|n| self.graph[n].clone())
                .collect(),
            None => BTreeSet::new(),
        }
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("workers", &self.worker_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
