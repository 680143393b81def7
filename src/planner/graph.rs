//! Dependency planning.
//!
//! Orders resources so every resource comes after everything in its
//! `depends_on` set. Uses Kahn's algorithm; among resources that are ready
//! at the same time the one declared first wins, so identical input always
//! yields identical output.

use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::error::{PlanError, Result, StackformError};
use crate::resource::ResourceSpec;

/// Dependency graph over a resource set.
///
/// Edges pointing outside the set are ignored; validation rejects them for
/// declared sets, and applied-state graphs may legitimately carry them.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Node ids in declaration order.
    ids: Vec<String>,
    /// `deps[i]` holds the indices node `i` depends on.
    deps: Vec<Vec<usize>>,
    /// `dependents[i]` holds the indices that depend on node `i`.
    dependents: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Builds the graph from specs in declaration order.
    #[must_use]
    pub fn new(specs: &[ResourceSpec]) -> Self {
        let index: HashMap<&str, usize> = specs
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();

        let mut deps = vec![Vec::new(); specs.len()];
        let mut dependents = vec![Vec::new(); specs.len()];

        for (i, spec) in specs.iter().enumerate() {
            for dep in &spec.depends_on {
                if let Some(&j) = index.get(dep.as_str()) {
                    deps[i].push(j);
                    dependents[j].push(i);
                }
            }
        }

        Self {
            ids: specs.iter().map(|s| s.id.clone()).collect(),
            deps,
            dependents,
        }
    }

    /// Number of nodes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Ids of every resource that depends on `id`, directly or transitively.
    #[must_use]
    pub fn transitive_dependents(&self, id: &str) -> Vec<String> {
        let Some(start) = self.position(id) else {
            return Vec::new();
        };
        let mut seen = BTreeSet::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            for &next in &self.dependents[node] {
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        seen.into_iter().map(|i| self.ids[i].clone()).collect()
    }

    /// Returns a topological order of node indices.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Cycle`] naming one offending cycle.
    fn order_indices(&self) -> Result<Vec<usize>> {
        let mut in_degree: Vec<usize> = self.deps.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some(node) = ready.pop_first() {
            order.push(node);
            for &next in &self.dependents[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        if order.len() == self.len() {
            Ok(order)
        } else {
            let cycle = self.find_cycle(&in_degree);
            Err(StackformError::Plan(PlanError::Cycle { cycle }))
        }
    }

    /// Topological order of ids.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Cycle`] if the graph is not acyclic.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        Ok(self
            .order_indices()?
            .into_iter()
            .map(|i| self.ids[i].clone())
            .collect())
    }

    /// Groups ids into levels. Level 0 has no dependencies; every other node
    /// sits one level above its deepest dependency, so nodes on one level
    /// never share an edge.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Cycle`] if the graph is not acyclic.
    pub fn levels(&self) -> Result<Vec<Vec<String>>> {
        let depth = self.depths(false)?;
        Ok(self.group_by_depth(&depth))
    }

    /// Levels for tearing the graph down: level 0 has no dependents.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Cycle`] if the graph is not acyclic.
    pub fn teardown_levels(&self) -> Result<Vec<Vec<String>>> {
        let depth = self.depths(true)?;
        Ok(self.group_by_depth(&depth))
    }

    /// Level of each id, keyed by id.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Cycle`] if the graph is not acyclic.
    pub fn level_of(&self, teardown: bool) -> Result<HashMap<String, usize>> {
        let depth = self.depths(teardown)?;
        Ok(self.ids.iter().cloned().zip(depth).collect())
    }

    fn depths(&self, teardown: bool) -> Result<Vec<usize>> {
        let mut order = self.order_indices()?;
        let edges = if teardown {
            // Dependents must be measured before the nodes they depend on.
            order.reverse();
            &self.dependents
        } else {
            &self.deps
        };
        let mut depth = vec![0usize; self.len()];
        for &node in &order {
            depth[node] = edges[node]
                .iter()
                .map(|&d| depth[d] + 1)
                .max()
                .unwrap_or(0);
        }
        Ok(depth)
    }

    fn group_by_depth(&self, depth: &[usize]) -> Vec<Vec<String>> {
        let max = depth.iter().copied().max().map_or(0, |m| m + 1);
        let mut levels = vec![Vec::new(); max];
        for (i, &d) in depth.iter().enumerate() {
            levels[d].push(self.ids[i].clone());
        }
        levels
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.ids.iter().position(|x| x == id)
    }

    /// Walks dependency edges among the nodes Kahn could not emit until a
    /// node repeats, then returns that loop.
    fn find_cycle(&self, in_degree: &[usize]) -> Vec<String> {
        let stuck: Vec<usize> = (0..self.len()).filter(|&i| in_degree[i] > 0).collect();
        let Some(&start) = stuck.first() else {
            return Vec::new();
        };

        let mut path: Vec<usize> = Vec::new();
        let mut on_path: HashMap<usize, usize> = HashMap::new();
        let mut node = start;
        loop {
            if let Some(&pos) = on_path.get(&node) {
                let mut cycle: Vec<String> =
                    path[pos..].iter().map(|&i| self.ids[i].clone()).collect();
                cycle.push(self.ids[node].clone());
                return cycle;
            }
            on_path.insert(node, path.len());
            path.push(node);
            // Every stuck node has at least one stuck dependency.
            match self.deps[node].iter().find(|&&d| in_degree[d] > 0) {
                Some(&next) => node = next,
                None => return path.iter().map(|&i| self.ids[i].clone()).collect(),
            }
        }
    }
}

/// Planner producing creation and deletion orders.
#[derive(Debug, Default, Clone, Copy)]
pub struct DependencyPlanner;

impl DependencyPlanner {
    /// Creates a new planner.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Order in which resources must be created.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Cycle`] if the dependency graph is not acyclic.
    pub fn creation_order(&self, specs: &[ResourceSpec]) -> Result<Vec<String>> {
        let order = DependencyGraph::new(specs).topological_order()?;
        debug!("Creation order: {}", order.join(", "));
        Ok(order)
    }

    /// Order in which resources must be deleted: the reverse of creation.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Cycle`] if the dependency graph is not acyclic.
    pub fn deletion_order(&self, specs: &[ResourceSpec]) -> Result<Vec<String>> {
        let mut order = self.creation_order(specs)?;
        order.reverse();
        Ok(order)
    }

    /// Parallel-eligible levels of the creation order.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Cycle`] if the dependency graph is not acyclic.
    pub fn levels(&self, specs: &[ResourceSpec]) -> Result<Vec<Vec<String>>> {
        DependencyGraph::new(specs).levels()
    }
}
