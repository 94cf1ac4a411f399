//! Dependency graph and topological planning shared by builds and deployments.
//!
//! Nodes are identified by name. An edge `A → B` means "B depends on A": A
//! must reach a terminal success state before B may begin.
//!
//! Topological ordering uses Kahn's algorithm with level tracking so that
//! same-level nodes can run concurrently. Ties are broken by name to keep
//! output deterministic.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use crate::error::{BerthError, Result};

/// Directed dependency graph over named nodes.
///
/// Edges are stored in both directions. Cycles are rejected when the graph is
/// built with [`DependencyGraph::from_declarations`] or when an order is
/// requested.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// `dependency → {dependent, ...}`
    downstream: BTreeMap<String, BTreeSet<String>>,
    /// `dependent → {dependency, ...}`
    upstream: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and validate a graph from `(node, dependencies)` declarations.
    ///
    /// Fails with [`BerthError::UnknownDependency`] when a dependency is not
    /// itself declared, and with [`BerthError::CyclicDependency`] when the
    /// declarations contain a cycle.
    pub fn from_declarations<'a, I, D>(declarations: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, D)>,
        D: IntoIterator<Item = &'a str>,
    {
        let declarations: Vec<(&str, Vec<&str>)> = declarations
            .into_iter()
            .map(|(node, deps)| (node, deps.into_iter().collect()))
            .collect();

        let mut graph = Self::new();
        for (node, _) in &declarations {
            graph.add_node(node);
        }
        for (node, deps) in &declarations {
            for dep in deps {
                graph.add_dependency(node, dep)?;
            }
        }
        graph.topological_order()?;
        Ok(graph)
    }

    /// Register a node. Idempotent.
    pub fn add_node(&mut self, id: &str) {
        self.downstream.entry(id.to_string()).or_default();
        self.upstream.entry(id.to_string()).or_default();
    }

    /// Record that `dependent` depends on `dependency`.
    ///
    /// Both nodes must already be registered. Cycles are not checked here;
    /// they surface from [`DependencyGraph::topological_order`].
    pub fn add_dependency(&mut self, dependent: &str, dependency: &str) -> Result<()> {
        if !self.contains(dependent) {
            return Err(BerthError::InvalidDescriptor(format!(
                "{dependent} is not declared"
            )));
        }
        if !self.contains(dependency) {
            return Err(BerthError::UnknownDependency {
                node: dependent.to_string(),
                dependency: dependency.to_string(),
            });
        }
        self.downstream
            .entry(dependency.to_string())
            .or_default()
            .insert(dependent.to_string());
        self.upstream
            .entry(dependent.to_string())
            .or_default()
            .insert(dependency.to_string());
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.upstream.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.upstream.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstream.is_empty()
    }

    /// All node names, sorted.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.upstream.keys().map(String::as_str)
    }

    /// Nodes in dependency order, dependencies first.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        Ok(self.levels()?.into_iter().flatten().collect())
    }

    /// Kahn waves: every node in wave `n` depends only on nodes in earlier waves.
    pub fn levels(&self) -> Result<Vec<Vec<String>>> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .upstream
            .iter()
            .map(|(id, deps)| (id.as_str(), deps.len()))
            .collect();

        let mut current: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();

        let mut levels = Vec::new();
        let mut visited = 0usize;

        while !current.is_empty() {
            visited += current.len();
            let mut next = BTreeSet::new();
            for id in &current {
                for dependent in self.downstream.get(*id).into_iter().flatten() {
                    if let Some(deg) = in_degree.get_mut(dependent.as_str()) {
                        *deg -= 1;
                        if *deg == 0 {
                            next.insert(dependent.as_str());
                        }
                    }
                }
            }
            levels.push(current.iter().map(|s| s.to_string()).collect());
            current = next.into_iter().collect();
        }

        if visited != self.len() {
            let stuck: Vec<&str> = in_degree
                .iter()
                .filter(|(_, &deg)| deg > 0)
                .map(|(&id, _)| id)
                .collect();
            let nodes = self
                .find_cycle(&stuck)
                .unwrap_or_else(|| stuck.iter().map(|s| s.to_string()).collect());
            return Err(BerthError::CyclicDependency { nodes });
        }

        Ok(levels)
    }

    /// Direct dependencies of `id`.
    pub fn dependencies_of(&self, id: &str) -> Vec<&str> {
        self.upstream
            .get(id)
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect()
    }

    /// Direct dependents of `id`.
    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        self.downstream
            .get(id)
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect()
    }

    /// All transitive dependents of `id` (BFS over downstream edges), sorted.
    pub fn transitive_dependents_of(&self, id: &str) -> Vec<String> {
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(id.to_string());

        while let Some(current) = queue.pop_front() {
            for dep in self.downstream.get(&current).into_iter().flatten() {
                if visited.insert(dep.clone()) {
                    queue.push_back(dep.clone());
                }
            }
        }

        visited.into_iter().collect()
    }

    /// Nodes nothing else depends on.
    pub fn terminals(&self) -> Vec<String> {
        self.downstream
            .iter()
            .filter(|(_, dependents)| dependents.is_empty())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// DFS over downstream edges from each candidate. Returns the cycle path
    /// (first node repeated at the end) if one is found.
    fn find_cycle(&self, candidates: &[&str]) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        for start in candidates {
            let mut path = Vec::new();
            if self.dfs_cycle(start, &mut visited, &mut path) {
                let repeated = path.last().cloned()?;
                let from = path.iter().position(|n| *n == repeated)?;
                return Some(path[from..].to_vec());
            }
        }
        None
    }

    fn dfs_cycle(&self, node: &str, visited: &mut HashSet<String>, path: &mut Vec<String>) -> bool {
        if path.iter().any(|n| n == node) {
            path.push(node.to_string());
            return true;
        }
        if visited.contains(node) {
            return false;
        }
        visited.insert(node.to_string());
        path.push(node.to_string());

        for dep in self.downstream.get(node).into_iter().flatten() {
            if self.dfs_cycle(dep, visited, path) {
                return true;
            }
        }

        path.pop();
        false
    }
}
